//! Docker-style port-spec parsing.
//!
//! Accepted forms, by colon-splitting:
//! - `"P"`: host and container port are both `P`, bound on `0.0.0.0`
//! - `"H:C"`: host port `H`, container port `C`, bound on `0.0.0.0`
//! - `"IP:H:C"`: as written

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const ANY_IP: &str = "0.0.0.0";

/// A parsed port mapping: host side → container side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_ip: String,
    pub host_port: String,
    pub container_port: String,
}

impl PortMapping {
    /// Parse a Docker-style port spec. Malformed specs return an error
    /// without producing a partial mapping.
    pub fn parse(spec: &str) -> Result<Self> {
        let tokens: Vec<&str> = spec.split(':').collect();
        let mapping = match tokens.as_slice() {
            [port] => Self {
                host_ip: ANY_IP.to_string(),
                host_port: (*port).to_string(),
                container_port: (*port).to_string(),
            },
            [host, container] => Self {
                host_ip: ANY_IP.to_string(),
                host_port: (*host).to_string(),
                container_port: (*container).to_string(),
            },
            [ip, host, container] => Self {
                host_ip: (*ip).to_string(),
                host_port: (*host).to_string(),
                container_port: (*container).to_string(),
            },
            _ => {
                return Err(Error::InvalidInput(format!("invalid port spec: {spec}")));
            }
        };
        mapping.validate(spec)?;
        Ok(mapping)
    }

    fn validate(&self, spec: &str) -> Result<()> {
        if self.host_port.parse::<u16>().is_err() || self.container_port.parse::<u16>().is_err() {
            return Err(Error::InvalidInput(format!("invalid port spec: {spec}")));
        }
        Ok(())
    }

    /// Canonical `ip:host:container` rendering.
    pub fn render(&self) -> String {
        format!("{}:{}:{}", self.host_ip, self.host_port, self.container_port)
    }

    /// The container-side port in Docker's `port/proto` key form.
    pub fn container_key(&self) -> String {
        format!("{}/tcp", self.container_port)
    }
}
