//! SSH container deploy with a proxy-manager front end.
//!
//! Replaces the target host's container over SSH, then registers a
//! proxy-host record with the proxy manager's REST API so the service is
//! reachable under its domain.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use rapidflow_core::{Error, Result};

use crate::provider::{DeployOutcome, DeployRequest, OutputProvider, parse_config};
use crate::ssh::{SshClient, SshConfig, deploy_container};

#[derive(Debug, Deserialize)]
struct VpsConfig {
    #[serde(flatten)]
    ssh: SshConfig,
    image: String,
    container_name: String,
    /// Port the service listens on; published as `port:port` and proxied to.
    forward_port: u16,
    domain: String,
    proxy_url: String,
    proxy_email: String,
    proxy_password: String,
    #[serde(default)]
    ssl_enabled: bool,
    #[serde(default)]
    ssl_email: Option<String>,
    #[serde(default)]
    ssl_force: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

pub struct VpsProvider {
    client: reqwest::Client,
}

impl Default for VpsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VpsProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn authenticate(&self, config: &VpsConfig) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/api/tokens", config.proxy_url.trim_end_matches('/')))
            .json(&serde_json::json!({
                "identity": config.proxy_email,
                "secret": config.proxy_password,
            }))
            .send()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("proxy manager login failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::DeploymentFailed(format!(
                "proxy manager login returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("malformed token response: {e}")))?;
        Ok(token.token)
    }

    async fn register_proxy_host(&self, config: &VpsConfig, token: &str) -> Result<()> {
        let record = serde_json::json!({
            "domain_names": [config.domain],
            "forward_host": "127.0.0.1",
            "forward_port": config.forward_port,
            "ssl_enabled": config.ssl_enabled,
            "ssl_email": config.ssl_email,
            "ssl_force": config.ssl_force,
            "enabled": true,
        });

        let response = self
            .client
            .post(format!(
                "{}/api/nginx/proxy-hosts",
                config.proxy_url.trim_end_matches('/')
            ))
            .bearer_auth(token)
            .json(&record)
            .send()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("proxy host creation failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::DeploymentFailed(format!(
                "proxy host creation returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl OutputProvider for VpsProvider {
    fn output_type(&self) -> &'static str {
        "vps"
    }

    async fn deploy(&self, request: DeployRequest<'_>) -> Result<DeployOutcome> {
        let config: VpsConfig = parse_config(self.output_type(), request.config)?;

        let ssh = SshClient::connect(config.ssh.clone())?;
        deploy_container(
            &ssh,
            &config.image,
            &config.container_name,
            &config.forward_port.to_string(),
        )
        .await?;

        let token = self.authenticate(&config).await?;
        self.register_proxy_host(&config, &token).await?;

        let scheme = if config.ssl_enabled { "https" } else { "http" };
        let url = format!("{scheme}://{}", config.domain);
        info!(container = %config.container_name, %url, "vps deployment complete");

        Ok(DeployOutcome {
            url: Some(url),
            message: Some(format!(
                "container {} running on {}",
                config.container_name, config.ssh.host
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_ssh_fields_rejected() {
        let config = serde_json::json!({
            "image": "registry.example.com/app:1",
            "container_name": "app",
            "forward_port": 3000,
            "domain": "app.example.com",
            "proxy_url": "https://proxy.example.com",
            "proxy_email": "admin@example.com",
            "proxy_password": "secret"
        });
        let err = VpsProvider::new()
            .deploy(DeployRequest {
                runnable_name: "app",
                config: &config,
                artifact_path: "registry.example.com/app:1",
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid vps config"));
    }

    #[test]
    fn config_parses_with_defaults() {
        let value = serde_json::json!({
            "host": "203.0.113.9",
            "user": "deploy",
            "key_path": "/keys/id_ed25519",
            "image": "registry.example.com/app:1",
            "container_name": "app",
            "forward_port": 3000,
            "domain": "app.example.com",
            "proxy_url": "https://proxy.example.com",
            "proxy_email": "admin@example.com",
            "proxy_password": "secret"
        });
        let config: VpsConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.ssh.port, 22);
        assert!(!config.ssl_enabled);
        assert!(!config.ssl_force);
    }
}
