//! SSH container deploy with a native nginx reverse proxy.
//!
//! Runs the same container replacement as the proxy-manager flavor, then
//! writes a virtual-host file, uploads it over SSH, moves it into the
//! configured sites directory, tests the configuration and reloads nginx.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use rapidflow_core::Result;

use crate::provider::{DeployOutcome, DeployRequest, OutputProvider, parse_config};
use crate::ssh::{SshClient, SshConfig, deploy_container};

const DEFAULT_CONFIG_DIR: &str = "/etc/nginx/sites-enabled";
const DEFAULT_RELOAD_COMMAND: &str = "systemctl restart nginx";

#[derive(Debug, Deserialize)]
struct NginxConfig {
    #[serde(flatten)]
    ssh: SshConfig,
    image: String,
    container_name: String,
    /// Port the service listens on; published as `port:port` and proxied to.
    forward_port: u16,
    domain: String,
    #[serde(default)]
    ssl: bool,
    #[serde(default)]
    ssl_certificate: Option<String>,
    #[serde(default)]
    ssl_certificate_key: Option<String>,
    #[serde(default = "default_config_dir")]
    config_dir: String,
    #[serde(default = "default_reload_command")]
    reload_command: String,
}

fn default_config_dir() -> String {
    DEFAULT_CONFIG_DIR.to_string()
}

fn default_reload_command() -> String {
    DEFAULT_RELOAD_COMMAND.to_string()
}

#[derive(Default)]
pub struct NginxProvider;

impl NginxProvider {
    pub fn new() -> Self {
        Self
    }
}

/// Render the virtual-host file: plain HTTP, or an HTTP→HTTPS redirect plus
/// a TLS server block when `ssl` is set.
fn render_vhost(config: &NginxConfig) -> String {
    let proxy_block = format!(
        r#"    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}"#,
        port = config.forward_port
    );

    if config.ssl {
        let certificate = config.ssl_certificate.as_deref().unwrap_or_default();
        let certificate_key = config.ssl_certificate_key.as_deref().unwrap_or_default();
        format!(
            r#"server {{
    listen 80;
    server_name {domain};
    return 301 https://$host$request_uri;
}}

server {{
    listen 443 ssl;
    server_name {domain};
    ssl_certificate {certificate};
    ssl_certificate_key {certificate_key};

{proxy_block}
}}
"#,
            domain = config.domain,
        )
    } else {
        format!(
            r#"server {{
    listen 80;
    server_name {domain};

{proxy_block}
}}
"#,
            domain = config.domain,
        )
    }
}

#[async_trait]
impl OutputProvider for NginxProvider {
    fn output_type(&self) -> &'static str {
        "nginx"
    }

    async fn deploy(&self, request: DeployRequest<'_>) -> Result<DeployOutcome> {
        let config: NginxConfig = parse_config(self.output_type(), request.config)?;

        let ssh = SshClient::connect(config.ssh.clone())?;
        deploy_container(
            &ssh,
            &config.image,
            &config.container_name,
            &config.forward_port.to_string(),
        )
        .await?;

        let vhost = render_vhost(&config);
        let staging_path = format!("/tmp/rapidflow-{}.conf", config.domain);
        let final_path = format!("{}/{}.conf", config.config_dir, config.domain);

        ssh.upload(&vhost, &staging_path).await?;
        ssh.run(&format!("mv '{staging_path}' '{final_path}'")).await?;
        ssh.run("nginx -t").await?;
        ssh.run(&config.reload_command).await?;

        let scheme = if config.ssl { "https" } else { "http" };
        let url = format!("{scheme}://{}", config.domain);
        info!(container = %config.container_name, %url, "nginx deployment complete");

        Ok(DeployOutcome {
            url: Some(url),
            message: Some(format!("virtual host installed at {final_path}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(ssl: bool) -> NginxConfig {
        NginxConfig {
            ssh: SshConfig {
                host: "203.0.113.9".to_string(),
                port: 22,
                user: "deploy".to_string(),
                key_path: "/keys/id_ed25519".to_string(),
            },
            image: "registry.example.com/app:1".to_string(),
            container_name: "app".to_string(),
            forward_port: 3000,
            domain: "app.example.com".to_string(),
            ssl,
            ssl_certificate: Some("/etc/ssl/app.pem".to_string()),
            ssl_certificate_key: Some("/etc/ssl/app.key".to_string()),
            config_dir: default_config_dir(),
            reload_command: default_reload_command(),
        }
    }

    #[test]
    fn plain_vhost_has_no_tls_block() {
        let vhost = render_vhost(&base_config(false));
        assert!(vhost.contains("listen 80;"));
        assert!(vhost.contains("server_name app.example.com;"));
        assert!(vhost.contains("proxy_pass http://127.0.0.1:3000;"));
        assert!(!vhost.contains("443"));
    }

    #[test]
    fn ssl_vhost_redirects_and_terminates_tls() {
        let vhost = render_vhost(&base_config(true));
        assert!(vhost.contains("return 301 https://$host$request_uri;"));
        assert!(vhost.contains("listen 443 ssl;"));
        assert!(vhost.contains("ssl_certificate /etc/ssl/app.pem;"));
        assert!(vhost.contains("ssl_certificate_key /etc/ssl/app.key;"));
    }

    #[test]
    fn defaults_for_config_dir_and_reload() {
        let value = serde_json::json!({
            "host": "203.0.113.9",
            "user": "deploy",
            "key_path": "/keys/id_ed25519",
            "image": "registry.example.com/app:1",
            "container_name": "app",
            "forward_port": 3000,
            "domain": "app.example.com"
        });
        let config: NginxConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.config_dir, "/etc/nginx/sites-enabled");
        assert_eq!(config.reload_command, "systemctl restart nginx");
    }
}
