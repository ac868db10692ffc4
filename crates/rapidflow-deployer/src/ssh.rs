//! SSH helper shared by the container-deploy providers.
//!
//! Runs commands on the target through the system `ssh` binary with an
//! identity file, and uploads file content by piping stdin into
//! `cat > remote-path`. Host-key verification is intentionally permissive in
//! this generation; strict checking belongs in real deployments.

use serde::Deserialize;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use rapidflow_core::{Error, Result};

/// Connection parameters every SSH-backed provider shares.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    /// Path to the private key on the engine host.
    pub key_path: String,
}

fn default_port() -> u16 {
    22
}

/// A command-at-a-time SSH client.
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    /// Validate the key exists on disk and build a client.
    pub fn connect(config: SshConfig) -> Result<Self> {
        if !std::path::Path::new(&config.key_path).is_file() {
            return Err(Error::DeploymentFailed(format!(
                "ssh private key not found: {}",
                config.key_path
            )));
        }
        Ok(Self { config })
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.config.key_path.clone(),
            "-p".to_string(),
            self.config.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            format!("{}@{}", self.config.user, self.config.host),
        ]
    }

    /// Run a remote command, returning its stdout.
    pub async fn run(&self, command: &str) -> Result<String> {
        debug!(host = %self.config.host, command, "ssh exec");
        let output = Command::new("ssh")
            .args(self.base_args())
            .arg(command)
            .output()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("failed to spawn ssh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::DeploymentFailed(format!(
                "remote command failed on {}: {}",
                self.config.host,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Upload file content by piping it into `cat` on the remote side.
    pub async fn upload(&self, content: &str, remote_path: &str) -> Result<()> {
        debug!(host = %self.config.host, remote_path, "ssh upload");
        let mut child = Command::new("ssh")
            .args(self.base_args())
            .arg(format!("cat > '{remote_path}'"))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::DeploymentFailed(format!("failed to spawn ssh: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(content.as_bytes())
                .await
                .map_err(|e| Error::DeploymentFailed(format!("upload write failed: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("upload failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::DeploymentFailed(format!(
                "upload to {} failed: {}",
                remote_path,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// The docker dance both SSH providers run on the target: pull the image,
/// replace any previous container of the same name, and verify it came up.
pub async fn deploy_container(
    client: &SshClient,
    image: &str,
    container_name: &str,
    port: &str,
) -> Result<()> {
    client.run(&format!("docker pull {image}")).await?;
    client
        .run(&format!("docker stop {container_name} || true"))
        .await?;
    client
        .run(&format!("docker rm {container_name} || true"))
        .await?;
    client
        .run(&format!(
            "docker run -d --name {container_name} -p {port}:{port} {image}"
        ))
        .await?;

    let listing = client
        .run(&format!("docker ps | grep {container_name}"))
        .await?;
    if listing.trim().is_empty() {
        return Err(Error::DeploymentFailed(format!(
            "container {container_name} is not running after deploy"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_defaults_to_22() {
        let config: SshConfig = serde_json::from_str(
            r#"{"host": "example.com", "user": "deploy", "key_path": "/tmp/key"}"#,
        )
        .unwrap();
        assert_eq!(config.port, 22);
    }

    #[test]
    fn missing_key_is_rejected() {
        let config = SshConfig {
            host: "example.com".to_string(),
            port: 22,
            user: "deploy".to_string(),
            key_path: "/nonexistent/rapidflow-test-key".to_string(),
        };
        assert!(SshClient::connect(config).is_err());
    }
}
