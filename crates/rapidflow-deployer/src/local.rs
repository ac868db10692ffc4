//! Local filesystem output provider.
//!
//! Copies the artifact byte-for-byte to the configured path. When the
//! artifact is the running-container sentinel, a JSON info blob describing
//! the container is written instead.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use rapidflow_core::{Error, Result};

use crate::provider::{DeployOutcome, DeployRequest, OutputProvider, parse_config, require_file};

const CONTAINER_SENTINEL: &str = "container:";

#[derive(Debug, Deserialize)]
struct LocalConfig {
    path: String,
}

#[derive(Default)]
pub struct LocalProvider;

impl LocalProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OutputProvider for LocalProvider {
    fn output_type(&self) -> &'static str {
        "local"
    }

    async fn deploy(&self, request: DeployRequest<'_>) -> Result<DeployOutcome> {
        let config: LocalConfig = parse_config(self.output_type(), request.config)?;
        let destination = Path::new(&config.path);

        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
            set_mode(parent, 0o755).await?;
        }

        if let Some(rest) = request.artifact_path.strip_prefix(CONTAINER_SENTINEL) {
            let (container_id, container_name) =
                rest.split_once(':').ok_or_else(|| {
                    Error::DeploymentFailed(format!(
                        "malformed container handle: {}",
                        request.artifact_path
                    ))
                })?;
            let blob = serde_json::json!({
                "runnable": request.runnable_name,
                "container_id": container_id,
                "container_name": container_name,
                "status": "running",
                "deployed_at": Utc::now().to_rfc3339(),
            });
            tokio::fs::write(destination, serde_json::to_vec_pretty(&blob).unwrap_or_default())
                .await?;
        } else {
            require_file(request.artifact_path).await?;
            tokio::fs::copy(request.artifact_path, destination).await?;
        }

        set_mode(destination, 0o644).await?;
        info!(path = %config.path, "artifact published locally");

        Ok(DeployOutcome {
            url: Some(config.path),
            message: None,
        })
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request<'a>(
        config: &'a serde_json::Value,
        artifact: &'a str,
    ) -> DeployRequest<'a> {
        DeployRequest {
            runnable_name: "app",
            config,
            artifact_path: artifact,
        }
    }

    #[tokio::test]
    async fn copies_artifact_bytes() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("app.zip");
        tokio::fs::write(&artifact, b"zip-bytes").await.unwrap();

        let dest = dir.path().join("out/releases/app.zip");
        let config = serde_json::json!({"path": dest.to_string_lossy()});

        let outcome = LocalProvider::new()
            .deploy(request(&config, artifact.to_str().unwrap()))
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"zip-bytes");
        assert_eq!(outcome.url.as_deref(), dest.to_str());
    }

    #[tokio::test]
    async fn writes_container_info_blob() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("info.json");
        let config = serde_json::json!({"path": dest.to_string_lossy()});

        LocalProvider::new()
            .deploy(request(&config, "container:abc123:my-run"))
            .await
            .unwrap();

        let blob: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&dest).await.unwrap()).unwrap();
        assert_eq!(blob["container_id"], "abc123");
        assert_eq!(blob["container_name"], "my-run");
        assert_eq!(blob["status"], "running");
    }

    #[tokio::test]
    async fn missing_artifact_fails_fast() {
        let dir = TempDir::new().unwrap();
        let config = serde_json::json!({"path": dir.path().join("x").to_string_lossy()});

        let err = LocalProvider::new()
            .deploy(request(&config, "/nonexistent/artifact.zip"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("artifact not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn destination_created_with_0644() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("a.bin");
        tokio::fs::write(&artifact, b"x").await.unwrap();
        let dest = dir.path().join("copied.bin");
        let config = serde_json::json!({"path": dest.to_string_lossy()});

        LocalProvider::new()
            .deploy(request(&config, artifact.to_str().unwrap()))
            .await
            .unwrap();

        let mode = tokio::fs::metadata(&dest).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
