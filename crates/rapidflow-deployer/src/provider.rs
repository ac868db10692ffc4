//! The output provider trait.

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use rapidflow_core::{Error, Result};

/// Everything a provider sees for one publication.
#[derive(Debug, Clone)]
pub struct DeployRequest<'a> {
    /// Name of the runnable that produced the artifact.
    pub runnable_name: &'a str,
    /// Provider-specific configuration bag from the deployment row.
    pub config: &'a serde_json::Value,
    /// Opaque artifact handle: a filesystem path, an image reference, or the
    /// `container:{id}:{name}` sentinel.
    pub artifact_path: &'a str,
}

/// What a successful publication reports back.
#[derive(Debug, Clone, Default)]
pub struct DeployOutcome {
    /// Where the artifact ended up, when the destination has an address.
    pub url: Option<String>,
    /// Human-readable summary persisted to the deployment row.
    pub message: Option<String>,
}

/// A pluggable sink consuming an artifact handle and performing one external
/// publish.
#[async_trait]
pub trait OutputProvider: Send + Sync {
    /// The type tag this provider registers under.
    fn output_type(&self) -> &'static str;

    async fn deploy(&self, request: DeployRequest<'_>) -> Result<DeployOutcome>;
}

/// Deserialize a provider's slice of the configuration bag.
pub(crate) fn parse_config<T: DeserializeOwned>(
    output_type: &str,
    config: &serde_json::Value,
) -> Result<T> {
    serde_json::from_value(config.clone())
        .map_err(|e| Error::DeploymentFailed(format!("invalid {output_type} config: {e}")))
}

/// Providers that publish files fail fast when the artifact is gone.
pub(crate) async fn require_file(artifact_path: &str) -> Result<()> {
    let metadata = tokio::fs::metadata(artifact_path)
        .await
        .map_err(|_| Error::DeploymentFailed(format!("artifact not found: {artifact_path}")))?;
    if !metadata.is_file() {
        return Err(Error::DeploymentFailed(format!(
            "artifact is not a file: {artifact_path}"
        )));
    }
    Ok(())
}
