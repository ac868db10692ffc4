//! HTTP webhook output provider.
//!
//! Sends the artifact file as the request body. Any status of 400 or above
//! counts as a failed delivery.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::info;

use rapidflow_core::{Error, Result};

use crate::provider::{DeployOutcome, DeployRequest, OutputProvider, parse_config, require_file};

#[derive(Debug, Deserialize)]
struct WebhookConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

fn default_method() -> String {
    "POST".to_string()
}

pub struct WebhookProvider {
    client: reqwest::Client,
}

impl Default for WebhookProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl OutputProvider for WebhookProvider {
    fn output_type(&self) -> &'static str {
        "webhook"
    }

    async fn deploy(&self, request: DeployRequest<'_>) -> Result<DeployOutcome> {
        let config: WebhookConfig = parse_config(self.output_type(), request.config)?;
        require_file(request.artifact_path).await?;

        let method = reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| {
                Error::DeploymentFailed(format!("invalid webhook method: {}", config.method))
            })?;

        let body = tokio::fs::read(request.artifact_path).await?;

        let mut http_request = self.client.request(method, &config.url).body(body);
        for (name, value) in &config.headers {
            http_request = http_request.header(name, value);
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("webhook delivery failed: {e}")))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(Error::DeploymentFailed(format!(
                "webhook returned {status}"
            )));
        }

        info!(url = %config.url, status = %status, "webhook delivered");
        Ok(DeployOutcome {
            url: Some(config.url),
            message: Some(format!("delivered with status {status}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = serde_json::json!({"method": "POST"});
        let err = WebhookProvider::new()
            .deploy(DeployRequest {
                runnable_name: "app",
                config: &config,
                artifact_path: "/tmp/x",
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid webhook config"));
    }

    #[tokio::test]
    async fn missing_artifact_fails_before_network() {
        let config = serde_json::json!({"url": "https://hooks.example.com/x"});
        let err = WebhookProvider::new()
            .deploy(DeployRequest {
                runnable_name: "app",
                config: &config,
                artifact_path: "/nonexistent/artifact.zip",
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("artifact not found"));
    }
}
