//! Object-store output provider (S3-compatible).

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use serde::Deserialize;
use tracing::info;

use rapidflow_core::{Error, Result};

use crate::provider::{DeployOutcome, DeployRequest, OutputProvider, parse_config, require_file};

#[derive(Debug, Deserialize)]
struct S3Config {
    bucket: String,
    key: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    /// Custom endpoint for S3-compatible stores.
    #[serde(default)]
    endpoint: Option<String>,
}

#[derive(Default)]
pub struct S3Provider;

impl S3Provider {
    pub fn new() -> Self {
        Self
    }

    fn client(config: &S3Config) -> aws_sdk_s3::Client {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "rapidflow",
        );

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }

        aws_sdk_s3::Client::from_conf(builder.build())
    }
}

#[async_trait]
impl OutputProvider for S3Provider {
    fn output_type(&self) -> &'static str {
        "s3"
    }

    async fn deploy(&self, request: DeployRequest<'_>) -> Result<DeployOutcome> {
        let config: S3Config = parse_config(self.output_type(), request.config)?;
        require_file(request.artifact_path).await?;

        let body = ByteStream::from_path(request.artifact_path)
            .await
            .map_err(|e| Error::DeploymentFailed(format!("failed to read artifact: {e}")))?;

        Self::client(&config)
            .put_object()
            .bucket(config.bucket.clone())
            .key(config.key.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("s3 upload failed: {e}")))?;

        let url = format!("s3://{}/{}", config.bucket, config.key);
        info!(%url, "artifact uploaded");
        Ok(DeployOutcome {
            url: Some(url),
            message: None,
        })
    }
}
