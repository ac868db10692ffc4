//! Email output provider.
//!
//! Supports three transports (SMTP, SES and a generic HTTP API), each with
//! its own required sub-fields. Every transport appends a trailing
//! `Artifact: {path}` line to the body so the recipient can locate the
//! produced artifact.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use rapidflow_core::{Error, Result};

use crate::provider::{DeployOutcome, DeployRequest, OutputProvider, parse_config};

#[derive(Debug, Deserialize)]
struct EmailConfig {
    transport: String,
    from: String,
    to: Vec<String>,
    subject: String,
    #[serde(default)]
    body: String,

    // smtp
    #[serde(default)]
    smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    smtp_port: u16,
    #[serde(default)]
    smtp_username: Option<String>,
    #[serde(default)]
    smtp_password: Option<String>,

    // ses
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    access_key_id: Option<String>,
    #[serde(default)]
    secret_access_key: Option<String>,

    // http
    #[serde(default)]
    url: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

pub struct EmailProvider {
    client: reqwest::Client,
}

impl Default for EmailProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn send_smtp(&self, config: &EmailConfig, body: &str) -> Result<()> {
        use lettre::message::Mailbox;
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

        let host = config
            .smtp_host
            .as_deref()
            .ok_or_else(|| Error::DeploymentFailed("smtp transport requires smtp_host".into()))?;

        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| Error::DeploymentFailed(format!("invalid from address: {e}")))?;

        let mut builder = Message::builder().from(from).subject(config.subject.clone());
        for to in &config.to {
            let mailbox: Mailbox = to
                .parse()
                .map_err(|e| Error::DeploymentFailed(format!("invalid recipient {to}: {e}")))?;
            builder = builder.to(mailbox);
        }
        let message = builder
            .body(body.to_string())
            .map_err(|e| Error::DeploymentFailed(format!("failed to build email: {e}")))?;

        let mut transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| Error::DeploymentFailed(format!("smtp relay setup failed: {e}")))?
            .port(config.smtp_port);
        if let Some(username) = &config.smtp_username {
            let password = config.smtp_password.clone().unwrap_or_default();
            transport = transport.credentials(Credentials::new(username.clone(), password));
        }

        transport
            .build()
            .send(message)
            .await
            .map_err(|e| Error::DeploymentFailed(format!("smtp send failed: {e}")))?;
        Ok(())
    }

    async fn send_ses(&self, config: &EmailConfig, body: &str) -> Result<()> {
        use aws_sdk_sesv2::config::{BehaviorVersion, Credentials, Region};
        use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};

        let region = config
            .region
            .clone()
            .ok_or_else(|| Error::DeploymentFailed("ses transport requires region".into()))?;
        let access_key_id = config.access_key_id.clone().ok_or_else(|| {
            Error::DeploymentFailed("ses transport requires access_key_id".into())
        })?;
        let secret_access_key = config.secret_access_key.clone().ok_or_else(|| {
            Error::DeploymentFailed("ses transport requires secret_access_key".into())
        })?;

        let credentials =
            Credentials::new(access_key_id, secret_access_key, None, None, "rapidflow");
        let sdk_config = aws_sdk_sesv2::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .build();
        let client = aws_sdk_sesv2::Client::from_conf(sdk_config);

        let subject = Content::builder()
            .data(config.subject.clone())
            .build()
            .map_err(|e| Error::DeploymentFailed(format!("invalid subject: {e}")))?;
        let text = Content::builder()
            .data(body.to_string())
            .build()
            .map_err(|e| Error::DeploymentFailed(format!("invalid body: {e}")))?;
        let message = Message::builder()
            .subject(subject)
            .body(Body::builder().text(text).build())
            .build();

        let destination = Destination::builder()
            .set_to_addresses(Some(config.to.clone()))
            .build();

        client
            .send_email()
            .from_email_address(config.from.clone())
            .destination(destination)
            .content(EmailContent::builder().simple(message).build())
            .send()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("ses send failed: {e}")))?;
        Ok(())
    }

    async fn send_http(&self, config: &EmailConfig, body: &str) -> Result<()> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::DeploymentFailed("http transport requires url".into()))?;

        let payload = serde_json::json!({
            "from": config.from,
            "to": config.to,
            "subject": config.subject,
            "body": body,
        });

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("email api call failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::DeploymentFailed(format!(
                "email api returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl OutputProvider for EmailProvider {
    fn output_type(&self) -> &'static str {
        "email"
    }

    async fn deploy(&self, request: DeployRequest<'_>) -> Result<DeployOutcome> {
        let config: EmailConfig = parse_config(self.output_type(), request.config)?;
        if config.to.is_empty() {
            return Err(Error::DeploymentFailed(
                "email requires at least one recipient".to_string(),
            ));
        }

        let body = format!("{}\nArtifact: {}", config.body, request.artifact_path);

        match config.transport.as_str() {
            "smtp" => self.send_smtp(&config, &body).await?,
            "ses" => self.send_ses(&config, &body).await?,
            "http" => self.send_http(&config, &body).await?,
            other => {
                return Err(Error::DeploymentFailed(format!(
                    "unknown email transport: {other}"
                )));
            }
        }

        info!(transport = %config.transport, recipients = config.to.len(), "notification email sent");
        Ok(DeployOutcome {
            url: None,
            message: Some(format!("sent to {} recipient(s)", config.to.len())),
        })
    }
}
