//! Notification delivery for alerts

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ChannelKind, NotificationConfig};

/// Subject of the message sent by [`NotificationSink::test_configuration`]
pub const TEST_SUBJECT: &str = "Tripwire - notification configuration test";
const TEST_BODY: &str =
    "This is a test message to verify the notification configuration is working correctly.";

/// Something that can deliver a composed message to a recipient
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Short name of the transport, used in logs
    fn channel_type(&self) -> &'static str;

    /// Deliver one message. `Ok(false)` means the transport refused it.
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<bool, NotificationError>;

    /// Send a fixed test message to check the transport end to end
    async fn test_configuration(&self, recipient: &str) -> Result<bool, NotificationError> {
        self.send(recipient, TEST_SUBJECT, TEST_BODY).await
    }
}

/// Result of a bounded delivery attempt
#[derive(Debug, Clone)]
pub struct NotificationResult {
    /// Transport that handled the attempt
    pub channel_type: String,
    /// Whether the sink confirmed delivery
    pub delivered: bool,
    /// Why delivery failed
    pub error: Option<String>,
    /// When the attempt started
    pub sent_at: DateTime<Utc>,
}

/// Call the sink with a timeout, folding every failure into the result.
pub async fn deliver(
    sink: &dyn NotificationSink,
    recipient: &str,
    subject: &str,
    body: &str,
    timeout: Duration,
) -> NotificationResult {
    let sent_at = Utc::now();

    let (delivered, error) =
        match tokio::time::timeout(timeout, sink.send(recipient, subject, body)).await {
            Ok(Ok(true)) => (true, None),
            Ok(Ok(false)) => (false, Some("transport reported non-delivery".to_string())),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (
                false,
                Some(format!("delivery timed out after {}s", timeout.as_secs_f64())),
            ),
        };

    NotificationResult {
        channel_type: sink.channel_type().to_string(),
        delivered,
        error,
        sent_at,
    }
}

/// Build the sink selected by configuration
pub fn build_sink(
    config: &NotificationConfig,
) -> Result<Box<dyn NotificationSink>, NotificationError> {
    match config.channel {
        ChannelKind::Log => Ok(Box::new(LogSink)),
        ChannelKind::Webhook => {
            let url = config.webhook_url.as_deref().ok_or_else(|| {
                NotificationError::ConfigError("webhook_url is not set".to_string())
            })?;
            Ok(Box::new(WebhookSink::new(url, config.timeout())?))
        }
        ChannelKind::Email => Ok(Box::new(EmailSink::from_config(config)?)),
    }
}

/// Writes the message to the log instead of delivering it
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn channel_type(&self) -> &'static str {
        "log"
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<bool, NotificationError> {
        info!(recipient = %recipient, subject = %subject, "Notification (log channel)");
        debug!(body = %body, "Notification body");
        Ok(true)
    }
}

/// POSTs alerts as JSON to a webhook
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    /// Create a new webhook sink
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::ConfigError(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn channel_type(&self) -> &'static str {
        "webhook"
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<bool, NotificationError> {
        let payload = WebhookPayload {
            recipient,
            subject,
            body,
            source: "tripwire",
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotificationError::HttpError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::HttpError(format!(
                "Webhook returned {}: {}",
                status, body
            )));
        }

        info!(url = %self.url, "Webhook notification sent");
        Ok(true)
    }
}

/// Sends alerts over SMTP
pub struct EmailSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailSink {
    /// Create an SMTP sink using STARTTLS on the configured relay
    pub fn from_config(config: &NotificationConfig) -> Result<Self, NotificationError> {
        let host = config
            .smtp_host
            .as_deref()
            .ok_or_else(|| NotificationError::ConfigError("smtp_host is not set".to_string()))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| NotificationError::ConfigError(e.to_string()))?
            .port(config.smtp_port)
            .timeout(Some(config.timeout()));

        if let (Some(user), Some(pass)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from = config.from.parse::<Mailbox>().map_err(|e| {
            NotificationError::ConfigError(format!("invalid from address '{}': {e}", config.from))
        })?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl NotificationSink for EmailSink {
    fn channel_type(&self) -> &'static str {
        "email"
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<bool, NotificationError> {
        let to = recipient.parse::<Mailbox>().map_err(|e| {
            NotificationError::ConfigError(format!("invalid recipient '{recipient}': {e}"))
        })?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| NotificationError::SerializationError(e.to_string()))?;

        let response = self
            .transport
            .send(email)
            .await
            .map_err(|e| NotificationError::SmtpError(e.to_string()))?;

        if !response.is_positive() {
            warn!(recipient = %recipient, code = %response.code(), "SMTP relay rejected message");
            return Ok(false);
        }

        info!(recipient = %recipient, "Email notification sent");
        Ok(true)
    }
}

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// Webhook request failed or was rejected
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// SMTP relay unreachable or refused the message
    #[error("SMTP error: {0}")]
    SmtpError(String),

    /// Transport settings missing or invalid
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Message could not be built
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<NotificationError> for crate::error::Error {
    fn from(e: NotificationError) -> Self {
        crate::error::Error::Notification(e.to_string())
    }
}

// Generic webhook payload
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    recipient: &'a str,
    subject: &'a str,
    body: &'a str,
    source: &'static str,
}
