//! Outbound webhook delivery.
//!
//! # Responsibility
//! - Deliver sanitized entity payloads for selected mutations to a
//!   user-configured endpoint.
//!
//! # Invariants
//! - Delivery is best-effort; callers log and swallow failures.
//! - The envelope never carries anything but the sanitized payload and
//!   event metadata.

use crate::config::{WebhookConfig, WebhookEvent};
use crate::sanitize::format_timestamp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

#[derive(Debug)]
pub enum WebhookError {
    Http(reqwest::Error),
    /// Endpoint answered with a non-success status.
    Status(u16),
}

impl Display for WebhookError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(err) => write!(f, "webhook request failed: {err}"),
            Self::Status(code) => write!(f, "webhook endpoint returned status {code}"),
        }
    }
}

impl Error for WebhookError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Http(err) => Some(err),
            Self::Status(_) => None,
        }
    }
}

impl From<reqwest::Error> for WebhookError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, event: WebhookEvent, payload: &Value) -> Result<(), WebhookError>;
}

/// Request body posted to the endpoint.
pub fn envelope(event: WebhookEvent, payload: &Value, sent_at: DateTime<Utc>) -> Value {
    json!({
        "event": event.as_str(),
        "sentAt": format_timestamp(&sent_at),
        "data": payload,
    })
}

/// JSON POST delivery over HTTP.
pub struct HttpWebhook {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpWebhook {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &WebhookConfig) -> Result<Option<Self>, WebhookError> {
        match config.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => Ok(Some(Self::new(
                endpoint,
                Duration::from_millis(config.timeout_ms),
            )?)),
            _ => Ok(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl WebhookSink for HttpWebhook {
    async fn deliver(&self, event: WebhookEvent, payload: &Value) -> Result<(), WebhookError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&envelope(event, payload, Utc::now()))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WebhookError::Status(status.as_u16()))
        }
    }
}
