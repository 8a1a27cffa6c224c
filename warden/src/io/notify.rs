//! Chat webhook notifications.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

/// Sends human-readable messages to a chat channel.
pub trait Notifier {
    fn send(&self, message: &str) -> Result<()>;
}

/// Posts `{"<field>": "<message>"}` to a webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    webhook_url: String,
    message_field: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: &str, message_field: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build webhook http client")?;
        Ok(Self {
            client,
            webhook_url: webhook_url.to_string(),
            message_field: message_field.to_string(),
        })
    }
}

impl Notifier for WebhookNotifier {
    #[instrument(skip_all)]
    fn send(&self, message: &str) -> Result<()> {
        let payload = webhook_payload(&self.message_field, message);
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .context("post webhook message")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(anyhow!("webhook returned {status}: {}", body.trim()));
        }
        debug!("webhook notification sent");
        Ok(())
    }
}

/// Notifier used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn send(&self, message: &str) -> Result<()> {
        debug!(message, "notifications disabled, dropping message");
        Ok(())
    }
}

/// Build the notifier described by config: webhook when a URL is set, otherwise a no-op.
pub fn notifier_from_url(
    webhook_url: &str,
    message_field: &str,
    timeout: Duration,
) -> Result<Box<dyn Notifier>> {
    if webhook_url.trim().is_empty() {
        return Ok(Box::new(NullNotifier));
    }
    Ok(Box::new(WebhookNotifier::new(
        webhook_url.trim(),
        message_field,
        timeout,
    )?))
}

impl<N: Notifier + ?Sized> Notifier for Box<N> {
    fn send(&self, message: &str) -> Result<()> {
        (**self).send(message)
    }
}

pub fn webhook_payload(field: &str, message: &str) -> Value {
    let mut map = Map::new();
    map.insert(field.to_string(), Value::String(message.to_string()));
    Value::Object(map)
}
