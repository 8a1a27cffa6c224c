//! Health-check pings (healthchecks.io style success/failure URLs).

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::types::HealthSignal;

/// Reports liveness of the managed process to an external endpoint.
pub trait HealthPinger {
    /// Ping the endpoint for `signal`. Returns `Ok(false)` when no endpoint is configured.
    fn ping(&self, signal: HealthSignal) -> Result<bool>;
}

/// Pinger that issues a GET to one of two URLs.
#[derive(Debug, Clone)]
pub struct HttpHealthPinger {
    client: reqwest::blocking::Client,
    success_url: Option<String>,
    failure_url: Option<String>,
}

impl HttpHealthPinger {
    pub fn new(success_url: &str, failure_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build health-check http client")?;
        Ok(Self {
            client,
            success_url: non_empty(success_url),
            failure_url: non_empty(failure_url),
        })
    }

    fn url_for(&self, signal: HealthSignal) -> Option<&str> {
        match signal {
            HealthSignal::Success => self.success_url.as_deref(),
            HealthSignal::Failure => self.failure_url.as_deref(),
        }
    }
}

impl HealthPinger for HttpHealthPinger {
    #[instrument(skip_all, fields(signal = ?signal))]
    fn ping(&self, signal: HealthSignal) -> Result<bool> {
        let Some(url) = self.url_for(signal) else {
            debug!("no health-check url configured");
            return Ok(false);
        };
        self.client
            .get(url)
            .send()
            .with_context(|| format!("health ping {url}"))?
            .error_for_status()
            .with_context(|| format!("health ping {url}"))?;
        debug!(url, "health ping sent");
        Ok(true)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
