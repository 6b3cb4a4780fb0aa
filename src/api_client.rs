// src/api_client.rs
//
// Submits incident records to the incident API.
//
// Retry policy: network errors, 5xx and 429 are retried with exponential
// backoff (base, 2x base, 4x base, ...); any other 4xx is a permanent
// rejection and is not retried. Failures are returned to the caller, which
// logs and counts them. Nothing here can stop a pipeline.

use crate::incident_report::IncidentRecord;
use crate::types::ReportingConfig;
use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct IncidentApiClient {
    http_client: reqwest::Client,
    url: String,
    max_retries: u32,
    retry_backoff: Duration,
}

impl IncidentApiClient {
    pub fn new(url: &str, config: &ReportingConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            url: url.to_string(),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST one record. Returns the number of attempts it took.
    pub async fn submit(&self, record: &IncidentRecord) -> Result<u32> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let retryable = match self.http_client.post(&self.url).json(record).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        info!(
                            "🌐 Incident {} {} accepted by API ({}) after {} attempt(s)",
                            record.camera_id, record.datetime, status, attempt
                        );
                        return Ok(attempt);
                    }
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<no body>".to_string());
                    if !is_retryable(status) {
                        bail!("Incident API rejected record ({}): {}", status, body);
                    }
                    warn!("🌐 Incident API returned {}: {}", status, body);
                    format!("HTTP {}", status)
                }
                Err(e) => {
                    warn!("🌐 Incident API request failed: {}", e);
                    e.to_string()
                }
            };

            if attempt > self.max_retries {
                bail!(
                    "Incident API submission failed after {} attempt(s): {}",
                    attempt,
                    retryable
                );
            }
            let delay = self
                .retry_backoff
                .checked_mul(2u32.saturating_pow(attempt - 1))
                .unwrap_or(MAX_BACKOFF)
                .min(MAX_BACKOFF);
            warn!(
                "🌐 Retrying incident submission in {}ms (attempt {}/{})",
                delay.as_millis(),
                attempt + 1,
                self.max_retries + 1
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}
