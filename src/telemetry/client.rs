use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{Batch, Record};
use crate::breaker::CircuitBreaker;
use crate::stats::GlobalStats;

pub const MAX_RETRIES: u32 = 2;
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE_PER_HOST: usize = 32;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Why a single push attempt failed.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("request to control plane failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("control plane answered {0}")]
    Status(StatusCode),
}

/// Pooled keep-alive client for the control plane telemetry API. Every attempt is gated by and
/// reported to the shared circuit breaker.
pub struct TelemetryClient {
    http: reqwest::Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<GlobalStats>,
}

impl TelemetryClient {
    pub fn new(
        base_url: &str,
        token: &str,
        breaker: Arc<CircuitBreaker>,
        stats: Arc<GlobalStats>,
    ) -> Result<Self> {
        let mut bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("backend API token is not a valid header value")?;
        bearer.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .user_agent(concat!("l4redir/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .build()
            .context("failed to build telemetry HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            breaker,
            stats,
        })
    }

    /// POST `records` as a JSON array to `endpoint`, retrying up to [`MAX_RETRIES`] times.
    ///
    /// Returns `false` when the batch was dropped, either because the breaker refused the first
    /// attempt or because every admitted attempt failed.
    pub async fn push(&self, endpoint: &str, records: &[Record]) -> bool {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        for attempt in 0..=MAX_RETRIES {
            let Some(admission) = self.breaker.can_proceed() else {
                if attempt == 0 {
                    debug!(%url, records = records.len(), "circuit breaker open; dropping batch");
                    self.stats.record_breaker_drop(records.len());
                    return false;
                }
                warn!(%url, attempt, "circuit breaker opened mid-retry; abandoning batch");
                break;
            };

            match self.send(&url, records).await {
                Ok(()) => {
                    self.breaker.record_success(admission);
                    self.stats.record_push();
                    debug!(%url, records = records.len(), attempt, "telemetry pushed");
                    return true;
                }
                Err(err) => {
                    self.breaker.record_failure(admission);
                    warn!(%url, attempt, error = %err, "telemetry push failed");
                }
            }

            if attempt < MAX_RETRIES {
                sleep(RETRY_BACKOFF).await;
            }
        }

        warn!(%url, records = records.len(), "dropping telemetry batch");
        self.stats.record_push_failure(records.len());
        false
    }

    pub fn stats(&self) -> &Arc<GlobalStats> {
        &self.stats
    }

    pub async fn deliver(&self, batch: Batch) -> bool {
        self.push(&batch.endpoint(), &batch.records).await
    }

    async fn send(&self, url: &str, records: &[Record]) -> Result<(), TelemetryError> {
        let response = self.http.post(url).json(records).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TelemetryError::Status(status))
        }
    }
}
