//! Retrieval of job results from a remote object store.
//!
//! Results are fetched by URL under a linear backoff: attempt `k` (from 0)
//! waits `k * increment` before fetching, and the loop gives up as soon as
//! the time already spent when polling began plus the cumulative backoff of
//! the next attempt would exceed the budget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn, Instrument};

use crate::config::PollConfig;
use crate::error::PollError;
use crate::telemetry;

/// Byte-oriented read access to the store results are written to.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// [`ObjectStore`] over plain HTTP GETs.
#[derive(Clone, Debug, Default)]
pub struct HttpObjectStore {
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Backoff accumulated through attempt `attempt`: `attempt(attempt+1)/2 * increment`.
pub fn cumulative_wait(attempt: u32, increment: Duration) -> Duration {
    let steps = u64::from(attempt) * (u64::from(attempt) + 1) / 2;
    increment.saturating_mul(u32::try_from(steps).unwrap_or(u32::MAX))
}

/// Whether attempt `attempt` must be skipped because it would overrun `budget`.
pub fn budget_exceeded(elapsed: Duration, attempt: u32, increment: Duration, budget: Duration) -> bool {
    elapsed.saturating_add(cumulative_wait(attempt, increment)) > budget
}

/// Whole seconds between `started_at` and `now`, rounded to nearest and never negative.
fn start_offset(started_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let millis = (now - started_at).num_milliseconds().max(0);
    Duration::from_secs(((millis + 500) / 1000).unsigned_abs())
}

/// Result index written next to a batch of jobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultManifest {
    /// Unix seconds at which the batch started; polling budgets count from here.
    pub time: i64,
    #[serde(default)]
    pub jobs: Vec<ManifestJob>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestJob {
    #[serde(default)]
    pub job_id: Option<String>,
}

impl ResultManifest {
    pub fn started_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.time, 0).unwrap_or_else(Utc::now)
    }
}

pub struct ResultPoller<S> {
    store: S,
    config: PollConfig,
}

impl<S: ObjectStore> ResultPoller<S> {
    pub fn new(store: S, config: PollConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Poll `url` with the configured budget and increment.
    pub async fn poll(&self, url: &str, started_at: DateTime<Utc>) -> Result<Vec<u8>, PollError> {
        self.poll_with(url, started_at, self.config.timeout(), self.config.increment())
            .await
    }

    pub async fn poll_with(
        &self,
        url: &str,
        started_at: DateTime<Utc>,
        budget: Duration,
        increment: Duration,
    ) -> Result<Vec<u8>, PollError> {
        let span = telemetry::poll_span(url);
        async move {
            // Measured once; the backoff slept below is accounted by `cumulative_wait`.
            let offset = start_offset(started_at, Utc::now());
            let mut attempt: u32 = 0;
            loop {
                if budget_exceeded(offset, attempt, increment, budget) {
                    warn!(url, attempts = attempt, "result polling budget exhausted");
                    return Err(PollError::Timeout {
                        url: url.to_string(),
                        attempts: attempt,
                        budget,
                    });
                }

                tokio::time::sleep(increment.saturating_mul(attempt)).await;
                telemetry::record_poll_attempt(url, attempt);
                match self.store.get(url).await {
                    Ok(bytes) => {
                        debug!(url, attempt, bytes = bytes.len(), "result fetched");
                        return Ok(bytes);
                    }
                    Err(err) => debug!(url, attempt, error = %err, "result not available yet"),
                }
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }

    /// Fetch and decode the result of every job in `manifest`, in order.
    ///
    /// Jobs without an id contribute an empty array.
    pub async fn collect(&self, base_url: &str, manifest: &ResultManifest) -> Result<Vec<Value>, PollError> {
        let started_at = manifest.started_at();
        let base_url = base_url.trim_end_matches('/');
        let mut parts = Vec::with_capacity(manifest.jobs.len());

        for job in &manifest.jobs {
            let Some(job_id) = &job.job_id else {
                parts.push(Value::Array(Vec::new()));
                continue;
            };
            let url = format!("{base_url}/results/{job_id}.json");
            let bytes = self.poll(&url, started_at).await?;
            let value: Value = serde_json::from_slice(&bytes).map_err(|err| PollError::InvalidPayload {
                url: url.clone(),
                message: err.to_string(),
            })?;
            if value.is_null() {
                return Err(PollError::EmptyResult { url });
            }
            parts.push(value);
        }

        Ok(parts)
    }
}
