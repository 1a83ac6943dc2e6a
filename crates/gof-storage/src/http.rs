//! Outbound HTTP shared by connectors and registry lookups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// Extra request headers as (name, value) pairs.
pub type Headers<'a> = &'a [(&'a str, String)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            initial: Duration::from_millis(250),
            ceiling: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry `n` (zero-based), doubling up to the ceiling.
    pub fn delay(&self, n: u32) -> Duration {
        self.initial
            .checked_mul(2u32.saturating_pow(n))
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_source: usize,
    pub retry: RetryPolicy,
    /// Minimum gap between two requests to the same source.
    pub min_spacing: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            max_in_flight: 16,
            max_in_flight_per_source: 4,
            retry: RetryPolicy::default(),
            min_spacing: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client closed")]
    Closed,
}

impl FetchError {
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 401 | 403, .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 429, .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Transport(err) if err.is_timeout())
    }

    /// Server errors, 429, timeouts and connect failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(err) => err.is_timeout() || err.is_connect(),
            FetchError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            FetchError::Closed => false,
        }
    }
}

/// Concurrency and pacing state for one source.
#[derive(Debug)]
struct SourceGate {
    permits: Arc<Semaphore>,
    next_slot: Mutex<Option<Instant>>,
}

impl SourceGate {
    fn new(permits: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(permits.max(1))),
            next_slot: Mutex::new(None),
        }
    }

    /// Reserves the next start time and sleeps until it.
    async fn wait_turn(&self, spacing: Duration) {
        let start = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let start = next.map_or(now, |slot| slot.max(now));
            *next = Some(start + spacing);
            start
        };
        tokio::time::sleep_until(start).await;
    }
}

enum Attempt {
    Done(FetchedResponse),
    Failed {
        error: FetchError,
        retry_after: Option<Duration>,
    },
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_source_permits: usize,
    gates: Mutex<HashMap<String, Arc<SourceGate>>>,
    retry: RetryPolicy,
    min_spacing: Option<Duration>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }
        let client = builder.build().context("building http client")?;

        Ok(Self {
            client,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_source_permits: config.max_in_flight_per_source,
            gates: Mutex::new(HashMap::new()),
            retry: config.retry,
            min_spacing: config.min_spacing,
        })
    }

    pub async fn get_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        headers: Headers<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(run_id, source_id, url, || {
            headers
                .iter()
                .fold(self.client.get(url), |req, (name, value)| req.header(*name, value))
        })
        .await
    }

    pub async fn post_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        body: &serde_json::Value,
        headers: Headers<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(run_id, source_id, url, || {
            headers
                .iter()
                .fold(self.client.post(url).json(body), |req, (name, value)| req.header(*name, value))
        })
        .await
    }

    async fn gate(&self, source_id: &str) -> Arc<SourceGate> {
        let mut gates = self.gates.lock().await;
        gates
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(SourceGate::new(self.per_source_permits)))
            .clone()
    }

    async fn execute<F>(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        request: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _slot = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let gate = self.gate(source_id).await;
        let _source_slot = gate.permits.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let mut retry = 0u32;
            loop {
                if let Some(spacing) = self.min_spacing {
                    gate.wait_turn(spacing).await;
                }
                let (error, hinted) = match Self::attempt(request()).await {
                    Attempt::Done(response) => return Ok(response),
                    Attempt::Failed { error, retry_after } => (error, retry_after),
                };
                if retry >= self.retry.retries || !error.is_retryable() {
                    return Err(error);
                }
                let wait = hinted
                    .unwrap_or_default()
                    .max(self.retry.delay(retry))
                    .min(self.retry.ceiling);
                debug!(error = %error, retry, wait_ms = wait.as_millis() as u64, "retrying request");
                tokio::time::sleep(wait).await;
                retry += 1;
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(request: reqwest::RequestBuilder) -> Attempt {
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                return Attempt::Failed {
                    error: FetchError::Transport(err),
                    retry_after: None,
                }
            }
        };
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Attempt::Failed {
                retry_after: retry_after(response.headers()),
                error: FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                },
            };
        }
        match response.bytes().await {
            Ok(body) => Attempt::Done(FetchedResponse {
                status,
                final_url,
                body: body.to_vec(),
            }),
            Err(err) => Attempt::Failed {
                error: FetchError::Transport(err),
                retry_after: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_delay_doubles_until_ceiling() {
        let policy = RetryPolicy {
            retries: 4,
            initial: Duration::from_millis(100),
            ceiling: Duration::from_millis(350),
        };
        let delays = (0..5).map(|n| policy.delay(n).as_millis()).collect::<Vec<_>>();
        assert_eq!(delays, vec![100, 200, 350, 350, 350]);
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn status_errors_are_classified() {
        let status = |code: u16| FetchError::HttpStatus {
            status: code,
            url: "https://example.org".into(),
        };
        assert!(status(401).is_auth() && status(403).is_auth());
        assert!(!status(403).is_retryable());
        assert!(status(429).is_rate_limited() && status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!FetchError::Closed.is_retryable());
    }

    #[test]
    fn retry_after_reads_delta_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[tokio::test(start_paused = true)]
    async fn source_gate_spaces_consecutive_requests() {
        let gate = SourceGate::new(1);
        let started = Instant::now();
        gate.wait_turn(Duration::from_millis(500)).await;
        assert!(started.elapsed() < Duration::from_millis(1));
        gate.wait_turn(Duration::from_millis(500)).await;
        gate.wait_turn(Duration::from_millis(500)).await;
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }
}
