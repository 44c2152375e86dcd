use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// In-request retry of transient transport failures. A sync run already
/// retries failed entities on the next run, so the default is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): doubling, capped.
    pub fn delay(&self, retry: usize) -> Duration {
        let factor = u32::try_from(retry)
            .ok()
            .and_then(|r| 1u32.checked_shl(r))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// In-flight requests across every source.
    pub global_concurrency: usize,
    /// In-flight requests per source id.
    pub per_source_concurrency: usize,
    /// Minimum spacing between request starts to one source.
    pub min_request_interval: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 16,
            min_request_interval: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Spaces request starts at least `interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserve the next start slot and sleep until it arrives.
    pub async fn wait(&self) {
        let wait_until = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next_slot.map_or(now, |slot| slot.max(now));
            *next_slot = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(wait_until.into()).await;
    }
}

#[derive(Debug)]
struct SourceGate {
    permits: Arc<Semaphore>,
    pacer: Option<RequestPacer>,
}

/// One GET against a source endpoint.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Requests with the same source id share a concurrency limit and pacer.
    pub source_id: &'a str,
    pub url: &'a str,
    pub query: &'a [(String, String)],
    pub headers: &'a [(String, String)],
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Bytes,
    /// Attempts made, including the successful one.
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client is shutting down")]
    Closed,
}

impl FetchError {
    /// Worth another attempt within the same request: timeouts, refused
    /// connections, throttling and server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
            FetchError::HttpStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..600).contains(status)
            }
            FetchError::Closed => false,
        }
    }
}

/// Shared HTTP client for all source fetchers of one process.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global: Arc<Semaphore>,
    per_source_concurrency: usize,
    min_request_interval: Option<Duration>,
    gates: Mutex<HashMap<String, Arc<SourceGate>>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_concurrency: config.per_source_concurrency.max(1),
            min_request_interval: config.min_request_interval.filter(|i| !i.is_zero()),
            gates: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn gate(&self, source_id: &str) -> Arc<SourceGate> {
        let mut gates = self.gates.lock().await;
        Arc::clone(gates.entry(source_id.to_string()).or_insert_with(|| {
            Arc::new(SourceGate {
                permits: Arc::new(Semaphore::new(self.per_source_concurrency)),
                pacer: self.min_request_interval.map(RequestPacer::new),
            })
        }))
    }

    /// GET `request.url` and return the body of a 2xx response.
    pub async fn get(
        &self,
        run_id: Uuid,
        request: FetchRequest<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let gate = self.gate(request.source_id).await;
        let _global = self.global.acquire().await.map_err(|_| FetchError::Closed)?;
        let _source = gate.permits.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, source_id = request.source_id, url = request.url);
        async {
            let mut retry = 0;
            loop {
                if let Some(pacer) = &gate.pacer {
                    pacer.wait().await;
                }
                let started = Instant::now();
                match self.send_once(&request).await {
                    Ok(mut response) => {
                        response.attempts = retry + 1;
                        debug!(status = %response.status, bytes = response.body.len(), elapsed_ms = started.elapsed().as_millis() as u64, "fetched");
                        return Ok(response);
                    }
                    Err(err) if err.is_transient() && retry < self.retry.max_retries => {
                        let delay = self.retry.delay(retry);
                        debug!(retry, delay_ms = delay.as_millis() as u64, error = %err, "transient failure; retrying");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn send_once(&self, request: &FetchRequest<'_>) -> Result<FetchedResponse, FetchError> {
        let mut builder = self.client.get(request.url).query(request.query);
        for (name, value) in request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(FetchedResponse {
            status,
            final_url,
            body: response.bytes().await?,
            attempts: 1,
        })
    }
}
