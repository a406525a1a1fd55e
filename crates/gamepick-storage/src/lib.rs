//! Persistence, HTTP fetch and pacing utilities shared by the ingestion jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, Instrument};

pub mod gate;
pub mod logs;
pub mod postgres;
pub mod retry;
pub mod store;

pub use gate::RateGate;
pub use logs::{archive_dir_for, compress_file, run_log_paths, LogLifecycle, RunLogPaths};
pub use postgres::PgStore;
pub use retry::{RetryDecision, RetryLedger, RetryPolicy};
pub use store::{CatalogStore, MemoryStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Steam answers throttled clients with 403 as often as with 429.
pub fn is_rate_limit(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 64,
            per_source_concurrency: 32,
        }
    }
}

/// Shared client that bounds in-flight requests globally and per upstream.
///
/// Unlike a retrying client, every status is handed back to the caller: the
/// jobs own retry policy through [`RetryLedger`] and [`RateGate`].
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid header {0}")]
    Header(String),
    #[error("fetcher concurrency limit closed")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::Header(_) | FetchError::Closed => RetryDisposition::NonRetryable,
        }
    }
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn get(
        &self,
        source_id: &str,
        url: &str,
        headers: &[(&'static str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::Header(name.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| FetchError::Header(name.to_string()))?;
            header_map.insert(header_name, value);
        }

        let span = tracing::debug_span!("http_fetch", source_id, url);
        async {
            let resp = self.client.get(url).headers(header_map).send().await?;
            let status = resp.status();
            let content_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                content_type,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_statuses_are_rate_limits() {
        assert!(is_rate_limit(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_rate_limit(StatusCode::FORBIDDEN));
        assert!(!is_rate_limit(StatusCode::NOT_FOUND));
        assert!(!is_rate_limit(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn closed_limits_and_bad_headers_are_final() {
        assert_eq!(FetchError::Closed.disposition(), RetryDisposition::NonRetryable);
        assert_eq!(
            FetchError::Header("x-bad".into()).disposition(),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn fetcher_builds_with_defaults() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("gamepick-test/0.1".into()),
            ..Default::default()
        });
        assert!(fetcher.is_ok());
    }
}
