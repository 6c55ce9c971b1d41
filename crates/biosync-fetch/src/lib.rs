//! Warehouse HTTP access: retrying requests, paginated page download and
//! reference-data loading.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};

pub mod fetcher;
pub mod reference;
pub mod warehouse;

pub use fetcher::{FetchSettings, FetchedRange, Fetcher, PageOutcome};
pub use reference::ReferenceClient;
pub use warehouse::{decode_page, HttpPageSource, PageSource, WarehousePage, WarehouseQuery};

pub const CRATE_NAME: &str = "biosync-fetch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
    #[error("query matches {total} records, more than the {limit} the warehouse pages through")]
    TooManyResults { total: u64, limit: u64 },
}

impl FetchError {
    /// Transport and status failures are worth another attempt; payload problems are not.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(_) | FetchError::HttpStatus { .. } => RetryDisposition::Retryable,
            FetchError::Malformed { .. } | FetchError::TooManyResults { .. } => RetryDisposition::NonRetryable,
        }
    }

    /// Query-level errors describe the request itself rather than the network.
    pub fn is_query_error(&self) -> bool {
        self.disposition() == RetryDisposition::NonRetryable
    }
}

/// Fixed attempt budget with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the budget runs out.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.disposition() == RetryDisposition::Retryable && attempt < attempts => {
                warn!(what, attempt, attempts, error = %err, "retrying after failure");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

/// Thin reqwest wrapper issuing single JSON GET requests under a global concurrency cap.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
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
        })
    }

    /// One attempt; callers wrap this in [`with_retries`].
    pub async fn get_json(&self, url: &str, params: &[(String, String)]) -> Result<serde_json::Value, FetchError> {
        let Ok(_permit) = self.global_limit.acquire().await else {
            return Err(FetchError::Malformed {
                url: url.to_string(),
                message: "http client is shut down".to_string(),
            });
        };

        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).query(params).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(status_error(status, url));
            }
            let body = resp.bytes().await?;
            serde_json::from_slice(&body).map_err(|err| FetchError::Malformed {
                url: url.to_string(),
                message: err.to_string(),
            })
        }
        .instrument(span)
        .await
    }
}

fn status_error(status: StatusCode, url: &str) -> FetchError {
    FetchError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_status_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = with_retries(&quick(5), "test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(FetchError::HttpStatus {
                    status: 503,
                    url: "u".into(),
                })
            } else {
                Ok(7)
            }
        })
        .await
        .expect("third attempt succeeds");
        assert_eq!(out, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = with_retries(&quick(3), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::HttpStatus {
                status: 404,
                url: "u".into(),
            })
        })
        .await;
        assert!(matches!(out, Err(FetchError::HttpStatus { status: 404, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn malformed_payload_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = with_retries(&quick(5), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Malformed {
                url: "u".into(),
                message: "no features".into(),
            })
        })
        .await;
        assert!(out.unwrap_err().is_query_error());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
