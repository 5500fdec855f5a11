//! Fallback cascade across ordered candidate URLs.
//!
//! URLs are tried strictly in input order and are never reordered mid-call.
//! Each URL gets up to `max_retries_per_url` retries with exponential
//! backoff; when a URL's budget is exhausted, or it fails in a way a retry
//! cannot recover from (see [`FetchError::is_retryable`]), the cascade
//! advances to the next one. The first success returns immediately without
//! touching the remaining URLs.
//!
//! Every attempt, success or failure, is reported to the injected
//! [`UrlHealthTracker`]. Per-attempt timeouts count as ordinary failures
//! subject to the same retry and fallback rules.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::Client;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{FetchError, FetchResult, UrlFailure};
use crate::health::UrlHealthTracker;
use crate::model::FallbackFetchResult;
use crate::settings::FetchSettings;

/// Callback fired before a failed attempt is retried or the next URL is
/// tried: `(url, url_index, attempt)` with `attempt` 1-based.
pub type RetryCallback = Arc<dyn Fn(&str, usize, u32) + Send + Sync>;

/// Cascades a fetch across ordered candidate URLs with retry and backoff.
#[derive(Clone)]
pub struct FallbackFetcher {
    client: Client,
    settings: FetchSettings,
    tracker: Arc<UrlHealthTracker>,
    cancel: CancellationToken,
    on_retry: Option<RetryCallback>,
}

impl FallbackFetcher {
    /// Create a fetcher reporting into the given health tracker.
    pub fn new(
        client: Client,
        settings: FetchSettings,
        tracker: Arc<UrlHealthTracker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            settings,
            tracker,
            cancel,
            on_retry: None,
        }
    }

    /// Attach a callback invoked whenever an attempt fails and another one
    /// will follow, so callers can surface a "retrying" state.
    pub fn with_retry_callback(mut self, cb: RetryCallback) -> Self {
        self.on_retry = Some(cb);
        self
    }

    /// Fetch from the first URL that responds, in strict input order.
    ///
    /// Fails with [`FetchError::NoUrls`] for an empty list and with
    /// [`FetchError::Exhausted`] only after every URL's retry budget is
    /// spent; a non-retryable failure forfeits the rest of its URL's budget.
    /// `retry_count` in the result is cumulative across all URLs attempted
    /// in this call.
    pub async fn fetch_with_fallback(&self, urls: &[String]) -> FetchResult<FallbackFetchResult> {
        if urls.is_empty() {
            return Err(FetchError::NoUrls);
        }

        let started = Instant::now();
        let mut retries: u32 = 0;
        let mut failures: Vec<UrlFailure> = Vec::new();

        for (url_index, url) in urls.iter().enumerate() {
            let mut last_error: Option<FetchError> = None;

            for attempt in 1..=self.settings.max_retries_per_url.max(1) {
                if self.cancel.is_cancelled() {
                    return Err(FetchError::Cancelled);
                }

                match self.attempt(url).await {
                    Ok(bytes) => {
                        self.tracker.record_success(url);
                        debug!(url, url_index, attempt, "fallback fetch succeeded");
                        return Ok(FallbackFetchResult {
                            bytes,
                            url_index,
                            success_url: url.clone(),
                            retry_count: retries,
                            duration: started.elapsed(),
                        });
                    }
                    Err(error) => {
                        self.tracker.record_failure(url, error.to_string());
                        retries += 1;
                        debug!(url, attempt, %error, "fetch attempt failed");

                        let more_attempts_for_url =
                            error.is_retryable() && attempt < self.settings.max_retries_per_url;
                        let more_urls = url_index + 1 < urls.len();
                        if (more_attempts_for_url || more_urls)
                            && let Some(cb) = &self.on_retry
                        {
                            cb(url, url_index, attempt);
                        }
                        last_error = Some(error);

                        if !more_attempts_for_url {
                            break;
                        }
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                    }
                }
            }

            failures.push(UrlFailure {
                url: url.clone(),
                error: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }

        warn!(urls = urls.len(), attempts = retries, "all fallback URLs exhausted");
        Err(FetchError::Exhausted {
            attempts: retries,
            failures,
        })
    }

    /// Parse and validate an absolute HTTP(S) URL.
    fn parse_url(url: &str) -> FetchResult<url::Url> {
        let parsed = url::Url::parse(url).map_err(|e| FetchError::Transport {
            url: url.to_string(),
            message: format!("invalid URL: {e}"),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::Transport {
                url: url.to_string(),
                message: format!("unsupported URL scheme '{}'", parsed.scheme()),
            });
        }
        Ok(parsed)
    }

    /// One HTTP attempt against one URL, bounded by the request timeout.
    async fn attempt(&self, url: &str) -> FetchResult<Bytes> {
        let parsed = Self::parse_url(url)?;
        let request = self.client.get(parsed).send();
        let response = match timeout(self.settings.request_timeout, request).await {
            Err(_) => return Err(FetchError::Timeout(url.to_string())),
            Ok(Err(error)) => {
                return Err(if error.is_timeout() {
                    FetchError::Timeout(url.to_string())
                } else {
                    FetchError::Transport {
                        url: url.to_string(),
                        message: error.to_string(),
                    }
                });
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        match timeout(self.settings.request_timeout, response.bytes()).await {
            Err(_) => Err(FetchError::Timeout(url.to_string())),
            Ok(Err(error)) => Err(FetchError::Transport {
                url: url.to_string(),
                message: error.to_string(),
            }),
            Ok(Ok(bytes)) => Ok(bytes),
        }
    }

    /// Exponential backoff for the given 1-based attempt, capped at
    /// `max_retry_delay`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.settings.retry_base_delay.saturating_mul(1 << exp);
        delay.min(self.settings.max_retry_delay)
    }
}
