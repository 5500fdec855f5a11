//! The blob acquisition pipeline.
//!
//! Composes the cache, fetchers and verifier into a linear pipeline of
//! explicit stages:
//!
//! ```text
//! CHECK_CACHE ── hit ──────────────────────────────▶ DONE (was_cached)
//!      │ miss
//!      ▼
//!    FETCH (fallback cascade, or chunked above the size threshold)
//!      ▼
//!    VERIFY ── invalid ──▶ FAIL (never cached, never reported acquired)
//!      ▼
//!    CACHE_WRITE (capacity skip is advisory) ──▶ DONE
//! ```
//!
//! The orchestrator owns its health tracker and cache; there is no implicit
//! global state, and every dependency is an explicit constructed instance
//! whose lifetime is tied to the orchestrator.
//!
//! Failures carry the original descriptor and the phase they occurred in.
//! Progress callbacks are phase-tagged and keep firing during retries.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bandwidth::BandwidthEstimator;
use crate::cache::BlobCache;
use crate::chunked::ChunkedDownloader;
use crate::error::{FetchError, FetchResult, UrlFailure};
use crate::fallback::FallbackFetcher;
use crate::health::UrlHealthTracker;
use crate::model::{
    AcquirePhase, AcquireProgress, AcquiredBlob, BlobDescriptor, FetchSummary, VerificationResult,
};
use crate::settings::FetchSettings;
use crate::verify::IntegrityVerifier;

/// Phase-tagged progress callback for [`BlobAcquisitionOrchestrator::acquire`].
pub type AcquireProgressCallback = Arc<dyn Fn(AcquireProgress) + Send + Sync>;

/// Terminal acquisition failure, carrying the descriptor it was for and the
/// pipeline phase that failed.
#[derive(Debug, thiserror::Error)]
#[error("acquisition failed in {phase:?} for {hash}: {source}", hash = .descriptor.content_hash)]
pub struct AcquireError {
    /// The descriptor the caller asked for.
    pub descriptor: BlobDescriptor,
    /// Pipeline phase the failure occurred in.
    pub phase: AcquirePhase,
    /// The underlying failure.
    #[source]
    pub source: FetchError,
}

/// Composes cache lookup, fetching, verification and cache write-back.
pub struct BlobAcquisitionOrchestrator {
    client: Client,
    settings: FetchSettings,
    tracker: Arc<UrlHealthTracker>,
    cache: BlobCache,
    estimator: Arc<BandwidthEstimator>,
    verifier: IntegrityVerifier,
    cancel: CancellationToken,
}

impl BlobAcquisitionOrchestrator {
    /// Create an orchestrator with its own health tracker and cache.
    ///
    /// Must be called from within a tokio runtime (the cache spawns its
    /// actor task).
    pub fn new(settings: FetchSettings) -> Self {
        let cache = BlobCache::new(settings.cache_capacity_bytes);
        Self::from_parts(Client::new(), settings, Arc::new(UrlHealthTracker::new()), cache)
    }

    /// Create an orchestrator around externally constructed collaborators,
    /// e.g. to share one tracker or cache across several orchestrators.
    pub fn from_parts(
        client: Client,
        settings: FetchSettings,
        tracker: Arc<UrlHealthTracker>,
        cache: BlobCache,
    ) -> Self {
        let verifier = IntegrityVerifier::new(settings.verify_window_bytes);
        let estimator = Arc::new(BandwidthEstimator::new(client.clone(), settings.clone()));
        Self {
            client,
            settings,
            tracker,
            cache,
            estimator,
            verifier,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the cancellation token observed by fetch operations.
    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The health tracker all fetch attempts report into.
    pub fn health_tracker(&self) -> &Arc<UrlHealthTracker> {
        &self.tracker
    }

    /// Handle to the blob cache.
    pub fn cache(&self) -> &BlobCache {
        &self.cache
    }

    /// Acquire the blob described by `descriptor`: serve from cache, or
    /// fetch, verify and cache it.
    ///
    /// An invalid hash is terminal: the bytes are neither cached nor
    /// returned, even though they were downloaded.
    pub async fn acquire(
        &self,
        descriptor: &BlobDescriptor,
        on_progress: Option<AcquireProgressCallback>,
    ) -> Result<AcquiredBlob, AcquireError> {
        let started = Instant::now();

        if !descriptor.has_well_formed_hash() {
            return Err(self.fail(
                descriptor,
                AcquirePhase::CheckCache,
                FetchError::InvalidHash(descriptor.content_hash.clone()),
            ));
        }
        let key = descriptor.content_hash.to_ascii_lowercase();

        // CHECK_CACHE
        match self.cache.get(&key).await {
            Ok(Some(bytes)) => {
                debug!(hash = %key, "cache hit");
                return Ok(AcquiredBlob {
                    bytes,
                    was_cached: true,
                    fetch: None,
                    verification: None,
                    duration: started.elapsed(),
                });
            }
            Ok(None) => {}
            Err(error) => return Err(self.fail(descriptor, AcquirePhase::CheckCache, error)),
        }

        // FETCH
        let (bytes, fetch) = self
            .fetch(descriptor, on_progress.as_ref())
            .await
            .map_err(|e| self.fail(descriptor, AcquirePhase::Fetching, e))?;

        // VERIFY
        let verification = self
            .verify(descriptor, &bytes, on_progress.as_ref())
            .map_err(|e| self.fail(descriptor, AcquirePhase::Verifying, e))?;
        if !verification.is_valid {
            return Err(self.fail(
                descriptor,
                AcquirePhase::Verifying,
                FetchError::IntegrityMismatch {
                    expected: verification.expected_hash.clone(),
                    computed: verification.computed_hash.clone(),
                },
            ));
        }

        // CACHE_WRITE
        match self.cache.put(&key, bytes.clone()).await {
            Ok(stored) => {
                if !stored {
                    debug!(hash = %key, size = bytes.len(), "blob not cached (capacity skip)");
                }
            }
            Err(error) => return Err(self.fail(descriptor, AcquirePhase::CacheWrite, error)),
        }

        info!(
            hash = %key,
            size = bytes.len(),
            url = %fetch.success_url,
            duration_ms = started.elapsed().as_millis() as u64,
            "blob acquired"
        );
        Ok(AcquiredBlob {
            bytes,
            was_cached: false,
            fetch: Some(fetch),
            verification: Some(verification),
            duration: started.elapsed(),
        })
    }

    /// Fetch phase: chunked cascade above the size threshold, fallback
    /// cascade below it.
    async fn fetch(
        &self,
        descriptor: &BlobDescriptor,
        on_progress: Option<&AcquireProgressCallback>,
    ) -> FetchResult<(Bytes, FetchSummary)> {
        if descriptor.size_bytes >= self.settings.chunk_threshold_bytes {
            self.fetch_chunked(descriptor, on_progress).await
        } else {
            self.fetch_fallback(descriptor, on_progress).await
        }
    }

    async fn fetch_fallback(
        &self,
        descriptor: &BlobDescriptor,
        on_progress: Option<&AcquireProgressCallback>,
    ) -> FetchResult<(Bytes, FetchSummary)> {
        let mut fetcher = FallbackFetcher::new(
            self.client.clone(),
            self.settings.clone(),
            self.tracker.clone(),
            self.cancel.clone(),
        );
        if let Some(cb) = on_progress {
            let cb = cb.clone();
            fetcher = fetcher.with_retry_callback(Arc::new(move |url, url_index, attempt| {
                cb(AcquireProgress::Retrying {
                    url: url.to_string(),
                    url_index,
                    attempt,
                });
            }));
        }

        let result = fetcher
            .fetch_with_fallback(&descriptor.candidate_urls)
            .await?;
        let summary = FetchSummary {
            url_index: result.url_index,
            success_url: result.success_url.clone(),
            retry_count: result.retry_count,
            duration: result.duration,
        };
        Ok((result.bytes, summary))
    }

    /// Chunked cascade: try each candidate URL in order with the chunked
    /// downloader (which itself falls back to a single request when the
    /// endpoint lacks range support). One attempt per URL; per-URL failures
    /// advance the cascade, mirroring the fallback fetcher's semantics.
    async fn fetch_chunked(
        &self,
        descriptor: &BlobDescriptor,
        on_progress: Option<&AcquireProgressCallback>,
    ) -> FetchResult<(Bytes, FetchSummary)> {
        if descriptor.candidate_urls.is_empty() {
            return Err(FetchError::NoUrls);
        }

        let downloader = ChunkedDownloader::new(
            self.client.clone(),
            self.settings.clone(),
            self.estimator.clone(),
            self.cancel.clone(),
        );
        let progress: Option<crate::chunked::ProgressCallback> = on_progress.map(|cb| {
            let cb = cb.clone();
            Arc::new(move |p| cb(AcquireProgress::Fetching(p))) as crate::chunked::ProgressCallback
        });

        let started = Instant::now();
        let mut failures: Vec<UrlFailure> = Vec::new();

        for (url_index, url) in descriptor.candidate_urls.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            match downloader
                .download_in_chunks(descriptor, url, progress.clone())
                .await
            {
                Ok(bytes) => {
                    self.tracker.record_success(url);
                    let summary = FetchSummary {
                        url_index,
                        success_url: url.clone(),
                        retry_count: failures.len() as u32,
                        duration: started.elapsed(),
                    };
                    return Ok((bytes, summary));
                }
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(error) => {
                    self.tracker.record_failure(url, error.to_string());
                    debug!(url, %error, "chunked fetch failed, advancing to next URL");
                    if url_index + 1 < descriptor.candidate_urls.len()
                        && let Some(cb) = on_progress
                    {
                        cb(AcquireProgress::Retrying {
                            url: url.clone(),
                            url_index,
                            attempt: 1,
                        });
                    }
                    failures.push(UrlFailure {
                        url: url.clone(),
                        error: error.to_string(),
                    });
                }
            }
        }

        Err(FetchError::Exhausted {
            attempts: failures.len() as u32,
            failures,
        })
    }

    fn verify(
        &self,
        descriptor: &BlobDescriptor,
        bytes: &Bytes,
        on_progress: Option<&AcquireProgressCallback>,
    ) -> FetchResult<VerificationResult> {
        match on_progress {
            Some(cb) => self.verifier.verify_with_progress(
                bytes,
                &descriptor.content_hash,
                Some(&|bytes_hashed, total_bytes| {
                    cb(AcquireProgress::Verifying {
                        bytes_hashed,
                        total_bytes,
                    });
                }),
            ),
            None => self.verifier.verify(bytes, &descriptor.content_hash),
        }
    }

    fn fail(
        &self,
        descriptor: &BlobDescriptor,
        phase: AcquirePhase,
        source: FetchError,
    ) -> AcquireError {
        AcquireError {
            descriptor: descriptor.clone(),
            phase,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_hash_fails_before_any_network_io() {
        let orchestrator = BlobAcquisitionOrchestrator::new(FetchSettings::default());
        let descriptor = BlobDescriptor::new(
            "not-a-hash",
            100,
            "video/mp4",
            vec!["http://127.0.0.1:9/unreachable".to_string()],
        );

        let error = orchestrator.acquire(&descriptor, None).await.unwrap_err();
        assert_eq!(error.phase, AcquirePhase::CheckCache);
        assert!(matches!(error.source, FetchError::InvalidHash(_)));
        // No attempt was recorded against the URL.
        assert_eq!(
            orchestrator
                .health_tracker()
                .health("http://127.0.0.1:9/unreachable")
                .failure_count,
            0
        );
    }
}
