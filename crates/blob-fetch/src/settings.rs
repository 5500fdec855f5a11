//! Unified configuration for the `blob-fetch` crate.
//!
//! This structure flattens all per-component knobs into a single type so the
//! orchestrator, fallback fetcher, chunked downloader, bandwidth estimator
//! and cache share one configuration surface.
//!
//! Included configuration domains:
//! - HTTP behavior (timeouts, retries, backoff)
//! - Chunked download behavior (chunk size, wave width, chunking threshold)
//! - Bandwidth estimation (probe TTL, sample size, concurrency bounds)
//! - Verification (streaming window size)
//! - Cache capacity

use std::time::Duration;

/// Unified settings for blob acquisition.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    // ----------------------------
    // HTTP / retry behavior
    // ----------------------------
    /// Timeout for a single HTTP attempt. A timed-out attempt counts as a
    /// failure subject to the normal retry and fallback rules.
    /// Default: 30 seconds.
    pub request_timeout: Duration,

    /// Maximum number of retry attempts per candidate URL before advancing
    /// to the next one. Default: 3.
    pub max_retries_per_url: u32,

    /// Base delay for exponential backoff between retries.
    /// Default: 100ms.
    pub retry_base_delay: Duration,

    /// Maximum backoff delay (cap for exponential growth).
    /// Default: 5 seconds.
    pub max_retry_delay: Duration,

    // ----------------------------
    // Chunked download behavior
    // ----------------------------
    /// Size of one ranged chunk request. Default: 1 MiB.
    pub chunk_size_bytes: u64,

    /// Static wave width used when no bandwidth sample is available; with a
    /// sample, the wave width is tuned by the bandwidth estimator instead.
    /// Default: 4.
    pub max_parallel_chunks: usize,

    /// Blobs at or above this size use the chunked path when the endpoint
    /// supports range requests. Default: 4 MiB.
    pub chunk_threshold_bytes: u64,

    // ----------------------------
    // Bandwidth estimation
    // ----------------------------
    /// How long a probe result stays fresh before the URL is re-probed.
    /// Default: 10 minutes.
    pub probe_ttl: Duration,

    /// Number of bytes requested by a throughput probe. Default: 256 KiB.
    pub probe_sample_bytes: u64,

    /// Lower clamp for recommended chunk concurrency. Default: 1.
    pub min_concurrency: usize,

    /// Upper clamp for recommended chunk concurrency. Default: 12.
    pub max_concurrency: usize,

    /// Latency above this threshold bumps the recommended concurrency by
    /// [`FetchSettings::latency_concurrency_step`]. Default: 200ms.
    pub latency_threshold: Duration,

    /// Fixed concurrency increase applied on high latency. Default: 2.
    pub latency_concurrency_step: usize,

    // ----------------------------
    // Verification
    // ----------------------------
    /// Window size for streaming hash computation. Default: 1 MiB.
    pub verify_window_bytes: usize,

    // ----------------------------
    // Cache
    // ----------------------------
    /// Total capacity of the in-memory blob cache. Default: 256 MiB.
    pub cache_capacity_bytes: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries_per_url: 3,
            retry_base_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(5),

            chunk_size_bytes: 1024 * 1024,
            max_parallel_chunks: 4,
            chunk_threshold_bytes: 4 * 1024 * 1024,

            probe_ttl: Duration::from_secs(600),
            probe_sample_bytes: 256 * 1024,
            min_concurrency: 1,
            max_concurrency: 12,
            latency_threshold: Duration::from_millis(200),
            latency_concurrency_step: 2,

            verify_window_bytes: 1024 * 1024,

            cache_capacity_bytes: 256 * 1024 * 1024,
        }
    }
}

impl FetchSettings {
    // -------------------------
    // Constructors
    // -------------------------

    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings tuned for mobile networks.
    /// - Shorter timeouts
    /// - More aggressive retries
    /// - Smaller chunks
    pub fn mobile(mut self) -> Self {
        self.request_timeout = Duration::from_secs(15);
        self.max_retries_per_url = 5;
        self.retry_base_delay = Duration::from_millis(50);
        self.max_retry_delay = Duration::from_secs(3);
        self.chunk_size_bytes = 512 * 1024;
        self.max_parallel_chunks = 2;
        self
    }

    /// Settings tuned for fast, reliable links.
    /// - Larger chunks
    /// - Wider waves
    pub fn high_throughput(mut self) -> Self {
        self.chunk_size_bytes = 4 * 1024 * 1024;
        self.max_parallel_chunks = 8;
        self
    }

    // -------------------------
    // HTTP / retry setters
    // -------------------------

    pub fn request_timeout(mut self, v: Duration) -> Self {
        self.request_timeout = v;
        self
    }

    pub fn max_retries_per_url(mut self, v: u32) -> Self {
        self.max_retries_per_url = v;
        self
    }

    pub fn retry_base_delay(mut self, v: Duration) -> Self {
        self.retry_base_delay = v;
        self
    }

    pub fn max_retry_delay(mut self, v: Duration) -> Self {
        self.max_retry_delay = v;
        self
    }

    // -------------------------
    // Chunked download setters
    // -------------------------

    pub fn chunk_size_bytes(mut self, v: u64) -> Self {
        self.chunk_size_bytes = v;
        self
    }

    pub fn max_parallel_chunks(mut self, v: usize) -> Self {
        self.max_parallel_chunks = v;
        self
    }

    pub fn chunk_threshold_bytes(mut self, v: u64) -> Self {
        self.chunk_threshold_bytes = v;
        self
    }

    // -------------------------
    // Bandwidth estimation setters
    // -------------------------

    pub fn probe_ttl(mut self, v: Duration) -> Self {
        self.probe_ttl = v;
        self
    }

    pub fn probe_sample_bytes(mut self, v: u64) -> Self {
        self.probe_sample_bytes = v;
        self
    }

    pub fn min_concurrency(mut self, v: usize) -> Self {
        self.min_concurrency = v;
        self
    }

    pub fn max_concurrency(mut self, v: usize) -> Self {
        self.max_concurrency = v;
        self
    }

    pub fn latency_threshold(mut self, v: Duration) -> Self {
        self.latency_threshold = v;
        self
    }

    pub fn latency_concurrency_step(mut self, v: usize) -> Self {
        self.latency_concurrency_step = v;
        self
    }

    // -------------------------
    // Verification / cache setters
    // -------------------------

    pub fn verify_window_bytes(mut self, v: usize) -> Self {
        self.verify_window_bytes = v;
        self
    }

    pub fn cache_capacity_bytes(mut self, v: u64) -> Self {
        self.cache_capacity_bytes = v;
        self
    }
}
