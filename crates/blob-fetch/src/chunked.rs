//! Range-based chunked parallel download.
//!
//! Flow
//! ----
//! 1. Probe range support with a 2-byte request (`Range: bytes=0-1`). Only a
//!    206 with a consistent `Content-Range` counts; a plain 200 is never
//!    treated as range support, even when the body happens to be the right
//!    size — silently ignoring `Range` is a server defect. As a workaround
//!    for misconfigured servers, a 200 carrying `Accept-Ranges` other than
//!    `none` is accepted as a secondary signal, but only when
//!    `Content-Length` matches the declared blob size.
//! 2. Without range support, fall back to one whole-resource request.
//! 3. With range support, dispatch waves of concurrent ranged requests. The
//!    wave width is seeded from a bandwidth probe against the URL and
//!    re-tuned between waves from each wave's success/failure outcome; when
//!    the probe fails, the configured static width is used. This is
//!    deliberately not a work-stealing pool; at the chunk counts involved,
//!    waves are simpler and sufficient.
//!
//! Per-chunk failures are captured by index and do not abort in-flight
//! chunks. After all attempts settle, every index must be present and the
//! reassembled length must equal the declared size — otherwise the call
//! fails with a structured [`IncompleteTransferReport`], never a silently
//! truncated buffer. Reassembly is strictly by index, regardless of
//! completion order.
//!
//! Cancellation is checked between waves (best-effort); requests of the
//! active wave are not forcibly aborted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use reqwest::Client;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bandwidth::{BandwidthEstimator, WaveMetrics};
use crate::error::{FetchError, FetchResult};
use crate::model::{BlobDescriptor, IncompleteTransferReport, TransferProgress};
use crate::settings::FetchSettings;

/// Callback fired after each completed chunk (and once for a single-request
/// fallback transfer).
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Downloads a blob as bounded waves of ranged requests.
#[derive(Clone)]
pub struct ChunkedDownloader {
    client: Client,
    settings: FetchSettings,
    estimator: Arc<BandwidthEstimator>,
    cancel: CancellationToken,
}

impl ChunkedDownloader {
    /// Create a downloader sharing the given HTTP client and bandwidth
    /// estimator.
    pub fn new(
        client: Client,
        settings: FetchSettings,
        estimator: Arc<BandwidthEstimator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            settings,
            estimator,
            cancel,
        }
    }

    /// Probe whether `url` honors range requests for a blob of
    /// `declared_size` bytes.
    pub async fn probe_range_support(&self, url: &str, declared_size: u64) -> FetchResult<bool> {
        let response = timeout(
            self.settings.request_timeout,
            self.client.get(url).header("Range", "bytes=0-1").send(),
        )
        .await
        .map_err(|_| FetchError::Timeout(url.to_string()))?
        .map_err(|e| transport(url, e))?;

        let status = response.status().as_u16();
        if status == 206 {
            let consistent = response
                .headers()
                .get("Content-Range")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| content_range_is_consistent(v, declared_size));
            if !consistent {
                warn!(url, "206 response with inconsistent Content-Range, treating as unsupported");
            }
            return Ok(consistent);
        }

        if status == 200 {
            // Misconfigured-server workaround: some servers advertise ranges
            // but answer 200. Accept only when Content-Length confirms the
            // full resource, so a truncating proxy cannot slip through.
            let accept_ranges = response
                .headers()
                .get("Accept-Ranges")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| !v.eq_ignore_ascii_case("none"));
            let length_matches = response.content_length() == Some(declared_size);
            if accept_ranges && length_matches {
                debug!(url, "accepting Accept-Ranges on a 200 as range support");
                return Ok(true);
            }
            return Ok(false);
        }

        Err(FetchError::Http {
            status,
            url: url.to_string(),
        })
    }

    /// Download the blob described by `descriptor` from `url`.
    ///
    /// Uses the chunked path when the endpoint supports ranges, otherwise a
    /// single whole-resource request. Either way the result is validated
    /// against the declared size.
    pub async fn download_in_chunks(
        &self,
        descriptor: &BlobDescriptor,
        url: &str,
        on_progress: Option<ProgressCallback>,
    ) -> FetchResult<Bytes> {
        if descriptor.size_bytes == 0 {
            return Err(FetchError::InvalidParams("blob size must be non-zero"));
        }

        if !self.probe_range_support(url, descriptor.size_bytes).await? {
            debug!(url, "no range support, using single-request fallback");
            return self.download_single(descriptor, url, on_progress).await;
        }

        let plan = plan_chunks(descriptor.size_bytes, self.settings.chunk_size_bytes);
        let total_chunks = plan.len();

        let mut wave_width = match self.estimator.probe(url).await {
            Ok(sample) => self.estimator.seed_from_sample(&sample),
            Err(error) => {
                debug!(url, %error, "bandwidth probe failed, using configured wave width");
                self.settings.max_parallel_chunks.max(1)
            }
        };
        debug!(
            url,
            total_chunks,
            chunk_size = self.settings.chunk_size_bytes,
            wave_width,
            "starting chunked download"
        );

        let mut slots: Vec<Option<Bytes>> = vec![None; total_chunks];
        let mut failed: Vec<(usize, String)> = Vec::new();
        let mut received: u64 = 0;
        let mut speed = SpeedTracker::new();
        let mut pending: VecDeque<ChunkRange> = plan.into_iter().collect();

        while !pending.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let take = wave_width.max(1).min(pending.len());
            let wave: Vec<ChunkRange> = pending.drain(..take).collect();
            let mut wave_succeeded: u32 = 0;
            let mut wave_failed: u32 = 0;
            let mut congestion = false;

            let mut in_flight: FuturesUnordered<_> = wave
                .iter()
                .map(|chunk| {
                    let chunk = *chunk;
                    async move {
                        let result = self.fetch_chunk(url, chunk).await;
                        (chunk.index, result)
                    }
                })
                .collect();

            while let Some((index, result)) = in_flight.next().await {
                match result {
                    Ok(bytes) => {
                        wave_succeeded += 1;
                        received += bytes.len() as u64;
                        speed.record(bytes.len() as u64);
                        slots[index] = Some(bytes);
                        if let Some(cb) = &on_progress {
                            cb(progress_event(
                                received,
                                descriptor.size_bytes,
                                &speed,
                                index,
                                total_chunks,
                            ));
                        }
                    }
                    Err(error) => {
                        trace!(index, %error, "chunk failed");
                        wave_failed += 1;
                        congestion |= matches!(error, FetchError::Timeout(_));
                        failed.push((index, error.to_string()));
                    }
                }
            }

            wave_width = self.estimator.auto_tune(&[WaveMetrics {
                succeeded: wave_succeeded,
                failed: wave_failed,
                congestion,
            }]);
        }

        let missing: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.is_none().then_some(i))
            .collect();

        if !missing.is_empty() || received != descriptor.size_bytes {
            let mut failed = failed;
            failed.sort_by_key(|(i, _)| *i);
            warn!(
                url,
                missing = missing.len(),
                received,
                expected = descriptor.size_bytes,
                "chunked download incomplete"
            );
            return Err(FetchError::Incomplete(IncompleteTransferReport {
                url: url.to_string(),
                expected_size: descriptor.size_bytes,
                received_size: received,
                missing_chunk_indices: missing,
                failed_chunks: failed,
            }));
        }

        let mut assembled = BytesMut::with_capacity(descriptor.size_bytes as usize);
        for slot in slots {
            assembled.extend_from_slice(&slot.expect("validated above"));
        }
        Ok(assembled.freeze())
    }

    /// Whole-resource fallback for endpoints without range support.
    async fn download_single(
        &self,
        descriptor: &BlobDescriptor,
        url: &str,
        on_progress: Option<ProgressCallback>,
    ) -> FetchResult<Bytes> {
        let started = Instant::now();
        let response = timeout(self.settings.request_timeout, self.client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout(url.to_string()))?
            .map_err(|e| transport(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let bytes = timeout(self.settings.request_timeout, response.bytes())
            .await
            .map_err(|_| FetchError::Timeout(url.to_string()))?
            .map_err(|e| transport(url, e))?;

        if bytes.len() as u64 != descriptor.size_bytes {
            return Err(FetchError::Incomplete(IncompleteTransferReport {
                url: url.to_string(),
                expected_size: descriptor.size_bytes,
                received_size: bytes.len() as u64,
                missing_chunk_indices: Vec::new(),
                failed_chunks: Vec::new(),
            }));
        }

        if let Some(cb) = &on_progress {
            let elapsed = started.elapsed().as_secs_f64().max(1e-3);
            cb(TransferProgress {
                bytes_received: bytes.len() as u64,
                total_bytes: descriptor.size_bytes,
                percent: 100.0,
                speed_bps: bytes.len() as f64 / elapsed,
                eta: Some(Duration::ZERO),
                chunk_index: 0,
                total_chunks: 1,
            });
        }
        Ok(bytes)
    }

    /// One ranged request for one chunk. Anything other than a 206 with the
    /// exact requested length is an error for this chunk only.
    async fn fetch_chunk(&self, url: &str, chunk: ChunkRange) -> FetchResult<Bytes> {
        let range = format!("bytes={}-{}", chunk.start, chunk.end);
        let response = timeout(
            self.settings.request_timeout,
            self.client.get(url).header("Range", range).send(),
        )
        .await
        .map_err(|_| FetchError::Timeout(url.to_string()))?
        .map_err(|e| transport(url, e))?;

        let status = response.status().as_u16();
        if status != 206 {
            return Err(FetchError::Http {
                status,
                url: url.to_string(),
            });
        }

        let bytes = timeout(self.settings.request_timeout, response.bytes())
            .await
            .map_err(|_| FetchError::Timeout(url.to_string()))?
            .map_err(|e| transport(url, e))?;

        let expected = chunk.len();
        if bytes.len() as u64 != expected {
            return Err(FetchError::msg(format!(
                "chunk {} returned {} bytes, expected {expected}",
                chunk.index,
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

/// One planned ranged sub-download; byte range is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Position in the reassembly order, `0..N-1`.
    pub index: usize,
    /// First byte of the range.
    pub start: u64,
    /// Last byte of the range (inclusive).
    pub end: u64,
}

impl ChunkRange {
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Split `size` bytes into `ceil(size / chunk_size)` inclusive ranges.
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<ChunkRange> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(size.div_ceil(chunk_size) as usize);
    let mut start = 0u64;
    let mut index = 0usize;
    while start < size {
        let end = (start + chunk_size - 1).min(size - 1);
        chunks.push(ChunkRange { index, start, end });
        start = end + 1;
        index += 1;
    }
    chunks
}

/// `Content-Range` must describe the probed `0-1` range; when it carries a
/// numeric total and the declared size is known, the two must agree.
fn content_range_is_consistent(value: &str, declared_size: u64) -> bool {
    let Some(rest) = value.trim().strip_prefix("bytes ") else {
        return false;
    };
    let Some((range, total)) = rest.split_once('/') else {
        return false;
    };
    if range.trim() != "0-1" {
        return false;
    }
    match total.trim() {
        "*" => true,
        total => match total.parse::<u64>() {
            Ok(total) => declared_size == 0 || total == declared_size,
            Err(_) => false,
        },
    }
}

fn transport(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout(url.to_string())
    } else {
        FetchError::Transport {
            url: url.to_string(),
            message: error.to_string(),
        }
    }
}

fn progress_event(
    received: u64,
    total: u64,
    speed: &SpeedTracker,
    chunk_index: usize,
    total_chunks: usize,
) -> TransferProgress {
    let speed_bps = speed.speed_bps();
    let remaining = total.saturating_sub(received);
    TransferProgress {
        bytes_received: received,
        total_bytes: total,
        percent: (received as f64 / total.max(1) as f64) * 100.0,
        speed_bps,
        eta: (speed_bps > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / speed_bps)),
        chunk_index,
        total_chunks,
    }
}

/// Rolling throughput over a short trailing window, falling back to the
/// overall average while the window is still filling.
struct SpeedTracker {
    started: Instant,
    total_bytes: u64,
    samples: VecDeque<(Instant, u64)>,
}

const SPEED_WINDOW: Duration = Duration::from_secs(5);

impl SpeedTracker {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            total_bytes: 0,
            samples: VecDeque::new(),
        }
    }

    fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.total_bytes += bytes;
        self.samples.push_back((now, bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > SPEED_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn speed_bps(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        if let (Some(&(oldest, _)), true) = (self.samples.front(), self.samples.len() > 1) {
            let span = oldest.elapsed().as_secs_f64();
            if span > 0.2 {
                let windowed: u64 = self.samples.iter().map(|&(_, b)| b).sum();
                return windowed as f64 / span;
            }
        }
        self.total_bytes as f64 / elapsed.max(1e-3)
    }
}
