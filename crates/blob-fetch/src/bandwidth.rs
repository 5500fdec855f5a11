//! Bandwidth probing and concurrency/quality recommendations.
//!
//! Three concerns live here:
//! - `probe` samples achieved throughput against a URL, caching the result
//!   per URL for a TTL so repeated acquisitions do not re-probe.
//! - `recommend_concurrency` maps bandwidth into discrete tiers, with a
//!   fixed bump on high latency (more in-flight requests hide round trips).
//! - `auto_tune` is a hysteretic control loop over recent wave metrics. It
//!   moves at most one tier per call and holds inside the dead band, so the
//!   concurrency level does not oscillate on noisy links.
//!
//! `recommend_quality` selects the highest-bitrate variant that fits within
//! 80% of measured bandwidth, leaving 20% headroom for jitter.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{debug, trace};

use crate::error::{FetchError, FetchResult};
use crate::model::QualityVariant;
use crate::settings::FetchSettings;

/// Discrete concurrency ladder used by the tier mapping and by `auto_tune`.
const CONCURRENCY_TIERS: [usize; 5] = [1, 2, 4, 8, 12];

/// One throughput measurement.
#[derive(Debug, Clone)]
pub struct BandwidthSample {
    /// Achieved throughput in megabits per second.
    pub mbps: f64,
    /// Time to first response byte.
    pub latency: Duration,
    /// When the sample was taken; used for TTL-based cache expiry.
    pub sampled_at: Instant,
}

/// Aggregate outcome of one chunk wave, fed into [`BandwidthEstimator::auto_tune`].
#[derive(Debug, Clone, Copy)]
pub struct WaveMetrics {
    /// Chunks that completed in this wave.
    pub succeeded: u32,
    /// Chunks that failed in this wave.
    pub failed: u32,
    /// Whether the wave showed congestion (e.g. throughput collapse or
    /// per-request timeouts).
    pub congestion: bool,
}

/// Probes throughput and recommends chunk concurrency / playback quality.
#[derive(Debug)]
pub struct BandwidthEstimator {
    client: Client,
    settings: FetchSettings,
    probes: Mutex<HashMap<String, BandwidthSample>>,
    current_concurrency: AtomicUsize,
}

impl BandwidthEstimator {
    /// Create an estimator sharing the given HTTP client.
    pub fn new(client: Client, settings: FetchSettings) -> Self {
        let initial = clamp_concurrency(4, &settings);
        Self {
            client,
            settings,
            probes: Mutex::new(HashMap::new()),
            current_concurrency: AtomicUsize::new(initial),
        }
    }

    /// The concurrency level `auto_tune` currently holds.
    pub fn current_concurrency(&self) -> usize {
        self.current_concurrency.load(Ordering::Relaxed)
    }

    /// Measure achieved throughput against `url`.
    ///
    /// Results are cached per URL for [`FetchSettings::probe_ttl`]; a fresh
    /// cached sample is returned without touching the network.
    pub async fn probe(&self, url: &str) -> FetchResult<BandwidthSample> {
        if let Some(sample) = self.cached_sample(url) {
            trace!(url, "bandwidth probe served from cache");
            return Ok(sample);
        }

        let sample_bytes = self.settings.probe_sample_bytes.max(1);
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .header("Range", format!("bytes=0-{}", sample_bytes - 1))
            .timeout(self.settings.request_timeout)
            .send()
            .await
            .map_err(|e| probe_error(url, e))?;
        let latency = started.elapsed();

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await.map_err(|e| probe_error(url, e))?;
        let elapsed = started.elapsed();
        let transfer_secs = elapsed
            .saturating_sub(latency)
            .as_secs_f64()
            .max(1e-3);
        let mbps = (body.len() as f64 * 8.0) / transfer_secs / 1_000_000.0;

        let sample = BandwidthSample {
            mbps,
            latency,
            sampled_at: Instant::now(),
        };
        debug!(url, mbps, latency_ms = latency.as_millis() as u64, "bandwidth probe");
        self.probes
            .lock()
            .expect("probe cache lock poisoned")
            .insert(url.to_string(), sample.clone());
        Ok(sample)
    }

    /// Seed the held concurrency level from a probe result, returning the
    /// new level. Subsequent [`BandwidthEstimator::auto_tune`] calls step
    /// from here.
    pub fn seed_from_sample(&self, sample: &BandwidthSample) -> usize {
        let level = self.recommend_concurrency(sample.mbps, sample.latency);
        self.current_concurrency.store(level, Ordering::Relaxed);
        level
    }

    /// Map bandwidth and latency into a concurrency recommendation.
    ///
    /// Tiers: `<5 → 1`, `<20 → 2`, `<50 → 4`, `<100 → 8`, else `12`.
    /// Latency above the configured threshold adds a fixed step. The result
    /// is clamped to `[min_concurrency, max_concurrency]`.
    pub fn recommend_concurrency(&self, bandwidth_mbps: f64, latency: Duration) -> usize {
        let mut recommended = match bandwidth_mbps {
            b if b < 5.0 => 1,
            b if b < 20.0 => 2,
            b if b < 50.0 => 4,
            b if b < 100.0 => 8,
            _ => 12,
        };
        if latency > self.settings.latency_threshold {
            recommended += self.settings.latency_concurrency_step;
        }
        clamp_concurrency(recommended, &self.settings)
    }

    /// Adjust the held concurrency level from a rolling window of wave
    /// metrics. Intentionally coarse: one tier per call at most.
    ///
    /// - Down one tier when average success rate < 80% or congestion was
    ///   observed more than twice.
    /// - Up one tier when success rate > 95%, no congestion, and the ceiling
    ///   has not been reached.
    /// - Otherwise hold.
    pub fn auto_tune(&self, recent: &[WaveMetrics]) -> usize {
        let current = self.current_concurrency();
        if recent.is_empty() {
            return current;
        }

        let (succeeded, failed) = recent.iter().fold((0u64, 0u64), |(s, f), m| {
            (s + u64::from(m.succeeded), f + u64::from(m.failed))
        });
        let attempts = succeeded + failed;
        let success_rate = if attempts == 0 {
            1.0
        } else {
            succeeded as f64 / attempts as f64
        };
        let congestion_events = recent.iter().filter(|m| m.congestion).count();

        let next = if success_rate < 0.80 || congestion_events > 2 {
            step_down(current)
        } else if success_rate > 0.95
            && congestion_events == 0
            && current < self.settings.max_concurrency
        {
            step_up(current)
        } else {
            current
        };

        let next = clamp_concurrency(next, &self.settings);
        if next != current {
            debug!(
                from = current,
                to = next,
                success_rate,
                congestion_events,
                "auto-tuned chunk concurrency"
            );
            self.current_concurrency.store(next, Ordering::Relaxed);
        }
        next
    }

    /// Pick the highest-bitrate variant whose bitrate fits within 80% of the
    /// available bandwidth. Falls back to the lowest tier when none qualify.
    /// Returns the index into `variants`, or `None` for an empty list.
    pub fn recommend_quality(
        &self,
        variants: &[QualityVariant],
        bandwidth_mbps: f64,
    ) -> Option<usize> {
        if variants.is_empty() {
            return None;
        }

        let budget_kbps = bandwidth_mbps * 1000.0 * 0.8;
        let best_fit = variants
            .iter()
            .enumerate()
            .filter(|(_, v)| f64::from(v.bitrate_kbps) <= budget_kbps)
            .max_by_key(|(_, v)| v.bitrate_kbps)
            .map(|(i, _)| i);

        best_fit.or_else(|| {
            variants
                .iter()
                .enumerate()
                .min_by_key(|(_, v)| v.bitrate_kbps)
                .map(|(i, _)| i)
        })
    }

    fn cached_sample(&self, url: &str) -> Option<BandwidthSample> {
        let probes = self.probes.lock().expect("probe cache lock poisoned");
        probes
            .get(url)
            .filter(|s| s.sampled_at.elapsed() < self.settings.probe_ttl)
            .cloned()
    }
}

fn probe_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout(url.to_string())
    } else {
        FetchError::Transport {
            url: url.to_string(),
            message: error.to_string(),
        }
    }
}

fn clamp_concurrency(value: usize, settings: &FetchSettings) -> usize {
    value.clamp(settings.min_concurrency.max(1), settings.max_concurrency)
}

fn step_down(current: usize) -> usize {
    CONCURRENCY_TIERS
        .iter()
        .rev()
        .find(|&&tier| tier < current)
        .copied()
        .unwrap_or(CONCURRENCY_TIERS[0])
}

fn step_up(current: usize) -> usize {
    CONCURRENCY_TIERS
        .iter()
        .find(|&&tier| tier > current)
        .copied()
        .unwrap_or(*CONCURRENCY_TIERS.last().expect("ladder is non-empty"))
}
