//! Per-URL health tracking.
//!
//! Keeps success/failure counters for every URL the fallback fetcher has
//! attempted, so repeatedly broken endpoints can be identified by callers and
//! surfaced in diagnostics. A URL with no recorded history defaults to
//! healthy.
//!
//! The tracker is purely synchronous; the counter map is guarded by a
//! `std::sync::Mutex`, making it single-writer by construction. It is owned
//! by the orchestrator and injected into the components that report into it,
//! never a module-level singleton.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Health record for one URL.
#[derive(Debug, Clone)]
pub struct UrlHealthRecord {
    /// The URL this record describes.
    pub url: String,
    /// Number of successful attempts.
    pub success_count: u64,
    /// Number of failed attempts.
    pub failure_count: u64,
    /// Text of the most recent error, if any.
    pub last_error: Option<String>,
    /// When the URL was last attempted.
    pub last_access: Option<Instant>,
}

impl UrlHealthRecord {
    fn fresh(url: &str) -> Self {
        Self {
            url: url.to_string(),
            success_count: 0,
            failure_count: 0,
            last_error: None,
            last_access: None,
        }
    }
}

/// Tracks success/failure counts per URL.
#[derive(Debug, Default)]
pub struct UrlHealthTracker {
    records: Mutex<HashMap<String, UrlHealthRecord>>,
}

impl UrlHealthTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful attempt against `url`.
    pub fn record_success(&self, url: &str) {
        let mut records = self.records.lock().expect("health tracker lock poisoned");
        let record = records
            .entry(url.to_string())
            .or_insert_with(|| UrlHealthRecord::fresh(url));
        record.success_count += 1;
        record.last_access = Some(Instant::now());
    }

    /// Record a failed attempt against `url` with the observed error text.
    pub fn record_failure(&self, url: &str, message: impl Into<String>) {
        let mut records = self.records.lock().expect("health tracker lock poisoned");
        let record = records
            .entry(url.to_string())
            .or_insert_with(|| UrlHealthRecord::fresh(url));
        record.failure_count += 1;
        record.last_error = Some(message.into());
        record.last_access = Some(Instant::now());
    }

    /// Return the health record for `url`, synthesizing a default healthy
    /// (0/0) record when the URL has never been attempted.
    pub fn health(&self, url: &str) -> UrlHealthRecord {
        let records = self.records.lock().expect("health tracker lock poisoned");
        records
            .get(url)
            .cloned()
            .unwrap_or_else(|| UrlHealthRecord::fresh(url))
    }

    /// A URL is considered healthy when it has no history, or at least as
    /// many successes as failures.
    pub fn is_healthy(&self, url: &str) -> bool {
        let record = self.health(url);
        record.failure_count == 0 || record.success_count >= record.failure_count
    }

    /// Number of URLs with recorded history.
    pub fn tracked_count(&self) -> usize {
        self.records.lock().expect("health tracker lock poisoned").len()
    }

    /// Reset all recorded state.
    pub fn clear(&self) {
        self.records
            .lock()
            .expect("health tracker lock poisoned")
            .clear();
    }
}
