//! Core data models used by the `blob-fetch` crate.
//!
//! This module is intentionally focused on *pure* types, with no networking
//! or I/O concerns. Higher-level modules (`fallback`, `chunked`,
//! `orchestrator`) build on top of these types.
//!
//! Scope:
//! - The blob descriptor handed to the pipeline by the metadata collaborator.
//! - Result types for fallback fetches, chunked transfers and verification.
//! - Progress events emitted during transfers.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Describes one content-addressed blob and where it may be fetched from.
///
/// Produced by the external metadata collaborator; immutable once built.
/// The wire format uses camelCase field names, matching the upstream
/// metadata service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    /// SHA-256 of the blob content, 64 lowercase hex characters.
    pub content_hash: String,
    /// Declared size of the blob in bytes.
    pub size_bytes: u64,
    /// MIME type of the content (e.g. `video/mp4`).
    pub mime_type: String,
    /// Ordered candidate URLs. The order is meaningful and is never
    /// rearranged mid-call by any component.
    pub candidate_urls: Vec<String>,
    /// Optional advertised bitrate in kbit/s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<u32>,
    /// Optional duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// Optional codec string (e.g. `avc1.64001f`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
}

impl BlobDescriptor {
    /// Create a descriptor with the required fields; optional metadata
    /// defaults to `None`.
    pub fn new(
        content_hash: impl Into<String>,
        size_bytes: u64,
        mime_type: impl Into<String>,
        candidate_urls: Vec<String>,
    ) -> Self {
        Self {
            content_hash: content_hash.into(),
            size_bytes,
            mime_type: mime_type.into(),
            candidate_urls,
            bitrate_kbps: None,
            duration_secs: None,
            codec: None,
        }
    }

    /// Returns true when `content_hash` is exactly 64 hex characters.
    pub fn has_well_formed_hash(&self) -> bool {
        self.content_hash.len() == 64
            && self.content_hash.chars().all(|c| c.is_ascii_hexdigit())
    }
}

/// One selectable quality tier for a piece of content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityVariant {
    /// Human-readable label (e.g. `"720p"`).
    pub label: String,
    /// Bitrate of this tier in kbit/s.
    pub bitrate_kbps: u32,
}

/// Outcome of a successful fallback fetch.
#[derive(Debug, Clone)]
pub struct FallbackFetchResult {
    /// The downloaded bytes.
    pub bytes: Bytes,
    /// Index into the input URL list that succeeded.
    pub url_index: usize,
    /// The URL that served the bytes.
    pub success_url: String,
    /// Failed attempts accumulated across *all* URLs tried in this call.
    pub retry_count: u32,
    /// Wall-clock duration of the whole cascade.
    pub duration: Duration,
}

/// Summary of how a blob was fetched, without the payload.
///
/// Carried inside [`AcquiredBlob`] so callers can log which source served
/// the content (the upstream gateway tags the serving source the same way).
#[derive(Debug, Clone)]
pub struct FetchSummary {
    /// Index into the descriptor's candidate URL list.
    pub url_index: usize,
    /// The URL that served the bytes.
    pub success_url: String,
    /// Failed attempts accumulated before success.
    pub retry_count: u32,
    /// Wall-clock duration of the fetch phase.
    pub duration: Duration,
}

/// Result of comparing a computed digest against an expected one.
///
/// A mismatch is a normal, non-error outcome (`is_valid == false`); only
/// malformed input produces an error.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Whether the computed hash matches the expected hash.
    pub is_valid: bool,
    /// Hash computed over the bytes, always 64 lowercase hex characters.
    pub computed_hash: String,
    /// Expected hash, normalized to lowercase.
    pub expected_hash: String,
    /// How long hashing took.
    pub duration: Duration,
}

/// Structured report for a chunked transfer that could not be completed.
///
/// Emitted instead of a silently truncated buffer: the caller learns exactly
/// which chunk indices never arrived and which failed with what error.
#[derive(Debug, Clone)]
pub struct IncompleteTransferReport {
    /// URL the transfer was attempted against.
    pub url: String,
    /// Size declared by the blob descriptor.
    pub expected_size: u64,
    /// Total bytes actually received across completed chunks.
    pub received_size: u64,
    /// Chunk indices (0..N-1) with no data after all attempts settled.
    pub missing_chunk_indices: Vec<usize>,
    /// Failed chunk indices with the captured error text.
    pub failed_chunks: Vec<(usize, String)>,
}

impl fmt::Display for IncompleteTransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} bytes from {}, {} missing chunk(s)",
            self.received_size,
            self.expected_size,
            self.url,
            self.missing_chunk_indices.len()
        )?;
        if let Some((index, error)) = self.failed_chunks.first() {
            write!(f, "; first failure: chunk {index}: {error}")?;
        }
        Ok(())
    }
}

/// Progress snapshot emitted after each completed chunk (or read window).
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Bytes received so far.
    pub bytes_received: u64,
    /// Total bytes expected for the transfer.
    pub total_bytes: u64,
    /// Completion percentage in `0.0..=100.0`.
    pub percent: f64,
    /// Rolling throughput estimate in bytes per second.
    pub speed_bps: f64,
    /// Estimated time remaining, when the speed estimate allows one.
    pub eta: Option<Duration>,
    /// Index of the chunk that just completed.
    pub chunk_index: usize,
    /// Total number of chunks in this transfer.
    pub total_chunks: usize,
}

/// Pipeline phase tag attached to progress events and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePhase {
    /// Looking the blob up in the cache.
    CheckCache,
    /// Downloading bytes from a candidate URL.
    Fetching,
    /// Streaming the hash over the received bytes.
    Verifying,
    /// Writing the verified bytes into the cache.
    CacheWrite,
}

/// Phase-tagged progress event emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum AcquireProgress {
    /// Transfer progress while downloading.
    Fetching(TransferProgress),
    /// A failed attempt is about to be retried (or the next URL tried), so a
    /// caller-visible "retrying" state is possible.
    Retrying {
        /// URL of the attempt that failed.
        url: String,
        /// Index of that URL in the candidate list.
        url_index: usize,
        /// 1-based attempt number for this URL.
        attempt: u32,
    },
    /// Hashing progress while verifying.
    Verifying {
        /// Bytes hashed so far.
        bytes_hashed: u64,
        /// Total bytes to hash.
        total_bytes: u64,
    },
}

/// Final result of [`crate::BlobAcquisitionOrchestrator::acquire`].
#[derive(Debug, Clone)]
pub struct AcquiredBlob {
    /// The verified blob content.
    pub bytes: Bytes,
    /// True when the bytes were served from the cache without any network I/O.
    pub was_cached: bool,
    /// How the bytes were fetched; `None` on a cache hit.
    pub fetch: Option<FetchSummary>,
    /// Verification outcome; `None` on a cache hit (cached bytes were
    /// verified before being written).
    pub verification: Option<VerificationResult>,
    /// Wall-clock duration of the whole acquisition.
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_wire_format_is_camel_case() {
        let json = serde_json::json!({
            "contentHash": "ab".repeat(32),
            "sizeBytes": 1048576,
            "mimeType": "video/mp4",
            "candidateUrls": ["https://a.example/blob", "https://b.example/blob"],
            "bitrateKbps": 2500
        });

        let descriptor: BlobDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(descriptor.size_bytes, 1_048_576);
        assert_eq!(descriptor.candidate_urls.len(), 2);
        assert_eq!(descriptor.bitrate_kbps, Some(2500));
        assert!(descriptor.duration_secs.is_none());
        assert!(descriptor.has_well_formed_hash());

        let back = serde_json::to_value(&descriptor).unwrap();
        assert!(back.get("contentHash").is_some());
        assert!(back.get("codec").is_none(), "unset optionals are omitted");
    }

    #[test]
    fn hash_shape_validation() {
        let mut descriptor =
            BlobDescriptor::new("A1".repeat(32), 10, "audio/mpeg", vec![]);
        assert!(descriptor.has_well_formed_hash());

        descriptor.content_hash = "xyz".into();
        assert!(!descriptor.has_well_formed_hash());
        descriptor.content_hash = "g".repeat(64);
        assert!(!descriptor.has_well_formed_hash());
    }

    #[test]
    fn incomplete_report_display_names_first_failure() {
        let report = IncompleteTransferReport {
            url: "https://a.example/blob".into(),
            expected_size: 1000,
            received_size: 600,
            missing_chunk_indices: vec![3, 7],
            failed_chunks: vec![(3, "HTTP error: 500".into())],
        };
        let text = report.to_string();
        assert!(text.contains("600/1000"));
        assert!(text.contains("2 missing"));
        assert!(text.contains("chunk 3"));
    }
}
