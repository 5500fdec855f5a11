//! Streaming SHA-256 integrity verification.
//!
//! A hash mismatch is a normal outcome (`is_valid == false`), not an error;
//! only a malformed expected hash is rejected. Comparison is
//! case-insensitive, the computed output is always 64 lowercase hex
//! characters.
//!
//! Large payloads are hashed in fixed windows (default 1 MiB) with an
//! optional progress callback, rather than handing the whole payload to the
//! digest in one call.

use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{FetchError, FetchResult};
use crate::model::VerificationResult;

/// Progress callback for streaming verification: `(bytes_hashed, total_bytes)`.
pub type VerifyProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Streams a SHA-256 digest over byte payloads and compares against an
/// expected hex value.
#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    window_bytes: usize,
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self {
            window_bytes: 1024 * 1024,
        }
    }
}

impl IntegrityVerifier {
    /// Create a verifier with the given streaming window size.
    pub fn new(window_bytes: usize) -> Self {
        Self {
            window_bytes: window_bytes.max(1),
        }
    }

    /// Verify `bytes` against `expected_hex`.
    pub fn verify(&self, bytes: &[u8], expected_hex: &str) -> FetchResult<VerificationResult> {
        self.verify_with_progress(bytes, expected_hex, None)
    }

    /// Verify `bytes` against `expected_hex`, reporting hashing progress
    /// after each window.
    pub fn verify_with_progress(
        &self,
        bytes: &[u8],
        expected_hex: &str,
        on_progress: Option<VerifyProgressFn<'_>>,
    ) -> FetchResult<VerificationResult> {
        let expected = normalize_hash(expected_hex)?;
        let started = Instant::now();

        let total = bytes.len() as u64;
        let mut hasher = Sha256::new();
        let mut hashed: u64 = 0;
        for window in bytes.chunks(self.window_bytes) {
            hasher.update(window);
            hashed += window.len() as u64;
            if let Some(cb) = on_progress {
                cb(hashed, total);
            }
        }

        let computed = hex::encode(hasher.finalize());
        let is_valid = computed == expected;
        if !is_valid {
            debug!(expected, computed, "hash mismatch");
        }

        Ok(VerificationResult {
            is_valid,
            computed_hash: computed,
            expected_hash: expected,
            duration: started.elapsed(),
        })
    }

    /// Run independent verifications, preserving input order.
    pub fn verify_multiple(
        &self,
        items: &[(&[u8], &str)],
    ) -> FetchResult<Vec<VerificationResult>> {
        items
            .iter()
            .map(|(bytes, expected)| self.verify(bytes, expected))
            .collect()
    }
}

/// Validate and lowercase an expected hash string.
///
/// Accepts any casing; rejects anything that is not exactly 64 hex
/// characters.
fn normalize_hash(expected_hex: &str) -> FetchResult<String> {
    let trimmed = expected_hex.trim();
    if trimmed.len() != 64 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(FetchError::InvalidHash(expected_hex.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}
