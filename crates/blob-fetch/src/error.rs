//! Unified crate-level error types.
//!
//! This module provides a single [`FetchError`] type used across the crate and
//! a convenient [`FetchResult`] alias.
//!
//! Taxonomy
//! --------
//! - Transport-level failures (`Transport`, `Http`, `Timeout`) are recovered
//!   locally by the fallback fetcher via retry and are only surfaced once all
//!   remedies are exhausted.
//! - `Exhausted` and `Incomplete` are terminal and carry structured detail
//!   (which URLs failed, which chunk indices are missing) so callers can build
//!   an actionable message without inspecting internals.
//! - `IntegrityMismatch` is terminal and non-retryable; the downloaded bytes
//!   are never cached.
//! - A cache capacity skip is *not* an error: an oversize blob is still
//!   returned to the caller, only the cache write is skipped.
//!
//! Note: some variants intentionally remain string-based to avoid pulling
//! concrete HTTP client error types into the public API.

use std::io;

use crate::model::IncompleteTransferReport;

/// Result type used by this crate.
pub type FetchResult<T> = Result<T, FetchError>;

/// One failed candidate URL inside an [`FetchError::Exhausted`] report.
#[derive(Debug, Clone)]
pub struct UrlFailure {
    /// The URL that was attempted.
    pub url: String,
    /// Text of the last error observed for this URL.
    pub error: String,
}

/// Unified error type for the `blob-fetch` crate.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// A generic error with a message.
    #[error("{0}")]
    Message(String),

    /// Invalid parameters provided by the caller.
    #[error("invalid parameters: {0}")]
    InvalidParams(&'static str),

    /// The caller supplied an empty candidate URL list.
    #[error("No fallback URLs provided")]
    NoUrls,

    /// Every candidate URL failed after its retry budget.
    #[error("all fallback URLs exhausted after {attempts} attempts")]
    Exhausted {
        /// Total attempts made across every URL.
        attempts: u32,
        /// Last error text per attempted URL, in input order.
        failures: Vec<UrlFailure>,
    },

    /// Single-attempt network failure (connection reset, DNS, protocol error).
    #[error("transport error for {url}: {message}")]
    Transport {
        /// URL that failed.
        url: String,
        /// Underlying error text.
        message: String,
    },

    /// HTTP request completed with a non-success status.
    #[error("HTTP error: {status} for {url}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// URL that failed.
        url: String,
    },

    /// Request timed out.
    #[error("request timeout for {0}")]
    Timeout(String),

    /// Chunked transfer ended with missing or failed chunks, or a size
    /// mismatch against the declared blob size.
    #[error("incomplete transfer: {0}")]
    Incomplete(IncompleteTransferReport),

    /// Computed hash of the downloaded bytes did not match the expected hash.
    #[error("integrity mismatch: expected {expected}, computed {computed}")]
    IntegrityMismatch {
        /// Expected hash (normalized lowercase).
        expected: String,
        /// Hash computed over the received bytes.
        computed: String,
    },

    /// The expected hash string is not 64 hex characters.
    #[error("malformed content hash: {0}")]
    InvalidHash(String),

    /// Operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Extra context around a lower-level error.
    ///
    /// Use this for adding human-readable context without creating many
    /// wrapper enums.
    #[error("{context}: {source}")]
    Context {
        /// What we were doing when the error occurred.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Convenience helper to construct a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        FetchError::Message(msg.into())
    }

    /// Attach static context to an existing error.
    pub fn with_context(self, context: &'static str) -> Self {
        FetchError::Context {
            context,
            source: Box::new(self),
        }
    }

    /// True for failures that a retry of the same URL may recover from.
    ///
    /// Transport errors and timeouts are transient. HTTP statuses are
    /// retryable only for server errors, request timeouts (408) and rate
    /// limiting (429); other client errors will keep failing the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } | FetchError::Timeout(_) => true,
            FetchError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}
