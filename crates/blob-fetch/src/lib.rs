//! Content-addressed blob acquisition.
//!
//! This crate retrieves large content-addressed binary blobs (audio/video
//! assets) from sets of unreliable HTTP endpoints, verifies their SHA-256
//! integrity, and serves them from a bounded in-memory LRU cache. It
//! tolerates endpoint failure, partial transfers and bandwidth variance
//! without corrupting data or silently truncating results.
//!
//! This crate is composed of several modules:
//! - `health`: Per-URL success/failure counters and health classification.
//! - `fallback`: Cascading fetch across ordered candidate URLs with
//!   retry/backoff.
//! - `bandwidth`: Throughput probing, concurrency tiers and quality
//!   recommendation.
//! - `chunked`: Range-based chunked parallel download with wave scheduling.
//! - `verify`: Streaming SHA-256 verification.
//! - `cache`: Bounded LRU cache behind a single-writer command queue.
//! - `orchestrator`: The cache → fetch → verify → cache-write pipeline.
//! - `collaborators`: Seams for the external metadata and manifest services.
//! - `settings`: Unified configuration.
//! - `error`: Unified error types.
//!
//! This file (`lib.rs`) acts as a facade: it re-exports the main types from
//! the internal modules to form the public API of the `blob-fetch` crate.

mod bandwidth;
mod cache;
mod chunked;
mod collaborators;
mod error;
mod fallback;
mod health;
mod model;
mod orchestrator;
mod settings;
mod verify;

pub use crate::bandwidth::{BandwidthEstimator, BandwidthSample, WaveMetrics};
pub use crate::cache::{BlobCache, CacheStats};
pub use crate::chunked::{ChunkRange, ChunkedDownloader, ProgressCallback, plan_chunks};
pub use crate::collaborators::{
    HttpMetadataLookup, ManifestLocator, MetadataLookup, NullMetadataLookup, StaticManifestLocator,
};
pub use crate::error::{FetchError, FetchResult, UrlFailure};
pub use crate::fallback::{FallbackFetcher, RetryCallback};
pub use crate::health::{UrlHealthRecord, UrlHealthTracker};
pub use crate::model::{
    AcquirePhase, AcquireProgress, AcquiredBlob, BlobDescriptor, FallbackFetchResult, FetchSummary,
    IncompleteTransferReport, QualityVariant, TransferProgress, VerificationResult,
};
pub use crate::orchestrator::{
    AcquireError, AcquireProgressCallback, BlobAcquisitionOrchestrator,
};
pub use crate::settings::FetchSettings;
pub use crate::verify::IntegrityVerifier;

pub use bytes::Bytes;
