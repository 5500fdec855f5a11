//! External collaborator seams.
//!
//! The pipeline depends on two external services that are out of scope for
//! this crate:
//! - a metadata lookup that maps a content id to blob descriptors, and
//! - a manifest/custodian service that hands out ready-made playback URLs.
//!
//! Both are modeled as explicit trait objects with defined no-op defaults,
//! never duck-typed or globally wired. Lookup failures (transport errors,
//! not-found) convert to an empty result and never propagate; playback URLs
//! are forwarded unmodified.

use async_trait::async_trait;
use reqwest::Client;
use tracing::warn;

use crate::model::BlobDescriptor;

/// Maps a content id to zero or more blob descriptors.
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    /// Return the descriptors known for `content_id`. Errors of any kind
    /// yield an empty vec.
    async fn descriptors_for(&self, content_id: &str) -> Vec<BlobDescriptor>;
}

/// Supplies ready-made playback URLs for a content id.
///
/// This crate only forwards what it is given; selecting custodians or
/// generating manifests happens upstream.
#[async_trait]
pub trait ManifestLocator: Send + Sync {
    /// Return playback URLs for `content_id`, in preference order.
    async fn playback_urls(&self, content_id: &str) -> Vec<String>;
}

/// No-op metadata lookup: always returns no descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetadataLookup;

#[async_trait]
impl MetadataLookup for NullMetadataLookup {
    async fn descriptors_for(&self, _content_id: &str) -> Vec<BlobDescriptor> {
        Vec::new()
    }
}

/// Manifest locator returning a fixed URL list regardless of content id.
#[derive(Debug, Clone, Default)]
pub struct StaticManifestLocator {
    urls: Vec<String>,
}

impl StaticManifestLocator {
    /// Create a locator that always returns `urls`.
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls }
    }
}

#[async_trait]
impl ManifestLocator for StaticManifestLocator {
    async fn playback_urls(&self, _content_id: &str) -> Vec<String> {
        self.urls.clone()
    }
}

/// Metadata lookup backed by an HTTP endpoint returning JSON descriptors.
///
/// Expects `GET {base_url}/api/content/{content_id}/blobs` to return an
/// array of descriptors in the camelCase wire format.
#[derive(Debug, Clone)]
pub struct HttpMetadataLookup {
    client: Client,
    base_url: String,
}

impl HttpMetadataLookup {
    /// Create a lookup against `base_url` (no trailing slash).
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MetadataLookup for HttpMetadataLookup {
    async fn descriptors_for(&self, content_id: &str) -> Vec<BlobDescriptor> {
        let url = format!("{}/api/content/{}/blobs", self.base_url, content_id);
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(error) => {
                warn!(content_id, %error, "metadata lookup transport error, returning empty");
                return Vec::new();
            }
        };
        if !response.status().is_success() {
            warn!(
                content_id,
                status = response.status().as_u16(),
                "metadata lookup non-success status, returning empty"
            );
            return Vec::new();
        }
        match response.json::<Vec<BlobDescriptor>>().await {
            Ok(descriptors) => descriptors,
            Err(error) => {
                warn!(content_id, %error, "metadata lookup decode error, returning empty");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_lookup_returns_empty() {
        let lookup = NullMetadataLookup;
        assert!(lookup.descriptors_for("any-id").await.is_empty());
    }

    #[tokio::test]
    async fn static_locator_forwards_urls_unmodified() {
        let urls = vec![
            "https://custodian-a.example/blob/x".to_string(),
            "https://custodian-b.example/blob/x".to_string(),
        ];
        let locator = StaticManifestLocator::new(urls.clone());
        assert_eq!(locator.playback_urls("whatever").await, urls);
    }

    #[tokio::test]
    async fn http_lookup_swallows_transport_errors() {
        // Nothing listens on this port; the lookup must yield empty, not error.
        let lookup = HttpMetadataLookup::new(Client::new(), "http://127.0.0.1:9");
        assert!(lookup.descriptors_for("content-1").await.is_empty());
    }
}
