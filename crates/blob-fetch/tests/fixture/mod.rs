//! In-process HTTP fixture server for blob pipeline tests.
//!
//! Serves configured blobs over a local axum router (no external network).
//! Each blob can be set up as:
//! - `Ranged`: honors `Range` with 206 + `Content-Range`.
//! - `NoRange`: ignores `Range` entirely and always answers 200 with the
//!   full body, like a misbehaving origin.
//! - `AcceptRangesOnly`: answers 200 with an `Accept-Ranges: bytes` header
//!   and the full body, simulating a server that advertises ranges on the
//!   probe but does not produce a 206.
//! - `AlwaysFail`: answers 500 on every request.
//!
//! Per-blob failure injection: fail the first N requests (flaky endpoint),
//! or fail every ranged request starting at a given byte offset (to knock
//! out one specific chunk).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;

/// How the fixture serves one blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    Ranged,
    NoRange,
    AcceptRangesOnly,
    AlwaysFail,
}

#[derive(Debug, Clone)]
struct BlobSpec {
    bytes: Bytes,
    mode: ServeMode,
    fail_first: u32,
    fail_range_start: Option<u64>,
}

#[derive(Debug, Default)]
pub struct Counters {
    /// Total requests for this blob.
    pub requests: u32,
    /// Responses served as 206 partials.
    pub partials: u32,
}

#[derive(Default)]
struct FixtureState {
    blobs: Mutex<HashMap<String, BlobSpec>>,
    counters: Mutex<HashMap<String, Counters>>,
}

/// Handle to a running fixture server.
pub struct Fixture {
    addr: SocketAddr,
    state: Arc<FixtureState>,
}

impl Fixture {
    /// Bind on an ephemeral local port and start serving.
    pub async fn start() -> Self {
        init_tracing();

        let state = Arc::new(FixtureState::default());
        let app = Router::new()
            .route("/blob/{name}", get(serve_blob))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fixture listener");
        let addr = listener.local_addr().expect("fixture local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fixture server");
        });

        Self { addr, state }
    }

    /// Register a blob under `name`.
    pub fn add_blob(&self, name: &str, bytes: Bytes, mode: ServeMode) {
        self.state.blobs.lock().unwrap().insert(
            name.to_string(),
            BlobSpec {
                bytes,
                mode,
                fail_first: 0,
                fail_range_start: None,
            },
        );
    }

    /// Make the first `n` requests for `name` fail with 503.
    pub fn fail_first(&self, name: &str, n: u32) {
        if let Some(spec) = self.state.blobs.lock().unwrap().get_mut(name) {
            spec.fail_first = n;
        }
    }

    /// Fail every ranged request for `name` whose start offset equals
    /// `offset`.
    pub fn fail_range_starting_at(&self, name: &str, offset: u64) {
        if let Some(spec) = self.state.blobs.lock().unwrap().get_mut(name) {
            spec.fail_range_start = Some(offset);
        }
    }

    /// Absolute URL for the blob `name`.
    pub fn url(&self, name: &str) -> String {
        format!("http://{}/blob/{name}", self.addr)
    }

    /// Snapshot of the request counters for `name`.
    pub fn counters(&self, name: &str) -> Counters {
        let counters = self.state.counters.lock().unwrap();
        counters
            .get(name)
            .map(|c| Counters {
                requests: c.requests,
                partials: c.partials,
            })
            .unwrap_or_default()
    }
}

async fn serve_blob(
    State(state): State<Arc<FixtureState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(spec) = state.blobs.lock().unwrap().get(&name).cloned() else {
        return (StatusCode::NOT_FOUND, "no such blob").into_response();
    };

    let request_number = {
        let mut counters = state.counters.lock().unwrap();
        let entry = counters.entry(name.clone()).or_default();
        entry.requests += 1;
        entry.requests
    };

    if spec.mode == ServeMode::AlwaysFail {
        return (StatusCode::INTERNAL_SERVER_ERROR, "configured failure").into_response();
    }
    if request_number <= spec.fail_first {
        return (StatusCode::SERVICE_UNAVAILABLE, "flaky").into_response();
    }

    let total = spec.bytes.len() as u64;
    let range = headers
        .get("Range")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    match (spec.mode, range) {
        (ServeMode::Ranged, Some((start, end))) => {
            if spec.fail_range_start == Some(start) {
                return (StatusCode::INTERNAL_SERVER_ERROR, "injected chunk failure")
                    .into_response();
            }
            if start >= total {
                return (StatusCode::RANGE_NOT_SATISFIABLE, "range out of bounds")
                    .into_response();
            }
            let end = end.min(total - 1);
            {
                let mut counters = state.counters.lock().unwrap();
                counters.entry(name.clone()).or_default().partials += 1;
            }
            let body = spec.bytes.slice(start as usize..=end as usize);
            let mut response_headers = HeaderMap::new();
            response_headers.insert(
                "Content-Range",
                HeaderValue::from_str(&format!("bytes {start}-{end}/{total}")).unwrap(),
            );
            (StatusCode::PARTIAL_CONTENT, response_headers, body).into_response()
        }
        (ServeMode::AcceptRangesOnly, _) => {
            let mut response_headers = HeaderMap::new();
            response_headers.insert("Accept-Ranges", HeaderValue::from_static("bytes"));
            (StatusCode::OK, response_headers, spec.bytes.clone()).into_response()
        }
        // Ranged without a Range header, or NoRange ignoring one.
        _ => (StatusCode::OK, spec.bytes.clone()).into_response(),
    }
}

/// Parse `bytes=a-b` (both bounds required, as this pipeline always sends
/// closed ranges).
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic pseudo-random payload for tests.
pub fn test_payload(len: usize, seed: u64) -> Bytes {
    use rand::{RngCore, SeedableRng, rngs::StdRng};
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    Bytes::from(data)
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}
