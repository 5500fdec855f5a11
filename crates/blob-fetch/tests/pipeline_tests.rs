//! Integration tests for the blob acquisition pipeline.
//!
//! All tests run against a local in-process fixture server (no external
//! network). They cover:
//! - fallback ordering, exhaustion and health accounting
//! - chunked download completeness (including non-divisible sizes)
//! - missing-chunk detection and structured failure reports
//! - range-support detection (206 vs plain 200)
//! - end-to-end acquire: miss → fetch → verify → cache → hit

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use blob_fetch::{
    AcquirePhase, AcquireProgress, BandwidthEstimator, BlobAcquisitionOrchestrator,
    BlobDescriptor, ChunkedDownloader, FallbackFetcher, FetchError, FetchSettings,
    IntegrityVerifier, TransferProgress, UrlHealthTracker,
};

mod fixture;
use fixture::{Fixture, ServeMode, sha256_hex, test_payload};

fn quick_settings() -> FetchSettings {
    FetchSettings::default()
        .request_timeout(Duration::from_secs(5))
        .max_retries_per_url(1)
        .retry_base_delay(Duration::from_millis(1))
        .max_retry_delay(Duration::from_millis(5))
}

fn fetcher(settings: FetchSettings, tracker: Arc<UrlHealthTracker>) -> FallbackFetcher {
    FallbackFetcher::new(
        reqwest::Client::new(),
        settings,
        tracker,
        CancellationToken::new(),
    )
}

fn downloader(settings: FetchSettings) -> ChunkedDownloader {
    downloader_with_cancel(settings, CancellationToken::new())
}

fn downloader_with_cancel(settings: FetchSettings, cancel: CancellationToken) -> ChunkedDownloader {
    let client = reqwest::Client::new();
    let estimator = Arc::new(BandwidthEstimator::new(client.clone(), settings.clone()));
    ChunkedDownloader::new(client, settings, estimator, cancel)
}

#[tokio::test]
async fn fallback_tries_urls_in_input_order() {
    let server = Fixture::start().await;
    let payload = test_payload(2048, 1);
    server.add_blob("bad-a", payload.clone(), ServeMode::AlwaysFail);
    server.add_blob("bad-b", payload.clone(), ServeMode::AlwaysFail);
    server.add_blob("good", payload.clone(), ServeMode::Ranged);

    let tracker = Arc::new(UrlHealthTracker::new());
    let urls = vec![
        server.url("bad-a"),
        server.url("bad-b"),
        server.url("good"),
    ];

    let result = fetcher(quick_settings(), tracker.clone())
        .fetch_with_fallback(&urls)
        .await
        .unwrap();

    assert_eq!(result.url_index, 2);
    assert_eq!(result.success_url, urls[2]);
    assert_eq!(result.bytes, payload);
    assert_eq!(result.retry_count, 2);

    assert_eq!(tracker.health(&urls[0]).failure_count, 1);
    assert_eq!(tracker.health(&urls[1]).failure_count, 1);
    assert_eq!(tracker.health(&urls[2]).success_count, 1);
    assert!(!tracker.is_healthy(&urls[0]));
    assert!(tracker.is_healthy(&urls[2]));
}

#[tokio::test]
async fn fallback_retries_a_flaky_url_before_advancing() {
    let server = Fixture::start().await;
    let payload = test_payload(512, 2);
    server.add_blob("flaky", payload.clone(), ServeMode::Ranged);
    server.fail_first("flaky", 2);

    let tracker = Arc::new(UrlHealthTracker::new());
    let urls = vec![server.url("flaky")];
    let settings = quick_settings().max_retries_per_url(3);

    let result = fetcher(settings, tracker.clone())
        .fetch_with_fallback(&urls)
        .await
        .unwrap();

    assert_eq!(result.url_index, 0);
    assert_eq!(result.retry_count, 2);
    let health = tracker.health(&urls[0]);
    assert_eq!(health.failure_count, 2);
    assert_eq!(health.success_count, 1);
}

#[tokio::test]
async fn non_retryable_status_advances_without_spending_the_retry_budget() {
    let server = Fixture::start().await;
    let payload = test_payload(1024, 12);
    server.add_blob("good", payload.clone(), ServeMode::Ranged);

    let tracker = Arc::new(UrlHealthTracker::new());
    // The first URL 404s; client errors are not retried, so the cascade
    // advances after a single attempt despite the budget of 3.
    let urls = vec![server.url("absent"), server.url("good")];
    let result = fetcher(quick_settings().max_retries_per_url(3), tracker.clone())
        .fetch_with_fallback(&urls)
        .await
        .unwrap();

    assert_eq!(result.url_index, 1);
    assert_eq!(result.bytes, payload);
    assert_eq!(result.retry_count, 1);
    assert_eq!(tracker.health(&urls[0]).failure_count, 1);
}

#[tokio::test]
async fn exhausting_every_url_reports_each_failure() {
    let server = Fixture::start().await;
    server.add_blob("down-1", Bytes::new(), ServeMode::AlwaysFail);
    server.add_blob("down-2", Bytes::new(), ServeMode::AlwaysFail);

    let urls = vec![server.url("down-1"), server.url("down-2")];
    let error = fetcher(quick_settings(), Arc::new(UrlHealthTracker::new()))
        .fetch_with_fallback(&urls)
        .await
        .unwrap_err();

    assert!(error.to_string().contains("exhausted"));
    match error {
        FetchError::Exhausted { attempts, failures } => {
            assert_eq!(attempts, 2);
            assert_eq!(failures.len(), 2);
            assert_eq!(failures[0].url, urls[0]);
            assert!(failures[0].error.contains("500"));
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn chunked_download_reassembles_non_divisible_sizes() {
    let server = Fixture::start().await;
    // 6 full chunks of 16 KiB plus a 7-byte remainder.
    let payload = test_payload(6 * 16_384 + 7, 3);
    server.add_blob("media", payload.clone(), ServeMode::Ranged);

    let settings = quick_settings()
        .chunk_size_bytes(16_384)
        .max_parallel_chunks(4);
    let descriptor = BlobDescriptor::new(
        sha256_hex(&payload),
        payload.len() as u64,
        "video/mp4",
        vec![server.url("media")],
    );

    let events: Arc<Mutex<Vec<TransferProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let bytes = downloader(settings)
        .download_in_chunks(
            &descriptor,
            &server.url("media"),
            Some(Arc::new(move |p| sink.lock().unwrap().push(p))),
        )
        .await
        .unwrap();

    assert_eq!(bytes.len(), payload.len());
    assert_eq!(bytes, payload);
    assert!(
        IntegrityVerifier::default()
            .verify(&bytes, &descriptor.content_hash)
            .unwrap()
            .is_valid
    );

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 7);
    let last = events.last().unwrap();
    assert_eq!(last.bytes_received, payload.len() as u64);
    assert_eq!(last.total_chunks, 7);
    assert!((last.percent - 100.0).abs() < 1e-9);

    // Range probe + bandwidth probe + one ranged request per chunk.
    assert_eq!(server.counters("media").partials, 9);
}

#[tokio::test]
async fn failing_chunk_is_reported_missing_not_truncated() {
    let server = Fixture::start().await;
    let chunk_size = 16_384u64;
    let payload = test_payload(5 * chunk_size as usize, 4);
    server.add_blob("media", payload.clone(), ServeMode::Ranged);
    // Knock out chunk 2 permanently.
    server.fail_range_starting_at("media", 2 * chunk_size);

    let descriptor = BlobDescriptor::new(
        sha256_hex(&payload),
        payload.len() as u64,
        "video/mp4",
        vec![server.url("media")],
    );
    let error = downloader(quick_settings().chunk_size_bytes(chunk_size))
        .download_in_chunks(&descriptor, &server.url("media"), None)
        .await
        .unwrap_err();

    match error {
        FetchError::Incomplete(report) => {
            assert_eq!(report.missing_chunk_indices, vec![2]);
            assert_eq!(report.failed_chunks.len(), 1);
            assert_eq!(report.failed_chunks[0].0, 2);
            assert_eq!(report.expected_size, payload.len() as u64);
            assert_eq!(report.received_size, payload.len() as u64 - chunk_size);
        }
        other => panic!("expected Incomplete, got {other:?}"),
    }
}

#[tokio::test]
async fn chunked_download_stops_between_waves_on_cancellation() {
    let server = Fixture::start().await;
    let chunk_size = 16_384u64;
    let payload = test_payload(4 * chunk_size as usize, 13);
    server.add_blob("media", payload.clone(), ServeMode::Ranged);

    // Clamp concurrency to one chunk per wave so the cancellation lands on
    // a wave boundary deterministically.
    let settings = quick_settings()
        .chunk_size_bytes(chunk_size)
        .max_parallel_chunks(1)
        .max_concurrency(1);
    let cancel = CancellationToken::new();
    let dl = downloader_with_cancel(settings, cancel.clone());

    let descriptor = BlobDescriptor::new(
        sha256_hex(&payload),
        payload.len() as u64,
        "video/mp4",
        vec![server.url("media")],
    );
    let trigger = cancel.clone();
    let error = dl
        .download_in_chunks(
            &descriptor,
            &server.url("media"),
            Some(Arc::new(move |_| trigger.cancel())),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, FetchError::Cancelled));
    // Range probe, bandwidth probe, then exactly one chunk before the stop.
    assert_eq!(server.counters("media").requests, 3);
}

#[tokio::test]
async fn bandwidth_probe_is_cached_within_its_ttl() {
    let server = Fixture::start().await;
    let payload = test_payload(64 * 1024, 14);
    server.add_blob("probe", payload.clone(), ServeMode::Ranged);

    let client = reqwest::Client::new();
    let url = server.url("probe");
    let settings = quick_settings().probe_sample_bytes(16 * 1024);

    let estimator = BandwidthEstimator::new(client.clone(), settings.clone());
    let first = estimator.probe(&url).await.unwrap();
    assert!(first.mbps > 0.0);
    estimator.probe(&url).await.unwrap();
    // The second probe is served from the cached sample.
    assert_eq!(server.counters("probe").requests, 1);

    // With an expired TTL every probe goes back to the network.
    let expiring = BandwidthEstimator::new(client, settings.probe_ttl(Duration::ZERO));
    expiring.probe(&url).await.unwrap();
    expiring.probe(&url).await.unwrap();
    assert_eq!(server.counters("probe").requests, 3);
}

#[tokio::test]
async fn range_support_detection() {
    let server = Fixture::start().await;
    let payload = test_payload(40_000, 5);
    server.add_blob("ranged", payload.clone(), ServeMode::Ranged);
    server.add_blob("plain", payload.clone(), ServeMode::NoRange);
    server.add_blob("advertised", payload.clone(), ServeMode::AcceptRangesOnly);

    let dl = downloader(quick_settings());
    let size = payload.len() as u64;

    assert!(dl.probe_range_support(&server.url("ranged"), size).await.unwrap());
    // A 200 with no Accept-Ranges is never range support.
    assert!(!dl.probe_range_support(&server.url("plain"), size).await.unwrap());
    // Misconfigured-server workaround: Accept-Ranges on a 200 counts when
    // Content-Length confirms the full resource.
    assert!(dl.probe_range_support(&server.url("advertised"), size).await.unwrap());
}

#[tokio::test]
async fn no_range_support_falls_back_to_single_request() {
    let server = Fixture::start().await;
    let payload = test_payload(50_000, 6);
    server.add_blob("plain", payload.clone(), ServeMode::NoRange);

    let descriptor = BlobDescriptor::new(
        sha256_hex(&payload),
        payload.len() as u64,
        "audio/mpeg",
        vec![server.url("plain")],
    );
    let bytes = downloader(quick_settings().chunk_size_bytes(8_192))
        .download_in_chunks(&descriptor, &server.url("plain"), None)
        .await
        .unwrap();

    assert_eq!(bytes, payload);
    let counters = server.counters("plain");
    // Probe plus one whole-resource request, no partials served.
    assert_eq!(counters.requests, 2);
    assert_eq!(counters.partials, 0);
}

#[tokio::test]
async fn acquire_end_to_end_miss_then_hit() {
    let server = Fixture::start().await;
    let payload = test_payload(300_000, 7);
    server.add_blob("broken", payload.clone(), ServeMode::AlwaysFail);
    server.add_blob("good", payload.clone(), ServeMode::Ranged);

    let settings = quick_settings()
        .chunk_threshold_bytes(64 * 1024)
        .chunk_size_bytes(32 * 1024);
    let orchestrator = BlobAcquisitionOrchestrator::new(settings);

    let descriptor = BlobDescriptor::new(
        sha256_hex(&payload),
        payload.len() as u64,
        "video/mp4",
        vec![server.url("broken"), server.url("good")],
    );

    let events: Arc<Mutex<Vec<AcquireProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let first = orchestrator
        .acquire(
            &descriptor,
            Some(Arc::new(move |e| sink.lock().unwrap().push(e))),
        )
        .await
        .unwrap();

    assert!(!first.was_cached);
    assert_eq!(first.bytes, payload);
    let fetch = first.fetch.expect("network fetch happened");
    assert_eq!(fetch.url_index, 1);
    assert_eq!(fetch.success_url, server.url("good"));
    assert!(first.verification.expect("verified").is_valid);

    {
        let events = events.lock().unwrap();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, AcquireProgress::Retrying { url_index: 0, .. })),
            "a retrying event for the broken URL should have been emitted"
        );
        assert!(events.iter().any(|e| matches!(e, AcquireProgress::Fetching(_))));
        assert!(events.iter().any(|e| matches!(e, AcquireProgress::Verifying { .. })));
    }

    let health = orchestrator.health_tracker();
    assert!(health.health(&server.url("broken")).failure_count >= 1);
    assert_eq!(health.health(&server.url("good")).success_count, 1);

    let second = orchestrator.acquire(&descriptor, None).await.unwrap();
    assert!(second.was_cached);
    assert_eq!(second.bytes, payload);
    assert!(second.fetch.is_none());
    assert!(second.duration < Duration::from_millis(250));

    let stats = orchestrator.cache().stats().await.unwrap();
    assert_eq!(stats.entry_count, 1);
    assert!(stats.hit_count >= 1);
}

#[tokio::test]
async fn integrity_mismatch_is_terminal_and_never_cached() {
    let server = Fixture::start().await;
    let payload = test_payload(20_000, 8);
    server.add_blob("good", payload.clone(), ServeMode::Ranged);

    let orchestrator = BlobAcquisitionOrchestrator::new(quick_settings());
    let wrong_hash = "0".repeat(64);
    let descriptor = BlobDescriptor::new(
        wrong_hash.clone(),
        payload.len() as u64,
        "video/mp4",
        vec![server.url("good")],
    );

    let error = orchestrator.acquire(&descriptor, None).await.unwrap_err();
    assert_eq!(error.phase, AcquirePhase::Verifying);
    assert_eq!(error.descriptor.content_hash, wrong_hash);
    match error.source {
        FetchError::IntegrityMismatch { expected, computed } => {
            assert_eq!(expected, wrong_hash);
            assert_eq!(computed, sha256_hex(&payload));
        }
        other => panic!("expected IntegrityMismatch, got {other:?}"),
    }

    assert!(!orchestrator.cache().is_cached(&wrong_hash).await.unwrap());
}

#[tokio::test]
async fn oversize_blob_is_returned_but_not_cached() {
    let server = Fixture::start().await;
    let payload = test_payload(50_000, 9);
    server.add_blob("big", payload.clone(), ServeMode::Ranged);

    let settings = quick_settings().cache_capacity_bytes(10_000);
    let orchestrator = BlobAcquisitionOrchestrator::new(settings);
    let descriptor = BlobDescriptor::new(
        sha256_hex(&payload),
        payload.len() as u64,
        "video/mp4",
        vec![server.url("big")],
    );

    let first = orchestrator.acquire(&descriptor, None).await.unwrap();
    assert_eq!(first.bytes, payload);
    assert!(!orchestrator.cache().is_cached(&descriptor.content_hash).await.unwrap());

    // No cache entry, so the second acquire fetches again.
    let second = orchestrator.acquire(&descriptor, None).await.unwrap();
    assert!(!second.was_cached);
}

#[tokio::test]
async fn empty_url_list_fails_with_a_clear_message() {
    let orchestrator = BlobAcquisitionOrchestrator::new(quick_settings());
    let descriptor = BlobDescriptor::new("a".repeat(64), 1000, "video/mp4", Vec::new());

    let error = orchestrator.acquire(&descriptor, None).await.unwrap_err();
    assert_eq!(error.phase, AcquirePhase::Fetching);
    assert!(error.source.to_string().contains("No fallback URLs provided"));
}
