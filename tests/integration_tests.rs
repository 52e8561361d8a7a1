//! End-to-end ingestion, discovery, and query tests
//!
//! Each test drives the full path: mock upstream -> rate-limited dispatch ->
//! streaming extraction -> partitioned store -> index-backed queries.

use base64::Engine;
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use thermo_history::config::directory::SiteDirectory;
use thermo_history::storage::QueryRequest;
use thermo_history::{HistoryConfig, HistoryError, HistoryService};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, ResponseTemplate};

mod common;
use common::telemetry_mock::{device_block, history_document, HISTORY_PATH};
use common::MockTelemetryServer;

const SITE: &str = "site-1";

fn day(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn ts(s: &str) -> NaiveDateTime {
    s.parse().unwrap()
}

fn request(device: &str, start: &str, end: &str, page: usize, page_size: usize) -> QueryRequest {
    QueryRequest {
        site: SITE.to_string(),
        device: device.to_string(),
        start: day(start),
        end: day(end),
        page,
        page_size,
    }
}

/// Config pointed at the mock upstream and a temp store, with `site-1`
/// registered in the site directory
fn base_config(mock_url: &str, dir: &TempDir) -> HistoryConfig {
    let mut sites = SiteDirectory::default();
    sites.add_site(SITE, "ops", "s3cret");
    let sites_file = dir.path().join("sites.json");
    sites.save(&sites_file).unwrap();

    let mut config = HistoryConfig::default();
    config.upstream.base_url = mock_url.parse().unwrap();
    config.dispatcher.requests_per_second = 50.0; // keep span pacing out of test time
    config.storage.root_dir = dir.path().join("store");
    config.sites_file = sites_file;
    config
}

async fn service_from(config: HistoryConfig) -> HistoryService {
    HistoryService::new(config).await.unwrap()
}

#[tokio::test]
async fn test_ingest_end_to_end() {
    let mock = MockTelemetryServer::start().await;
    let dir = TempDir::new().unwrap();

    let body = history_document(
        &[
            device_block("A1", "Lobby", "2025-08-30", &[0, 1, 2]),
            device_block("B2", "Annex", "2025-08-30", &[0, 1]),
        ],
        "2 devices returned",
    );
    let auth = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode("ops:s3cret")
    );
    mock.add_mock(
        Mock::given(method("POST"))
            .and(path(HISTORY_PATH))
            .and(header("authorization", auth.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json")),
    )
    .await;

    let service = service_from(base_config(mock.url(), &dir)).await;
    let report = service
        .ingest_range(SITE, day("2025-08-30"), day("2025-08-30"))
        .await
        .unwrap();

    assert_eq!(report.spans, 1);
    assert_eq!(report.devices, 2);
    assert_eq!(report.records, 5);
    assert_eq!(report.partitions_touched, 2);

    let page = service
        .query(request("A1", "2025-08-30", "2025-08-30", 0, 10))
        .await
        .unwrap();
    assert_eq!(page.records.len(), 3);
    assert!(!page.has_more);
    assert!(page
        .records
        .windows(2)
        .all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(page.records[0].device_name.as_deref(), Some("Lobby"));
    assert_eq!(page.records[0].temperature, Some(70.0));

    let stats = service.stats().await;
    assert_eq!(stats.sites, 1);
    assert_eq!(stats.devices, 2);
    assert_eq!(stats.partitions, 2);
    assert_eq!(stats.total_records, 5);
}

#[tokio::test]
async fn test_multi_span_ingest_splits_requests() {
    let mock = MockTelemetryServer::start().await;
    let dir = TempDir::new().unwrap();

    // two-day cap turns Jan 1-5 into three spans; the middle span ends at a
    // day boundary and the final span is clamped to the range end
    let spans: [(&str, &str, &str, &[u32]); 3] = [
        (
            "2025-01-01T00:00:00",
            "2025-01-02T23:59:59",
            "2025-01-01",
            &[0, 6],
        ),
        (
            "2025-01-03T00:00:00",
            "2025-01-04T23:59:59",
            "2025-01-03",
            &[12],
        ),
        (
            "2025-01-05T00:00:00",
            "2025-01-05T23:59:59",
            "2025-01-05",
            &[7, 8, 9],
        ),
    ];
    for (start, end, date, hours) in spans {
        let body = history_document(&[device_block("A1", "Lobby", date, hours)], "ok");
        mock.add_mock(
            Mock::given(method("POST"))
                .and(path(HISTORY_PATH))
                .and(body_partial_json(json!({
                    "startDateTime": start,
                    "endDateTime": end,
                })))
                .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
                .expect(1),
        )
        .await;
    }

    let mut config = base_config(mock.url(), &dir);
    config.upstream.max_span_days = 2;
    let service = service_from(config).await;

    let report = service
        .ingest_range(SITE, day("2025-01-01"), day("2025-01-05"))
        .await
        .unwrap();
    assert_eq!(report.spans, 3);
    assert_eq!(report.devices, 1);
    assert_eq!(report.records, 6);
    assert_eq!(report.partitions_touched, 3);

    let page = service
        .query(request("A1", "2025-01-01", "2025-01-05", 0, 0))
        .await
        .unwrap();
    assert_eq!(page.records.len(), 6);
    assert!(!page.has_more);
}

#[tokio::test]
async fn test_unknown_site_fails_before_any_request() {
    let mock = MockTelemetryServer::start().await;
    let dir = TempDir::new().unwrap();
    mock.add_mock(
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0),
    )
    .await;

    let service = service_from(base_config(mock.url(), &dir)).await;
    let err = service
        .ingest_range("ghost-site", day("2025-08-30"), day("2025-08-30"))
        .await
        .unwrap_err();
    assert!(err.is_auth_error());
    // expect(0) above verifies nothing reached the upstream
}

#[tokio::test]
async fn test_upstream_error_body_is_truncated() {
    let mock = MockTelemetryServer::start().await;
    let dir = TempDir::new().unwrap();
    mock.mock_error_response(500, &"x".repeat(600)).await;

    let service = service_from(base_config(mock.url(), &dir)).await;
    let err = service
        .ingest_range(SITE, day("2025-08-30"), day("2025-08-30"))
        .await
        .unwrap_err();

    match err {
        HistoryError::Transport { status, ref body } => {
            assert_eq!(status, 500);
            assert_eq!(body.len(), 503);
            assert!(body.ends_with("..."));
        }
        ref other => panic!("expected transport error, got {other}"),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_malformed_payload_aborts_but_keeps_prior_writes() {
    let mock = MockTelemetryServer::start().await;
    let dir = TempDir::new().unwrap();

    let good = device_block("A1", "Lobby", "2025-08-30", &[0, 1]).to_string();
    let body = format!(r#"{{"result":[{{"ThermostatHistory":[{good},{{"serialNo": 42}}]}}]}}"#);
    mock.mock_history_body(body).await;

    let service = service_from(base_config(mock.url(), &dir)).await;
    let err = service
        .ingest_range(SITE, day("2025-08-30"), day("2025-08-30"))
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::Parse(_)));

    // the object before the malformed one is already durable
    let page = service
        .query(request("A1", "2025-08-30", "2025-08-30", 0, 10))
        .await
        .unwrap();
    assert_eq!(page.records.len(), 2);
    assert_eq!(service.stats().await.total_records, 2);
}

#[tokio::test]
async fn test_discover_lists_devices_without_writing() {
    let mock = MockTelemetryServer::start().await;
    let dir = TempDir::new().unwrap();

    let body = history_document(
        &[
            device_block("A1", "Lobby", "2025-08-30", &[0]),
            json!({"serialNo": "C3", "History": []}),
        ],
        "2 devices",
    );
    mock.mock_history_body(body).await;

    let service = service_from(base_config(mock.url(), &dir)).await;
    let serials = service.discover(SITE, day("2025-08-30")).await.unwrap();
    assert_eq!(serials, ["A1", "C3"]);

    // discovery never lands records or partitions
    let stats = service.stats().await;
    assert_eq!(stats.sites, 0);
    assert_eq!(stats.total_records, 0);
}

#[tokio::test]
async fn test_pagination_skips_and_exact_fill() {
    let mock = MockTelemetryServer::start().await;
    let dir = TempDir::new().unwrap();

    let body = history_document(
        &[
            device_block("A1", "Lobby", "2025-08-29", &[1, 2, 3, 4]),
            device_block("A1", "Lobby", "2025-08-30", &[1, 2, 3, 4]),
            device_block("A1", "Lobby", "2025-08-31", &[1, 2, 3, 4]),
        ],
        "ok",
    );
    mock.mock_history_body(body).await;

    let service = service_from(base_config(mock.url(), &dir)).await;
    service
        .ingest_range(SITE, day("2025-08-29"), day("2025-08-31"))
        .await
        .unwrap();

    // 12 records in size-5 pages: 5 + 5 + 2
    let p0 = service
        .query(request("A1", "2025-08-29", "2025-08-31", 0, 5))
        .await
        .unwrap();
    assert_eq!(p0.records.len(), 5);
    assert!(p0.has_more);

    let p1 = service
        .query(request("A1", "2025-08-29", "2025-08-31", 1, 5))
        .await
        .unwrap();
    assert_eq!(p1.records.len(), 5);
    assert!(p1.has_more);
    // the skip crosses into the second partition arithmetically
    assert_eq!(p1.records[0].timestamp, ts("2025-08-30T02:00:00"));

    let p2 = service
        .query(request("A1", "2025-08-29", "2025-08-31", 2, 5))
        .await
        .unwrap();
    assert_eq!(p2.records.len(), 2);
    assert!(!p2.has_more);

    let all: Vec<_> = p0
        .records
        .iter()
        .chain(&p1.records)
        .chain(&p2.records)
        .collect();
    assert_eq!(all.len(), 12);
    assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    // a final page that fills exactly reports no more
    let exact = service
        .query(request("A1", "2025-08-29", "2025-08-31", 1, 6))
        .await
        .unwrap();
    assert_eq!(exact.records.len(), 6);
    assert!(!exact.has_more);

    let past = service
        .query(request("A1", "2025-08-29", "2025-08-31", 2, 6))
        .await
        .unwrap();
    assert!(past.records.is_empty());
    assert!(!past.has_more);
}

#[tokio::test]
async fn test_empty_history_array_reports_nothing() {
    let mock = MockTelemetryServer::start().await;
    let dir = TempDir::new().unwrap();
    mock.mock_history_body(history_document(&[], "no data in range"))
        .await;

    let service = service_from(base_config(mock.url(), &dir)).await;
    let report = service
        .ingest_range(SITE, day("2025-08-30"), day("2025-08-30"))
        .await
        .unwrap();
    assert_eq!(report.spans, 1);
    assert_eq!(report.devices, 0);
    assert_eq!(report.records, 0);
    assert_eq!(service.stats().await.partitions, 0);
}

#[tokio::test]
async fn test_slow_upstream_hits_task_timeout() {
    let mock = MockTelemetryServer::start().await;
    let dir = TempDir::new().unwrap();
    mock.add_mock(
        Mock::given(method("POST"))
            .and(path(HISTORY_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(history_document(&[], "late"), "application/json")
                    .set_delay(Duration::from_secs(2)),
            ),
    )
    .await;

    let mut config = base_config(mock.url(), &dir);
    config.dispatcher.task_timeout = Duration::from_millis(200);
    let service = service_from(config).await;

    let err = service
        .ingest_range(SITE, day("2025-08-30"), day("2025-08-30"))
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::Timeout(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_reingest_same_range_is_idempotent() {
    let mock = MockTelemetryServer::start().await;
    let dir = TempDir::new().unwrap();
    mock.mock_history_body(history_document(
        &[device_block("A1", "Lobby", "2025-08-30", &[0, 1])],
        "ok",
    ))
    .await;

    let service = service_from(base_config(mock.url(), &dir)).await;
    service
        .ingest_range(SITE, day("2025-08-30"), day("2025-08-30"))
        .await
        .unwrap();
    let first = service.stats().await;

    service
        .ingest_range(SITE, day("2025-08-30"), day("2025-08-30"))
        .await
        .unwrap();
    let second = service.stats().await;

    assert_eq!(first.total_records, 2);
    assert_eq!(second.total_records, first.total_records);
    assert_eq!(second.partitions, first.partitions);
}
