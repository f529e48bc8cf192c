// Integration tests for `RemoteLoader` using wiremock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use edge_controller::cache::{CacheError, Cacher};
use edge_controller::config::Config;
use edge_controller::controller::ControllerCtx;
use edge_controller::loader::{Loader, LoaderError, ProcessFn, RemoteLoader, RetryPolicy};
use edge_controller::record::RecordType;

// ── Helpers ─────────────────────────────────────────────────────────

fn fast_policy(max_attempts: u32, delay_ms: u64) -> RetryPolicy {
    RetryPolicy {
        stream_pacing: Duration::ZERO,
        request_timeout: Duration::from_secs(2),
        ..RetryPolicy::new(max_attempts, Duration::from_millis(delay_ms))
    }
}

async fn setup(policy: RetryPolicy) -> (MockServer, RemoteLoader, Uuid) {
    let server = MockServer::start().await;
    let device = Uuid::new_v4();

    let logs_base = server.uri();
    let info_base = server.uri();
    let mut loader = RemoteLoader::new(
        Arc::new(|| reqwest::Client::builder().build()),
        Arc::new(move |device: Uuid| Url::parse(&format!("{logs_base}/admin/device/{device}/logs"))),
        Arc::new(move |device: Uuid| Url::parse(&format!("{info_base}/admin/device/{device}/info"))),
    )
    .with_policy(policy);
    loader.set_uuid(device);

    (server, loader, device)
}

fn logs_path(device: Uuid) -> String {
    format!("/admin/device/{device}/logs")
}

/// Callback that records every payload and stops once `stop_at` is seen.
fn collector(stop_at: Option<&'static str>) -> (Arc<Mutex<Vec<String>>>, ProcessFn) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let process: ProcessFn = Box::new(move |bytes: &[u8]| {
        let text = String::from_utf8_lossy(bytes).into_owned();
        let stop = stop_at.is_some_and(|marker| text.contains(marker));
        sink.lock().unwrap().push(text);
        Ok(!stop)
    });
    (seen, process)
}

#[derive(Default)]
struct RecordingCache {
    saved: Mutex<Vec<String>>,
}

#[async_trait]
impl Cacher for RecordingCache {
    async fn check_and_save(
        &self,
        _device: Uuid,
        _kind: RecordType,
        data: &[u8],
    ) -> Result<(), CacheError> {
        self.saved
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }
}

struct BrokenCache;

#[async_trait]
impl Cacher for BrokenCache {
    async fn check_and_save(
        &self,
        _device: Uuid,
        _kind: RecordType,
        _data: &[u8],
    ) -> Result<(), CacheError> {
        Err(CacheError::Backend("cache offline".to_string()))
    }
}

// ── Draining existing records ───────────────────────────────────────

#[tokio::test]
async fn test_process_existing_delivers_in_order() {
    let (server, loader, device) = setup(fast_policy(3, 10)).await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .and(header("X-Stream", "true"))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(1)
        .expect(0)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"n\": 1}\n{\"n\": 2}\n{\"n\": 3}\n"))
        .expect(1)
        .mount(&server)
        .await;

    let (seen, process) = collector(None);
    loader.process_existing(process, RecordType::Logs).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#]
    );
}

#[tokio::test]
async fn test_callback_stop_ends_drain() {
    let (server, loader, device) = setup(fast_policy(3, 10)).await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"step":"boot"}{"step":"ready"}{"step":"late"}{"step":"later"}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (seen, process) = collector(Some("ready"));
    loader.process_existing(process, RecordType::Logs).await.unwrap();

    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let (server, loader, device) = setup(fast_policy(3, 50)).await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let (seen, process) = collector(None);
    let err = loader
        .process_existing(process, RecordType::Logs)
        .await
        .unwrap_err();

    match err {
        LoaderError::AttemptsExhausted { attempts, last_error } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("500"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_skips_replayed_records() {
    let (server, mut loader, device) = setup(fast_policy(5, 10)).await;
    let cache = Arc::new(RecordingCache::default());
    loader.set_remote_cache(cache.clone());

    // First connection breaks after two records
    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"n":1}{"n":2}garbage"#))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"n":1}{"n":2}{"n":3}{"n":4}"#))
        .mount(&server)
        .await;

    let (seen, process) = collector(None);
    loader.process_existing(process, RecordType::Logs).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#, r#"{"n":4}"#]
    );
    // Replayed records are still written through to the cache
    assert_eq!(cache.saved.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn test_cache_errors_do_not_interrupt_delivery() {
    let (server, mut loader, device) = setup(fast_policy(3, 10)).await;
    loader.set_remote_cache(Arc::new(BrokenCache));

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"a":1}{"b":2}"#))
        .expect(1)
        .mount(&server)
        .await;

    let (seen, process) = collector(None);
    loader.process_existing(process, RecordType::Logs).await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_callback_error_is_retried_without_redelivery() {
    let (server, loader, device) = setup(fast_policy(3, 10)).await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"n":1}{"n":2}"#))
        .expect(2)
        .mount(&server)
        .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let process: ProcessFn = Box::new(move |bytes: &[u8]| {
        let mut seen = sink.lock().unwrap();
        seen.push(String::from_utf8_lossy(bytes).into_owned());
        if seen.len() == 1 {
            return Err("checker not ready".into());
        }
        Ok(true)
    });

    loader.process_existing(process, RecordType::Logs).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![r#"{"n":1}"#, r#"{"n":2}"#]);
}

#[tokio::test]
async fn test_slow_failures_reset_attempt_counter() {
    // Inactivity reset is 40ms; every failure below takes 80ms
    let (server, loader, device) = setup(fast_policy(2, 20)).await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(80)))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
        .expect(1)
        .mount(&server)
        .await;

    let (seen, process) = collector(None);
    loader.process_existing(process, RecordType::Logs).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![r#"{"ok":true}"#]);
}

// ── Streaming ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_stream_probes_then_streams() {
    let (server, loader, device) = setup(fast_policy(3, 10)).await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .and(header("X-Stream", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"src":"stream","n":1}{"src":"stream","n":2}"#))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    // Connectivity probe; its records never reach the callback
    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"src":"probe"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let (seen, process) = collector(Some(r#""n":2"#));
    loader
        .process_stream(process, RecordType::Logs, Duration::from_secs(5))
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|record| record.contains("stream")));
    assert!(!loader.is_first_load());
}

#[tokio::test]
async fn test_stream_timeout_wins_over_slow_controller() {
    let (server, loader, device) = setup(fast_policy(3, 10)).await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"late":true}"#)
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let (seen, process) = collector(None);
    let err = loader
        .process_stream(process, RecordType::Logs, Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, LoaderError::Timeout(_)));
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_stream_zero_timeout_waits_for_completion() {
    let (server, loader, device) = setup(fast_policy(3, 10)).await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .and(header("X-Stream", "true"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"done":true}"#)
                .set_delay(Duration::from_millis(100)),
        )
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (seen, process) = collector(None);
    loader
        .process_stream(process, RecordType::Logs, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![r#"{"done":true}"#]);
}

#[tokio::test]
async fn test_stream_retry_satisfied_by_replay() {
    let (server, loader, device) = setup(fast_policy(5, 10)).await;

    // The long-lived connection fails once and must not be reopened
    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .and(header("X-Stream", "true"))
        .respond_with(ResponseTemplate::new(503))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    // Probe, then the replay of existing records
    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"step":"boot"}{"step":"ready"}"#))
        .expect(2)
        .mount(&server)
        .await;

    let (seen, process) = collector(Some("ready"));
    loader
        .process_stream(process, RecordType::Logs, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![r#"{"step":"boot"}"#, r#"{"step":"ready"}"#]
    );
}

#[tokio::test]
async fn test_stream_resume_after_broken_stream() {
    let (server, loader, device) = setup(fast_policy(5, 10)).await;

    // First long-lived connection breaks after two records
    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .and(header("X-Stream", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"n":1}{"n":2}garbage"#))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    // Reopened stream redelivers from the start with new records appended
    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .and(header("X-Stream", "true"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"n":1}{"n":2}{"n":3}{"n":4}{"n":5}"#),
        )
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    // Probe and the replay of existing records
    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"n":1}{"n":2}{"n":3}"#))
        .expect(2)
        .mount(&server)
        .await;

    let (seen, process) = collector(None);
    loader
        .process_stream(process, RecordType::Logs, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#, r#"{"n":4}"#, r#"{"n":5}"#]
    );
}

#[tokio::test]
async fn test_dropped_stream_call_stops_retrying() {
    let (server, loader, device) = setup(fast_policy(1_000, 10)).await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    // The caller abandons an unbounded watch
    let (_, process) = collector(None);
    let outer = tokio::time::timeout(
        Duration::from_millis(100),
        loader.process_stream(process, RecordType::Logs, Duration::ZERO),
    )
    .await;
    assert!(outer.is_err());

    let at_drop = server.received_requests().await.unwrap().len();
    assert!(at_drop > 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let later = server.received_requests().await.unwrap().len();
    // At most one request may already have been in flight
    assert!(later <= at_drop + 1, "requests at drop={at_drop}, later={later}");
}

#[tokio::test]
async fn test_clone_probes_again() {
    let (server, loader, device) = setup(fast_policy(3, 10)).await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .and(header("X-Stream", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"n":1}"#))
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(logs_path(device)))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let (_, process) = collector(None);
    loader
        .process_stream(process, RecordType::Logs, Duration::from_secs(5))
        .await
        .unwrap();

    let mut sibling = loader.clone_loader();
    sibling.set_uuid(device);
    let (seen, process) = collector(None);
    sibling
        .process_stream(process, RecordType::Logs, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

// ── Controller wiring ───────────────────────────────────────────────

#[tokio::test]
async fn test_controller_loader_caches_into_files() {
    let server = MockServer::start().await;
    let tmp = tempfile::tempdir().unwrap();
    let device = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path(format!("/admin/device/{device}/info")))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"version":"1.2.0"}{"uptime":42}"#))
        .expect(1)
        .mount(&server)
        .await;

    let config = Config {
        controller_url: server.uri(),
        dir: tmp.path().to_path_buf(),
        caching: true,
        ..Config::default()
    };
    let ctx = ControllerCtx::from_config(&config)
        .unwrap()
        .with_policy(fast_policy(2, 10));

    let loader = ctx.loader_for(device).unwrap();
    let (seen, process) = collector(None);
    loader.process_existing(process, RecordType::Info).await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);

    let cached = std::fs::read_dir(ctx.cache_dir(device, RecordType::Info))
        .unwrap()
        .count();
    assert_eq!(cached, 2);
}
