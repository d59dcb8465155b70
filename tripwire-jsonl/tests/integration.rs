use std::time::Duration;
use tower_service::Service;
use tripwire::telemetry::{GuardEvent, NonBlockingSink, ReleaseCause, Signal};
use tripwire::{AbuseGuard, GuardConfig};
use tripwire_jsonl::JsonlSink;

fn lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

async fn wait_for_lines(path: &std::path::Path, want: usize) -> Vec<serde_json::Value> {
    let mut events = Vec::new();
    for _ in 0..200 {
        events = lines(path);
        if events.len() >= want {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    events
}

fn trip_on_second_error() -> GuardConfig {
    GuardConfig::builder()
        .backend_errors(2, Duration::from_secs(60))
        .build()
        .expect("valid config")
}

#[tokio::test]
async fn writes_json_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("guard.jsonl");
    let mut sink = JsonlSink::new(&path).expect("inside a runtime");

    sink.call(GuardEvent::Blocked {
        key: "10.0.0.1".into(),
        signal: Signal::Suspicious,
        count: 5,
        duration: Duration::from_secs(300),
        details: "/ping param host=1.1.1.1;id".into(),
    })
    .await
    .unwrap();
    sink.call(GuardEvent::Released { key: "10.0.0.1".into(), cause: ReleaseCause::Manual })
        .await
        .unwrap();

    let events = wait_for_lines(&path, 2).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["kind"], "blocked");
    assert_eq!(events[0]["signal"], "suspicious_input");
    assert_eq!(events[0]["duration_ms"], 300_000);
    assert_eq!(events[1]["cause"], "manual");
    assert_eq!(sink.dropped(), 0);
}

#[test]
fn new_outside_runtime_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = JsonlSink::new(dir.path().join("guard.jsonl")).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::Other);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn guard_writes_through_bare_sink() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("guard.jsonl");
    let sink = JsonlSink::new(&path).expect("inside a runtime");
    let guard = AbuseGuard::<String, _>::new(trip_on_second_error()).with_sink(sink.clone());

    guard.record_backend_error("192.0.2.5", "query=SELECT 1 exc=locked");
    guard.record_backend_error("192.0.2.5", "query=SELECT 1 exc=locked");
    assert!(guard.unblock("192.0.2.5"));

    let events = wait_for_lines(&path, 2).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["key"], "192.0.2.5");
    assert_eq!(events[0]["signal"], "backend_error");
    assert_eq!(events[1]["cause"], "manual");
    assert_eq!(sink.dropped(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn guard_records_from_plain_thread() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("guard.jsonl");
    let sink = JsonlSink::new(&path).expect("inside a runtime");
    let guard = std::sync::Arc::new(
        AbuseGuard::<String, _>::new(trip_on_second_error()).with_sink(sink),
    );

    let worker = guard.clone();
    let tripped = std::thread::spawn(move || {
        worker.record_backend_error("198.51.100.7", "spawn failed");
        worker.record_backend_error("198.51.100.7", "spawn failed").tripped()
    })
    .join()
    .expect("recording from a plain thread must not panic");
    assert!(tripped);

    let events = wait_for_lines(&path, 1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["key"], "198.51.100.7");
    assert_eq!(events[0]["details"], "spawn failed");
}

#[tokio::test]
async fn full_queue_counts_drops() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("guard.jsonl");
    let mut sink = JsonlSink::with_capacity(&path, 1).expect("inside a runtime");

    // the current-thread writer cannot run between these calls
    for _ in 0..3 {
        sink.call(GuardEvent::Released { key: "k".into(), cause: ReleaseCause::Expired })
            .await
            .unwrap();
    }
    assert_eq!(sink.dropped(), 2);
    assert_eq!(wait_for_lines(&path, 1).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn guard_trips_land_in_file_through_non_blocking_wrapper() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("guard.jsonl");
    let inner = JsonlSink::new(&path).expect("inside a runtime");
    let sink = NonBlockingSink::with_capacity(inner, 16);
    let guard = AbuseGuard::<String, _>::new(trip_on_second_error()).with_sink(sink);

    guard.record_backend_error("192.0.2.5", "query=SELECT 1 exc=locked");
    guard.record_backend_error("192.0.2.5", "query=SELECT 1 exc=locked");

    let events = wait_for_lines(&path, 1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["key"], "192.0.2.5");
    assert_eq!(events[0]["signal"], "backend_error");
}
