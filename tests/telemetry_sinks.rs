#![allow(missing_docs)]

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tripwire::telemetry::{
    GuardEvent, MemorySink, MulticastSink, NonBlockingSink, StreamingSink, TelemetrySink,
};
use tripwire::{AbuseGuard, GuardConfig, ManualClock, ReleaseCause, Signal};

fn config() -> GuardConfig {
    GuardConfig::builder()
        .suspicious(2, Duration::from_secs(60))
        .build()
        .expect("valid config")
}

#[tokio::test]
async fn streaming_sink_delivers_guard_events() {
    let sink = StreamingSink::new(16);
    let mut rx = sink.subscribe();
    let clock = ManualClock::new();
    let guard = AbuseGuard::<String, _>::new(config()).with_clock(clock.clone()).with_sink(sink);

    guard.record_suspicious("k", "a");
    guard.record_suspicious("k", "b");
    assert!(guard.unblock("k"));

    match rx.recv().await.expect("blocked event") {
        GuardEvent::Blocked { key, signal, count, details, .. } => {
            assert_eq!(key, "k");
            assert_eq!(signal, Signal::Suspicious);
            assert_eq!(count, 2);
            assert_eq!(details, "b");
        }
        other => panic!("unexpected event {other}"),
    }
    assert_eq!(
        rx.recv().await.expect("released event"),
        GuardEvent::Released { key: "k".into(), cause: ReleaseCause::Manual }
    );
}

#[tokio::test]
async fn non_blocking_sink_forwards_from_worker() {
    let memory = MemorySink::new();
    let sink = NonBlockingSink::with_capacity(memory.clone(), 8);
    let guard = AbuseGuard::<String, _>::new(config()).with_sink(sink);

    guard.record_suspicious("k", "");
    guard.record_suspicious("k", "");

    for _ in 0..100 {
        if !memory.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(memory.len(), 1);
}

#[tokio::test]
async fn multicast_fans_out_guard_events() {
    let a = MemorySink::new();
    let b = MemorySink::new();
    let guard = AbuseGuard::<String, _>::new(config()).with_sink(MulticastSink::new(a.clone(), b.clone()));

    guard.record_suspicious("k", "");
    guard.record_suspicious("k", "");

    assert_eq!(a.events(), b.events());
    assert_eq!(a.len(), 1);
}

/// A sink that is never ready; the guard must drop events instead of waiting.
#[derive(Clone)]
struct NeverReady;

impl tower::Service<GuardEvent> for NeverReady {
    type Response = ();
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn call(&mut self, _event: GuardEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NeverReady {
    type SinkError = std::convert::Infallible;
}

#[test]
fn pending_sink_never_stalls_the_guard() {
    let guard = AbuseGuard::<String, _>::new(config()).with_sink(NeverReady);
    guard.record_suspicious("k", "");
    assert!(guard.record_suspicious("k", "").tripped());
    assert!(guard.is_blocked("k"));
}
