#![allow(missing_docs)]

mod common;

use common::test_helpers::{at, scripted_guard};
use std::time::Duration;
use tripwire::{AbuseGuard, GuardConfig, GuardEvent, RecordOutcome, Signal};

#[test]
fn five_suspicious_hits_in_a_minute_block_for_five_minutes() {
    let (guard, clock, sink) = scripted_guard();
    let ip = "203.0.113.7";

    for t in [0, 10, 20, 30] {
        at(&clock, t);
        assert!(!guard.record_suspicious(ip, "/user param username=x'").tripped());
        assert!(!guard.is_blocked(ip));
    }
    at(&clock, 40);
    let outcome = guard.record_suspicious(ip, "/user param username=x'");
    assert_eq!(outcome, RecordOutcome::Tripped { count: 5, blocked_for: Duration::from_secs(300) });

    at(&clock, 339);
    assert!(guard.is_blocked(ip), "still blocked one second before the deadline");
    at(&clock, 341);
    assert!(!guard.is_blocked(ip), "released after 300s");

    assert_eq!(
        sink.events().first(),
        Some(&GuardEvent::Blocked {
            key: ip.into(),
            signal: Signal::Suspicious,
            count: 5,
            duration: Duration::from_secs(300),
            details: "/user param username=x'".into(),
        })
    );
}

#[test]
fn hits_spread_past_the_window_never_block() {
    let (guard, clock, sink) = scripted_guard();
    for t in [0, 10, 20, 30, 100] {
        at(&clock, t);
        guard.record_suspicious("k", "");
    }
    assert!(!guard.is_blocked("k"));
    assert_eq!(guard.signal_count(Signal::Suspicious, "k"), 1);
    assert!(sink.is_empty());
}

#[test]
fn counter_restarts_from_zero_after_a_trip() {
    let (guard, clock, _) = scripted_guard();
    for _ in 0..5 {
        guard.record_backend_error("k", "spawn failed");
    }
    at(&clock, 301);
    assert!(!guard.is_blocked("k"));
    for _ in 0..4 {
        assert!(!guard.record_backend_error("k", "spawn failed").tripped());
    }
    assert!(!guard.is_blocked("k"), "four fresh errors are below threshold");
}

#[test]
fn signals_are_counted_independently() {
    let (guard, _, _) = scripted_guard();
    for _ in 0..4 {
        guard.record_suspicious("k", "");
        guard.record_backend_error("k", "");
    }
    assert!(!guard.is_blocked("k"), "4 + 4 never adds up to a trip");
    assert_eq!(guard.signal_count(Signal::Suspicious, "k"), 4);
    assert_eq!(guard.signal_count(Signal::BackendError, "k"), 4);

    assert!(guard.record_backend_error("k", "db locked").tripped());
    assert_eq!(guard.signal_count(Signal::Suspicious, "k"), 4, "other signal untouched");
    assert_eq!(guard.signal_count(Signal::BackendError, "k"), 0);
}

#[test]
fn keys_do_not_affect_each_other() {
    let (guard, _, _) = scripted_guard();
    for _ in 0..5 {
        guard.record_suspicious("bad", "");
    }
    assert!(guard.is_blocked("bad"));
    assert!(!guard.is_blocked("good"));
}

#[test]
fn handler_flow_with_field_scan() {
    let guard: AbuseGuard = AbuseGuard::new(GuardConfig::default());
    let ip = "198.51.100.23";

    let requests = [
        [("host", "8.8.8.8"), ("user_agent", "curl/8.4.0")],
        [("host", "8.8.8.8 && cat /etc/passwd"), ("user_agent", "curl/8.4.0")],
    ];

    let mut served = 0;
    for _ in 0..5 {
        for fields in requests {
            if guard.is_blocked(ip) {
                continue;
            }
            if let Some(hit) = guard.check_fields(fields) {
                assert_eq!(hit.field, "host");
                assert_eq!(hit.token, "&&");
                guard.record_suspicious(ip, &format!("/ping param {}={}", hit.field, hit.value));
                continue;
            }
            served += 1;
        }
    }
    assert!(guard.is_blocked(ip));
    assert_eq!(served, 5, "clean requests are served until the trip");
}

#[test]
fn empty_and_absent_fields_are_clean() {
    let guard: AbuseGuard = AbuseGuard::new(GuardConfig::default());
    assert!(guard.check_fields([("username", "")]).is_none());
    assert!(guard.check_fields(std::iter::empty()).is_none());
}
