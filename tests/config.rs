#![allow(missing_docs)]

use std::time::Duration;
use tripwire::{AbuseGuard, ConfigError, GuardConfig, ManualClock, Signal};

#[test]
fn builder_values_drive_the_guard() {
    let config = GuardConfig::builder()
        .suspicious(2, Duration::from_secs(10))
        .backend_errors(3, Duration::from_secs(10))
        .block_duration(Duration::from_secs(30))
        .shards(2)
        .build()
        .expect("valid config");
    let clock = ManualClock::new();
    let guard: AbuseGuard = AbuseGuard::new(config).with_clock(clock.clone());

    guard.record_suspicious("k", "");
    clock.advance(Duration::from_secs(11));
    guard.record_suspicious("k", "");
    assert!(!guard.is_blocked("k"), "first hit aged out of the 10s window");

    guard.record_suspicious("k", "");
    assert!(guard.is_blocked("k"));
    clock.advance(Duration::from_secs(30));
    assert!(!guard.is_blocked("k"));
}

#[test]
fn invalid_values_are_rejected_before_a_guard_exists() {
    let err = GuardConfig::builder().suspicious(0, Duration::from_secs(60)).build().unwrap_err();
    assert!(matches!(err, ConfigError::ZeroThreshold { signal: Signal::Suspicious }));
    assert_eq!(err.to_string(), "suspicious_input threshold must be > 0");
}

#[cfg(feature = "json")]
#[test]
fn settings_file_round_trip() {
    use tripwire::GuardSettings;

    let raw = r#"{
        "suspicious_threshold": 3,
        "suspicious_window_seconds": 30,
        "error_threshold": 10,
        "error_window_seconds": 120,
        "block_duration_seconds": 600
    }"#;
    let config = GuardSettings::from_json(raw).and_then(GuardSettings::into_config).expect("valid");
    assert_eq!(config.suspicious().threshold(), 3);
    assert_eq!(config.suspicious().window(), Duration::from_secs(30));
    assert_eq!(config.backend_errors().threshold(), 10);
    assert_eq!(config.block_duration(), Duration::from_secs(600));
    assert_eq!(config.shards(), 16, "missing fields use defaults");

    let back = serde_json::to_value(GuardSettings::from(&config)).expect("serializable");
    assert_eq!(back["error_window_seconds"], 120);
}

#[cfg(feature = "json")]
#[test]
fn malformed_settings_surface_parse_errors() {
    use tripwire::GuardSettings;

    let err = GuardSettings::from_json("{ not json").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
    assert!(err.to_string().starts_with("invalid guard settings"));
}
