use std::time::Duration;
use tripwire::{AbuseGuard, GuardConfig, ManualClock};
use tripwire::telemetry::MemorySink;

/// Guard with 5 hits / 60s for both signals and 300s blocks, driven by a manual clock.
pub fn scripted_guard() -> (AbuseGuard<String, MemorySink>, ManualClock, MemorySink) {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let config = GuardConfig::builder()
        .suspicious(5, Duration::from_secs(60))
        .backend_errors(5, Duration::from_secs(60))
        .block_duration(Duration::from_secs(300))
        .build()
        .expect("valid config");
    let guard = AbuseGuard::new(config).with_clock(clock.clone()).with_sink(sink.clone());
    (guard, clock, sink)
}

/// Move the clock to an absolute second.
pub fn at(clock: &ManualClock, secs: u64) {
    clock.set(secs * 1_000);
}
