//! Convenient re-exports for common Tripwire types.
pub use crate::{
    clock::{Clock, ManualClock, MonotonicClock},
    config::{ConfigError, GuardConfig, GuardConfigBuilder},
    detector::{AbuseSignalDetector, SignalMatch, SuspiciousPatterns},
    guard::{AbuseGuard, RecordOutcome, Verdict},
    layer::GuardLayer,
    telemetry::{GuardEvent, LogSink, MemorySink, NonBlockingSink, Signal, TelemetrySink},
    GuardError,
};
