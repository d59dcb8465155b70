//! The abuse guard: signal counters and blocks behind one thread-safe facade.
//!
//! Request handlers share one [`AbuseGuard`] (usually through an `Arc`) and follow a
//! gate-then-feedback protocol:
//!
//! 1. [`AbuseGuard::is_blocked`] before doing any protected work;
//! 2. [`AbuseGuard::check_fields`] on the user-influenced inputs;
//! 3. [`AbuseGuard::record_suspicious`] / [`AbuseGuard::record_backend_error`] when the
//!    corresponding condition is observed.
//!
//! # Concurrency
//!
//! Per-key state (both signal logs and the blocked-until deadline) lives in one
//! [`DashMap`] entry. Recording, checking the threshold, blocking and resetting the log
//! all happen while that entry is held, so concurrent records for one key trip exactly
//! once. Keys in different map shards never contend.
//!
//! # Telemetry
//!
//! Events for a key are offered to the sink while the key's entry is still held, so a
//! sink sees each key's `Blocked`/`Released` events in the order the state changed.
//! The sink is polled once and never awaited: its `call` must finish without a runtime
//! or I/O wait, and must not call back into the guard. Wrap anything slower in
//! [`NonBlockingSink`](crate::telemetry::NonBlockingSink).
//!
//! # Memory
//!
//! Entries are only dropped by [`AbuseGuard::sweep_expired`]. There is no bound on the
//! number of distinct keys tracked.
//!
//! ```
//! use tripwire::{AbuseGuard, GuardConfig, RecordOutcome};
//!
//! let guard: AbuseGuard = AbuseGuard::new(GuardConfig::default());
//! let ip = "203.0.113.9";
//!
//! assert!(!guard.is_blocked(ip));
//! if let Some(hit) = guard.check_fields([("host", "8.8.8.8; cat /etc/passwd")]) {
//!     let details = format!("/ping param {}={}", hit.field, hit.value);
//!     for _ in 0..5 {
//!         guard.record_suspicious(ip, &details);
//!     }
//! }
//! assert!(guard.is_blocked(ip));
//! ```

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::blocklist::Deadline;
use crate::clock::{duration_to_millis, Clock, MonotonicClock};
use crate::config::GuardConfig;
use crate::detector::{AbuseSignalDetector, SignalMatch};
use crate::telemetry::{GuardEvent, NullSink, ReleaseCause, Signal, TelemetrySink};
use crate::window::SignalLog;

/// Requirements on guard keys. Implemented for every type that qualifies; `String` and
/// `std::net::IpAddr` are the usual choices. `Display` renders the key into events.
pub trait GuardKey: Hash + Eq + Clone + fmt::Display + Send + Sync + 'static {}

impl<T> GuardKey for T where T: Hash + Eq + Clone + fmt::Display + Send + Sync + 'static {}

/// Answer of the gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the caller must reject the request.
    pub blocked: bool,
    /// Remaining block time when blocked.
    pub retry_after: Option<Duration>,
}

impl Verdict {
    /// Not blocked.
    pub const ALLOW: Verdict = Verdict { blocked: false, retry_after: None };

    /// Check if the key is blocked.
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }
}

/// What a single record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The occurrence was counted; the threshold has not been reached.
    Counted {
        /// In-window occurrences including this one.
        count: usize,
        /// Threshold for this signal.
        threshold: usize,
    },
    /// The occurrence reached the threshold: the key is now blocked and its counter
    /// for this signal was reset.
    Tripped {
        /// In-window occurrences at the moment of the trip.
        count: usize,
        /// Block duration applied.
        blocked_for: Duration,
    },
}

impl RecordOutcome {
    /// Check if this record caused a block.
    pub fn tripped(&self) -> bool {
        matches!(self, RecordOutcome::Tripped { .. })
    }
}

/// Result of [`AbuseGuard::sweep_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired blocks removed.
    pub blocks_released: usize,
    /// Keys dropped because nothing about them was still in effect.
    pub keys_pruned: usize,
}

/// Point-in-time sizes of the guard's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardStats {
    /// Keys with any stored state.
    pub tracked_keys: usize,
    /// Keys with a non-empty suspicious-input log (stale logs included).
    pub suspicious_keys: usize,
    /// Keys with a non-empty backend-error log (stale logs included).
    pub backend_error_keys: usize,
    /// Keys currently blocked.
    pub active_blocks: usize,
    /// Stored deadlines, expired ones included.
    pub stored_blocks: usize,
}

#[derive(Debug, Default)]
struct KeyState {
    suspicious: SignalLog,
    backend_errors: SignalLog,
    blocked_until: Option<Deadline>,
}

impl KeyState {
    fn log(&self, signal: Signal) -> &SignalLog {
        match signal {
            Signal::Suspicious => &self.suspicious,
            Signal::BackendError => &self.backend_errors,
        }
    }

    fn log_mut(&mut self, signal: Signal) -> &mut SignalLog {
        match signal {
            Signal::Suspicious => &mut self.suspicious,
            Signal::BackendError => &mut self.backend_errors,
        }
    }
}

/// Per-origin abuse counters and adaptive blocks, safe to share across request handlers.
pub struct AbuseGuard<K = String, S = NullSink> {
    states: DashMap<K, KeyState>,
    config: GuardConfig,
    detector: AbuseSignalDetector,
    clock: Arc<dyn Clock>,
    sink: S,
}

impl<K> AbuseGuard<K, NullSink>
where
    K: GuardKey,
{
    /// Create a guard with the default detector, a monotonic clock and no telemetry sink
    /// (trips are still logged through `tracing`).
    pub fn new(config: GuardConfig) -> Self {
        Self {
            states: DashMap::with_shard_amount(config.shards()),
            config,
            detector: AbuseSignalDetector::default(),
            clock: Arc::new(MonotonicClock::default()),
            sink: NullSink,
        }
    }
}

impl<K, S> AbuseGuard<K, S>
where
    K: GuardKey,
    S: TelemetrySink,
{
    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the field detector.
    pub fn with_detector(mut self, detector: AbuseSignalDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Route guard events to `sink`. See the module docs for what a sink may do.
    pub fn with_sink<S2: TelemetrySink>(self, sink: S2) -> AbuseGuard<K, S2> {
        AbuseGuard {
            states: self.states,
            config: self.config,
            detector: self.detector,
            clock: self.clock,
            sink,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Gate check: true iff `key` is currently blocked. An expired deadline is cleared
    /// as a side effect.
    pub fn is_blocked<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.check(key).blocked
    }

    /// Gate check with the remaining block time.
    pub fn check<Q>(&self, key: &Q) -> Verdict
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.clock.now_millis();
        let Some(mut state) = self.states.get_mut(key) else {
            return Verdict::ALLOW;
        };
        let Some(until) = state.blocked_until else {
            return Verdict::ALLOW;
        };
        match until.remaining(now) {
            Some(remaining) => Verdict { blocked: true, retry_after: Some(remaining) },
            None => {
                state.blocked_until = None;
                debug!(target: "tripwire::guard", key = %state.key(), "block expired");
                self.emit(GuardEvent::Released {
                    key: state.key().to_string(),
                    cause: ReleaseCause::Expired,
                });
                Verdict::ALLOW
            }
        }
    }

    /// Scan request fields, in the order given, for suspicious tokens. Records nothing;
    /// call [`record_suspicious`](Self::record_suspicious) to count the hit.
    pub fn check_fields<'a, I>(&self, fields: I) -> Option<SignalMatch<'a>>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.detector.scan(fields)
    }

    /// Count a suspicious-input occurrence for `key`, blocking it once the suspicious
    /// threshold is reached within the window.
    pub fn record_suspicious(&self, key: impl Into<K>, details: &str) -> RecordOutcome {
        self.record(Signal::Suspicious, key.into(), details)
    }

    /// Count a backend failure for `key`, blocking it once the backend-error threshold is
    /// reached within the window. Independent of the suspicious-input counter.
    pub fn record_backend_error(&self, key: impl Into<K>, details: &str) -> RecordOutcome {
        self.record(Signal::BackendError, key.into(), details)
    }

    /// In-window occurrences of `signal` currently held for `key`.
    pub fn signal_count<Q>(&self, signal: Signal, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.clock.now_millis();
        let window_ms = self.window_ms(signal);
        self.states.get(key).map_or(0, |state| state.log(signal).count(now, window_ms))
    }

    /// Lift an active block on `key`. Counters are left alone. Returns true if a block
    /// was lifted; a deadline that had already passed is reported as expired instead.
    pub fn unblock<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.clock.now_millis();
        let Some(mut state) = self.states.get_mut(key) else {
            return false;
        };
        let Some(until) = state.blocked_until.take() else {
            return false;
        };
        let lifted = !until.is_expired(now);
        let cause = if lifted {
            info!(target: "tripwire::guard", key = %state.key(), "block lifted manually");
            ReleaseCause::Manual
        } else {
            ReleaseCause::Expired
        };
        self.emit(GuardEvent::Released { key: state.key().to_string(), cause });
        lifted
    }

    /// Clear expired deadlines and drop keys with nothing left in effect.
    ///
    /// Only state that no longer affects any verdict or count is removed.
    pub fn sweep_expired(&self) -> SweepReport {
        let now = self.clock.now_millis();
        let suspicious_ms = self.window_ms(Signal::Suspicious);
        let errors_ms = self.window_ms(Signal::BackendError);
        let mut report = SweepReport::default();

        self.states.retain(|key, state| {
            if state.blocked_until.is_some_and(|until| until.is_expired(now)) {
                state.blocked_until = None;
                report.blocks_released += 1;
                self.emit(GuardEvent::Released {
                    key: key.to_string(),
                    cause: ReleaseCause::Expired,
                });
            }
            let idle = state.blocked_until.is_none()
                && state.suspicious.is_stale(now, suspicious_ms)
                && state.backend_errors.is_stale(now, errors_ms);
            if idle {
                report.keys_pruned += 1;
            }
            !idle
        });

        if report != SweepReport::default() {
            debug!(
                target: "tripwire::guard",
                blocks_released = report.blocks_released,
                keys_pruned = report.keys_pruned,
                "sweep complete"
            );
        }
        report
    }

    /// State sizes across the whole map.
    pub fn stats(&self) -> GuardStats {
        let now = self.clock.now_millis();
        self.states.iter().fold(GuardStats::default(), |mut acc, entry| {
            let state = entry.value();
            acc.tracked_keys += 1;
            acc.suspicious_keys += usize::from(!state.suspicious.is_empty());
            acc.backend_error_keys += usize::from(!state.backend_errors.is_empty());
            if let Some(until) = state.blocked_until {
                acc.stored_blocks += 1;
                acc.active_blocks += usize::from(!until.is_expired(now));
            }
            acc
        })
    }

    fn record(&self, signal: Signal, key: K, details: &str) -> RecordOutcome {
        let policy = self.config.policy(signal);
        let window_ms = self.window_ms(signal);
        let block_for = self.config.block_duration();
        let now = self.clock.now_millis();

        let mut state = self.states.entry(key).or_default();
        let count = state.log_mut(signal).record(now, window_ms);
        if count < policy.threshold() {
            return RecordOutcome::Counted { count, threshold: policy.threshold() };
        }

        let previous = state.blocked_until.replace(Deadline::after(now, block_for));
        state.log_mut(signal).clear();

        if previous.is_some_and(|until| until.is_expired(now)) {
            self.emit(GuardEvent::Released {
                key: state.key().to_string(),
                cause: ReleaseCause::Expired,
            });
        }
        warn!(
            target: "tripwire::guard",
            key = %state.key(),
            signal = %signal,
            count,
            block_secs = block_for.as_secs(),
            details,
            "blocking key"
        );
        self.emit(GuardEvent::Blocked {
            key: state.key().to_string(),
            signal,
            count,
            duration: block_for,
            details: details.to_owned(),
        });
        RecordOutcome::Tripped { count, blocked_for: block_for }
    }

    fn window_ms(&self, signal: Signal) -> u64 {
        duration_to_millis(self.config.policy(signal).window())
    }

    /// Offer `event` to the sink once, without waiting.
    fn emit(&self, event: GuardEvent) {
        let mut sink = self.sink.clone();
        match sink.ready().now_or_never() {
            Some(Ok(ready)) => match ready.call(event).now_or_never() {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    debug!(target: "tripwire::guard", error = %e, "telemetry sink rejected event")
                }
                None => debug!(target: "tripwire::guard", "telemetry sink would wait; event dropped"),
            },
            Some(Err(e)) => {
                debug!(target: "tripwire::guard", error = %e, "telemetry sink failed; event dropped")
            }
            None => debug!(target: "tripwire::guard", "telemetry sink not ready; event dropped"),
        }
    }
}

impl<K, S> AbuseGuard<K, S>
where
    K: GuardKey,
    S: TelemetrySink + Sync,
{
    /// Periodically run [`sweep_expired`](Self::sweep_expired) on the tokio runtime.
    ///
    /// The task holds a weak reference and exits once the guard is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(guard) = weak.upgrade() else { break };
                guard.sweep_expired();
            }
        })
    }
}

impl<K, S> fmt::Debug for AbuseGuard<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbuseGuard")
            .field("config", &self.config)
            .field("detector", &self.detector)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
