#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tripwire
//!
//! In-process abuse detection and adaptive blocking for request-serving applications.
//!
//! ## Features
//!
//! - **Suspicious-input detection** over named request fields
//! - **Sliding-window counters** per origin key, one per signal kind
//! - **Adaptive blocks** that lift on their own after a fixed duration
//! - **Sharded per-key state** so handlers on different keys rarely contend
//! - **Telemetry sinks** built on `tower::Service` and structured `tracing` logs
//! - **Tower middleware** that gates requests and feeds inner failures back
//!
//! ## Quick Start
//!
//! ```rust
//! use tripwire::{AbuseGuard, GuardConfig};
//! use std::time::Duration;
//!
//! let config = GuardConfig::builder()
//!     .suspicious(5, Duration::from_secs(60))
//!     .backend_errors(5, Duration::from_secs(60))
//!     .block_duration(Duration::from_secs(300))
//!     .build()
//!     .unwrap();
//! let guard: AbuseGuard = AbuseGuard::new(config);
//!
//! fn handle(guard: &AbuseGuard, ip: &str, username: &str) -> Result<String, &'static str> {
//!     if guard.is_blocked(ip) {
//!         return Err("too many suspicious requests");
//!     }
//!     if let Some(hit) = guard.check_fields([("username", username)]) {
//!         guard.record_suspicious(ip, &format!("/user param {}={}", hit.field, hit.value));
//!     }
//!     Ok(format!("hello {username}"))
//! }
//!
//! assert!(handle(&guard, "192.0.2.1", "alice").is_ok());
//! ```

pub mod blocklist;
pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod guard;
pub mod layer;
pub mod prelude;
pub mod telemetry;
pub mod window;

// Re-exports
pub use blocklist::{BlockRegistry, Deadline};
pub use clock::{Clock, ManualClock, MonotonicClock};
#[cfg(feature = "json")]
pub use config::GuardSettings;
pub use config::{ConfigError, GuardConfig, GuardConfigBuilder, SignalPolicy};
pub use detector::{AbuseSignalDetector, SignalMatch, SuspiciousPatterns};
pub use error::GuardError;
pub use guard::{AbuseGuard, GuardKey, GuardStats, RecordOutcome, SweepReport, Verdict};
pub use layer::{GuardLayer, GuardService};
pub use telemetry::{GuardEvent, ReleaseCause, Signal};
pub use window::{SignalLog, SlidingWindowCounter};
