//! Guard configuration: thresholds, windows, block duration and sharding.
//!
//! Values are fixed once a guard is built. Use [`GuardConfig::builder`] in code, or
//! [`GuardSettings`] (feature `json`) to load the flat option set from JSON.

use std::time::Duration;

use crate::telemetry::Signal;

/// Default occurrences per window that trip a block, for either signal.
pub const DEFAULT_THRESHOLD: usize = 5;
/// Default counting window, for either signal.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Default block duration.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(300);
/// Default number of map shards.
pub const DEFAULT_SHARDS: usize = 16;

/// Errors produced when validating guard configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// A signal threshold of zero would block on no evidence.
    #[error("{signal} threshold must be > 0")]
    ZeroThreshold {
        /// Signal the threshold belongs to.
        signal: Signal,
    },
    /// A zero-length window can never hold more than the current event.
    #[error("{signal} window must be > 0")]
    ZeroWindow {
        /// Signal the window belongs to.
        signal: Signal,
    },
    /// Block duration must be > 0.
    #[error("block duration must be > 0")]
    ZeroBlockDuration,
    /// The key map needs a power-of-two shard count of at least 2.
    #[error("shards must be a power of two >= 2, got {shards}")]
    InvalidShards {
        /// Rejected value.
        shards: usize,
    },
    /// Settings could not be parsed.
    #[cfg(feature = "json")]
    #[error("invalid guard settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Threshold and window for one signal kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalPolicy {
    threshold: usize,
    window: Duration,
}

impl SignalPolicy {
    /// Create a policy, validating both values for `signal`.
    pub fn new(signal: Signal, threshold: usize, window: Duration) -> Result<Self, ConfigError> {
        if threshold == 0 {
            return Err(ConfigError::ZeroThreshold { signal });
        }
        if window.is_zero() {
            return Err(ConfigError::ZeroWindow { signal });
        }
        Ok(Self { threshold, window })
    }

    /// Occurrences within the window that trip a block.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Counting window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self { threshold: DEFAULT_THRESHOLD, window: DEFAULT_WINDOW }
    }
}

/// Validated configuration for an [`AbuseGuard`](crate::AbuseGuard).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    suspicious: SignalPolicy,
    backend_errors: SignalPolicy,
    block_duration: Duration,
    shards: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            suspicious: SignalPolicy::default(),
            backend_errors: SignalPolicy::default(),
            block_duration: DEFAULT_BLOCK_DURATION,
            shards: DEFAULT_SHARDS,
        }
    }
}

impl GuardConfig {
    /// Start from the defaults (5 hits / 60s for both signals, 300s blocks, 16 shards).
    pub fn builder() -> GuardConfigBuilder {
        GuardConfigBuilder::new()
    }

    /// Policy for the given signal.
    pub fn policy(&self, signal: Signal) -> SignalPolicy {
        match signal {
            Signal::Suspicious => self.suspicious,
            Signal::BackendError => self.backend_errors,
        }
    }

    /// Suspicious-input policy.
    pub fn suspicious(&self) -> SignalPolicy {
        self.suspicious
    }

    /// Backend-error policy.
    pub fn backend_errors(&self) -> SignalPolicy {
        self.backend_errors
    }

    /// How long a tripped key stays blocked.
    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    /// Number of shards the key map is split into.
    pub fn shards(&self) -> usize {
        self.shards
    }
}

/// Builder for [`GuardConfig`]. Validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct GuardConfigBuilder {
    suspicious: (usize, Duration),
    backend_errors: (usize, Duration),
    block_duration: Duration,
    shards: usize,
}

impl Default for GuardConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardConfigBuilder {
    /// Builder seeded with the defaults.
    pub fn new() -> Self {
        Self {
            suspicious: (DEFAULT_THRESHOLD, DEFAULT_WINDOW),
            backend_errors: (DEFAULT_THRESHOLD, DEFAULT_WINDOW),
            block_duration: DEFAULT_BLOCK_DURATION,
            shards: DEFAULT_SHARDS,
        }
    }

    /// Suspicious-input threshold and window.
    pub fn suspicious(mut self, threshold: usize, window: Duration) -> Self {
        self.suspicious = (threshold, window);
        self
    }

    /// Backend-error threshold and window.
    pub fn backend_errors(mut self, threshold: usize, window: Duration) -> Self {
        self.backend_errors = (threshold, window);
        self
    }

    /// Block duration applied on any trip.
    pub fn block_duration(mut self, duration: Duration) -> Self {
        self.block_duration = duration;
        self
    }

    /// Number of key-map shards. Must be a power of two, at least 2.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<GuardConfig, ConfigError> {
        let suspicious =
            SignalPolicy::new(Signal::Suspicious, self.suspicious.0, self.suspicious.1)?;
        let backend_errors =
            SignalPolicy::new(Signal::BackendError, self.backend_errors.0, self.backend_errors.1)?;
        if self.block_duration.is_zero() {
            return Err(ConfigError::ZeroBlockDuration);
        }
        if self.shards < 2 || !self.shards.is_power_of_two() {
            return Err(ConfigError::InvalidShards { shards: self.shards });
        }
        Ok(GuardConfig {
            suspicious,
            backend_errors,
            block_duration: self.block_duration,
            shards: self.shards,
        })
    }
}

#[cfg(feature = "json")]
pub use settings::GuardSettings;

#[cfg(feature = "json")]
mod settings {
    use super::*;
    use serde::{Deserialize, Serialize};

    /// Flat, serializable option set. Every field is optional and falls back to the
    /// library default.
    ///
    /// ```
    /// use tripwire::GuardSettings;
    ///
    /// let config = GuardSettings::from_json(r#"{ "suspicious_threshold": 3 }"#)
    ///     .and_then(|s| s.into_config())
    ///     .unwrap();
    /// assert_eq!(config.suspicious().threshold(), 3);
    /// ```
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct GuardSettings {
        /// Suspicious hits per window that trip a block.
        pub suspicious_threshold: usize,
        /// Suspicious counting window, seconds.
        pub suspicious_window_seconds: u64,
        /// Backend errors per window that trip a block.
        pub error_threshold: usize,
        /// Backend-error counting window, seconds.
        pub error_window_seconds: u64,
        /// Block duration, seconds.
        pub block_duration_seconds: u64,
        /// Key-map shards.
        pub shards: usize,
    }

    impl Default for GuardSettings {
        fn default() -> Self {
            Self {
                suspicious_threshold: DEFAULT_THRESHOLD,
                suspicious_window_seconds: DEFAULT_WINDOW.as_secs(),
                error_threshold: DEFAULT_THRESHOLD,
                error_window_seconds: DEFAULT_WINDOW.as_secs(),
                block_duration_seconds: DEFAULT_BLOCK_DURATION.as_secs(),
                shards: DEFAULT_SHARDS,
            }
        }
    }

    impl GuardSettings {
        /// Parse settings from a JSON document.
        pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
            Ok(serde_json::from_str(raw)?)
        }

        /// Validate into a [`GuardConfig`].
        pub fn into_config(self) -> Result<GuardConfig, ConfigError> {
            GuardConfig::try_from(self)
        }
    }

    impl TryFrom<GuardSettings> for GuardConfig {
        type Error = ConfigError;

        fn try_from(s: GuardSettings) -> Result<Self, Self::Error> {
            GuardConfig::builder()
                .suspicious(s.suspicious_threshold, Duration::from_secs(s.suspicious_window_seconds))
                .backend_errors(s.error_threshold, Duration::from_secs(s.error_window_seconds))
                .block_duration(Duration::from_secs(s.block_duration_seconds))
                .shards(s.shards)
                .build()
        }
    }

    impl From<&GuardConfig> for GuardSettings {
        fn from(c: &GuardConfig) -> Self {
            Self {
                suspicious_threshold: c.suspicious.threshold,
                suspicious_window_seconds: c.suspicious.window.as_secs(),
                error_threshold: c.backend_errors.threshold,
                error_window_seconds: c.backend_errors.window.as_secs(),
                block_duration_seconds: c.block_duration.as_secs(),
                shards: c.shards,
            }
        }
    }
}
