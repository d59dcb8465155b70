//! Error returned by guarded services
use std::fmt;
use std::time::Duration;

/// Error type for services wrapped in a [`GuardLayer`](crate::GuardLayer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardError<E> {
    /// The request's key is blocked; the inner service was not called.
    Blocked {
        /// Time until the block lifts.
        retry_after: Duration,
    },
    /// The inner service failed. The failure was recorded as a backend error.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked { retry_after } => {
                write!(f, "request blocked (retry after {:?})", retry_after)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Blocked { .. } => None,
        }
    }
}

impl<E> GuardError<E> {
    /// Check if the request was rejected by the guard
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
    /// Remaining block time, if blocked.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Blocked { retry_after } => Some(*retry_after),
            Self::Inner(_) => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Blocked { .. } => None,
        }
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Blocked { .. } => None,
        }
    }
}
