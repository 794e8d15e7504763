//! Error taxonomy for admission decisions.
use crate::quota::QuotaPeriod;
use crate::store::StoreError;
use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

/// Unified error type for every admission component.
///
/// The generic parameter is the error type of a wrapped call and only appears
/// in [`AdmissionError::Inner`]; components that wrap nothing (the limiter,
/// the quota manager, the queue) use the `Infallible` default.
#[derive(Debug, Clone)]
pub enum AdmissionError<E = Infallible> {
    /// A rate limit denied the request; carries how long to wait.
    RateLimitExceeded { retry_after: Duration, reason: String },
    /// The state backend failed and the failure policy is fail-closed.
    StoreUnavailable { detail: String },
    /// The circuit breaker short-circuited the call without invoking it.
    CircuitOpen { failure_count: usize, open_for: Duration },
    /// The deferred-admission queue is at capacity.
    QueueFull { depth: usize, max: usize },
    /// A long-horizon quota would be breached; names the breached period.
    QuotaExceeded { period: QuotaPeriod, reset_at_ms: u64 },
    /// The in-flight ceiling rejected the call.
    ConcurrencyExceeded { in_flight: usize, max: usize },
    /// The wrapped call itself failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimitExceeded { retry_after, reason } => {
                write!(f, "{} (retry after {:?})", reason, retry_after)
            }
            Self::StoreUnavailable { detail } => {
                write!(f, "state store unavailable: {}", detail)
            }
            Self::CircuitOpen { failure_count, open_for } => {
                write!(
                    f,
                    "circuit breaker open ({} failures, open for {:?})",
                    failure_count, open_for
                )
            }
            Self::QueueFull { depth, max } => {
                write!(f, "admission queue full ({} queued, max {})", depth, max)
            }
            Self::QuotaExceeded { period, reset_at_ms } => {
                write!(f, "{} quota exceeded (resets at {}ms)", period, reset_at_ms)
            }
            Self::ConcurrencyExceeded { in_flight, max } => {
                write!(f, "concurrency limit reached ({} in-flight, max {})", in_flight, max)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<StoreError> for AdmissionError<E> {
    fn from(err: StoreError) -> Self {
        AdmissionError::StoreUnavailable { detail: err.to_string() }
    }
}

impl AdmissionError<Infallible> {
    /// Re-type an error that provably carries no inner error.
    ///
    /// Lets the limiter's `Infallible`-typed errors flow into contexts (the
    /// tower middleware, breaker-wrapped calls) that use a concrete inner
    /// error type.
    pub fn widen<E>(self) -> AdmissionError<E> {
        match self {
            Self::RateLimitExceeded { retry_after, reason } => {
                AdmissionError::RateLimitExceeded { retry_after, reason }
            }
            Self::StoreUnavailable { detail } => AdmissionError::StoreUnavailable { detail },
            Self::CircuitOpen { failure_count, open_for } => {
                AdmissionError::CircuitOpen { failure_count, open_for }
            }
            Self::QueueFull { depth, max } => AdmissionError::QueueFull { depth, max },
            Self::QuotaExceeded { period, reset_at_ms } => {
                AdmissionError::QuotaExceeded { period, reset_at_ms }
            }
            Self::ConcurrencyExceeded { in_flight, max } => {
                AdmissionError::ConcurrencyExceeded { in_flight, max }
            }
            Self::Inner(never) => match never {},
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if this error is a rate-limit denial.
    pub fn is_rate_limit_exceeded(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }

    /// Check if this error is an infrastructure failure of the store.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Check if this error is a breaker short-circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is a queue admission rejection.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }

    /// Check if this error is a long-horizon quota denial.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    /// Check if this error is an in-flight ceiling rejection.
    pub fn is_concurrency_exceeded(&self) -> bool {
        matches!(self, Self::ConcurrencyExceeded { .. })
    }

    /// Check if this error wraps the call's own failure.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the wrapped call's error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the wrapped call's error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// How long the caller should wait, for denials that carry a wait.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Breached period for quota denials.
    pub fn breached_period(&self) -> Option<QuotaPeriod> {
        match self {
            Self::QuotaExceeded { period, .. } => Some(*period),
            _ => None,
        }
    }
}
