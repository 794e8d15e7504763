//! Convenience re-exports for the common path.

pub use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use crate::clock::{Clock, SystemClock};
pub use crate::error::AdmissionError;
pub use crate::queue::PriorityQueue;
pub use crate::quota::{QuotaDefinition, QuotaManager, QuotaPeriod};
pub use crate::rate_limit::{
    Decision, FailurePolicy, LimitAlgorithm, RateLimitRule, RateLimitTier, RateLimiter,
    RequestContext, ScopeDimension,
};
pub use crate::store::{MemoryStore, Store};
