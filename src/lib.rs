#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Distributed rate limiting and admission control for async Rust: decide,
//! for every inbound unit of work, whether to allow, delay, or reject it,
//! and protect downstream resources with circuit breaking and quotas.
//!
//! ## Features
//!
//! - **Five limiting algorithms** — fixed window, sliding window log, token
//!   bucket, leaky bucket, and an adaptive wrapper driven by live load
//!   signals
//! - **Pluggable state** — in-process store for a single instance, Redis
//!   (feature `redis`) for a fleet; atomicity lives in the store, not in
//!   client-side locks
//! - **Rules and tiers** — priority-ordered route rules with segment
//!   wildcards, named per-caller limit bundles, injected bypass allow-lists
//! - **Circuit breakers** — per-instance (lock-free atomics) and
//!   store-shared, with a single-flight half-open trial
//! - **Deferred admission** — bounded priority queue with a background
//!   drain loop
//! - **Quotas** — daily/weekly/monthly ceilings with all-or-nothing
//!   multi-period consumption and exact UTC resets
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::builder(Arc::new(MemoryStore::new())).build();
//!     limiter.rules().add(
//!         RateLimitRule::builder("api-writes")
//!             .path("/api/*/items")
//!             .method("POST")
//!             .algorithm(LimitAlgorithm::TokenBucket { capacity: 10.0, refill_rate: 1.0 })
//!             .scope([ScopeDimension::User])
//!             .build()
//!             .expect("valid rule"),
//!     );
//!
//!     let ctx = RequestContext::new("POST", "/api/a/items").with_user("u1");
//!     let decision = limiter.consume(&ctx, 1.0).await.expect("store reachable");
//!     assert!(decision.allowed);
//! }
//! ```
//!
//! The limiter returns a uniform [`rate_limit::Decision`] carrying limit,
//! remaining, reset instant, and retry-after — everything an adapter needs
//! for response headers. Mapping to status codes is the adapter's job; this
//! crate is the decision engine, not the server.

pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod concurrency;
pub mod dynamic;
pub mod error;
pub mod prelude;
pub mod queue;
pub mod quota;
pub mod rate_limit;
pub mod store;

// Re-exports
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
    SharedCircuitBreaker,
};
pub use circuit_breaker_registry::{
    CircuitBreakerHandle, CircuitBreakerRegistry, InMemoryCircuitBreakerRegistry,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use concurrency::ConcurrencyLimit;
pub use dynamic::DynamicConfig;
pub use error::AdmissionError;
pub use queue::{DrainerHandle, PriorityQueue, QueueItem};
pub use quota::{PeriodUsage, QuotaDefinition, QuotaManager, QuotaPeriod};
pub use rate_limit::{
    AdaptiveTuning, AdmissionLayer, AdmissionService, BypassList, Decision, FailurePolicy,
    LimitAlgorithm, LoadSignals, PathPattern, RateLimitRule, RateLimitTier, RateLimiter,
    RateLimiterBuilder, RequestContext, RuleAction, RuleSet, ScopeDimension, TierRegistry,
};
pub use store::{MemoryStore, Store, StoreError};
#[cfg(feature = "redis")]
pub use store::RedisStore;
