//! Pluggable state backends.
//!
//! Every algorithm, the shared circuit breaker, and the quota manager speak
//! to state through the [`Store`] trait. Correctness under concurrent
//! callers is a property of the specialized operations below — each one runs
//! as a single atomic step against the backend (a mutex-guarded critical
//! section in [`MemoryStore`], a Lua script in the Redis backend) — never of
//! client-side locking.
//!
//! Backends:
//! - [`memory::MemoryStore`]: in-process, for single-instance deployments.
//! - `redis::RedisStore` (cargo feature `redis`): network-shared, for
//!   multi-instance deployments; one round-trip per specialized op.

use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis::RedisStore;

/// Errors from the state backend. Infrastructure failures are deliberately
/// distinct from "limit exceeded": the orchestrator resolves them through the
/// fail-open/fail-closed policy instead of treating them as denials.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backend did not answer within the bounded per-op timeout.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    /// The key holds a value of a different shape than the operation expects.
    #[error("value at '{key}' is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },
    /// A persisted record failed to encode or decode.
    #[error("bad stored record: {0}")]
    Codec(String),
}

/// Result of [`Store::sliding_window_add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Cardinality of the window after insertion and pruning.
    pub count: u64,
    /// Oldest surviving timestamp, if any; lets callers compute an exact
    /// retry-after instead of a whole-window upper bound.
    pub oldest_ms: Option<u64>,
}

/// Result of [`Store::token_bucket_consume`] and
/// [`Store::leaky_bucket_consume`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// Tokens remaining (token bucket) or current water level (leaky bucket)
    /// after the operation.
    pub level: f64,
}

/// One counter in a [`Store::checked_multi_increment`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterCheck {
    pub key: String,
    pub limit: u64,
    /// TTL applied when the counter is created by this operation.
    pub ttl: Duration,
}

/// Result of [`Store::checked_multi_increment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiIncrementOutcome {
    /// Every counter had headroom; all were incremented. Carries the new
    /// values in batch order.
    Applied(Vec<u64>),
    /// A counter would have been pushed past its limit; nothing was mutated.
    WouldExceed { index: usize, current: u64 },
}

/// Atomic state backend.
///
/// Generic operations are ordinary key-value primitives. The specialized
/// operations are the atomicity contract the algorithms depend on: each is a
/// read-modify-write that concurrent callers on the same key observe as a
/// single step, linearizable per key (no ordering across distinct keys).
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Set a TTL on an existing key; returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining TTL, `None` when the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Atomically add `by` and return the new value. `ttl` applies only when
    /// this call creates the key, so a window counter expires relative to its
    /// first hit.
    async fn increment(&self, key: &str, by: i64, ttl: Option<Duration>)
        -> Result<i64, StoreError>;

    async fn decrement(&self, key: &str, by: i64) -> Result<i64, StoreError>;

    /// Acquire a single-flight lease: set-if-absent with a TTL. Returns true
    /// when this caller now holds the lease.
    async fn acquire_lease(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn release_lease(&self, key: &str) -> Result<(), StoreError>;

    /// Insert `now_ms` into the timestamp log at `key`, prune entries older
    /// than `now_ms - window_ms`, refresh the key TTL to `2×window_ms`, and
    /// report the surviving cardinality.
    async fn sliding_window_add(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<WindowOutcome, StoreError>;

    /// Refill the bucket at `refill_rate` tokens/second up to `capacity`,
    /// then take `cost` tokens if available.
    async fn token_bucket_consume(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        cost: f64,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError>;

    /// Drain the bucket at `leak_rate` units/second toward zero, then add
    /// `cost` units if that stays within `capacity`.
    async fn leaky_bucket_consume(
        &self,
        key: &str,
        capacity: f64,
        leak_rate: f64,
        cost: f64,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError>;

    /// All-or-nothing increment across several counters: every counter is
    /// incremented by `amount` only if none would exceed its limit.
    async fn checked_multi_increment(
        &self,
        checks: &[CounterCheck],
        amount: u64,
    ) -> Result<MultiIncrementOutcome, StoreError>;
}

/// TTL for a bucket key: time for the state to become irrelevant (a full
/// drain or refill), plus a grace margin.
pub(crate) fn bucket_ttl(capacity: f64, rate_per_sec: f64) -> Duration {
    const GRACE: Duration = Duration::from_secs(60);
    if rate_per_sec <= 0.0 {
        return GRACE;
    }
    Duration::from_secs_f64(capacity / rate_per_sec) + GRACE
}
