//! Circuit breakers: per-instance (lock-free atomics) and store-shared.
//!
//! State machine: Closed → (threshold consecutive failures) → Open →
//! (reset timeout elapses) → HalfOpen → one trial call → Closed on success,
//! Open again on failure. While HalfOpen, every caller other than the single
//! permitted trial is short-circuited. An optional backoff multiplier
//! stretches the reset timeout on consecutive reopens.
//!
//! `execute` keeps the two failure shapes distinct: a short-circuit is
//! [`AdmissionError::CircuitOpen`] and means the wrapped call never ran; the
//! call's own failure propagates as [`AdmissionError::Inner`] after it is
//! recorded. Which errors count toward the threshold is decided by a
//! configurable predicate, so expected failures (validation, not-found) can
//! be excluded; an excluded error is treated as a successful outcome for
//! breaker accounting.

use crate::clock::{Clock, SystemClock};
use crate::error::AdmissionError;
use crate::store::{Store, StoreError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode: every call is forwarded.
    Closed,
    /// Short-circuits every call until the reset timeout elapses.
    Open,
    /// One trial call probes recovery; everyone else is short-circuited.
    HalfOpen,
}

impl CircuitState {
    #[allow(dead_code)]
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(value: u8) -> CircuitState {
        match value {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    InvalidFailureThreshold { provided: usize },
    /// Reset timeout must be > 0.
    InvalidResetTimeout(Duration),
    /// Backoff multiplier must be >= 1 and the cap must be >= the base.
    InvalidBackoff { multiplier: f64 },
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::InvalidFailureThreshold { provided } => {
                write!(f, "failure_threshold must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidResetTimeout(timeout) => {
                write!(f, "reset_timeout must be > 0 (got {:?})", timeout)
            }
            CircuitBreakerError::InvalidBackoff { multiplier } => {
                write!(f, "backoff multiplier must be >= 1 with cap >= base (got {})", multiplier)
            }
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

/// Validated breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    reset_timeout: Duration,
    backoff_multiplier: f64,
    max_reset_timeout: Duration,
}

impl CircuitBreakerConfig {
    pub fn new(
        failure_threshold: usize,
        reset_timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if reset_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidResetTimeout(reset_timeout));
        }
        Ok(Self {
            failure_threshold,
            reset_timeout,
            backoff_multiplier: 1.0,
            max_reset_timeout: reset_timeout,
        })
    }

    /// Stretch the reset timeout by `multiplier` on each consecutive reopen,
    /// up to `max`.
    pub fn with_backoff(
        mut self,
        multiplier: f64,
        max: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        if !multiplier.is_finite() || multiplier < 1.0 || max < self.reset_timeout {
            return Err(CircuitBreakerError::InvalidBackoff { multiplier });
        }
        self.backoff_multiplier = multiplier;
        self.max_reset_timeout = max;
        Ok(self)
    }

    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    /// Reset timeout after `streak` consecutive opens.
    fn timeout_for_streak(&self, streak: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(streak.saturating_sub(1).min(64) as i32);
        let secs =
            (self.reset_timeout.as_secs_f64() * factor).min(self.max_reset_timeout.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Shared atomic state behind a per-instance breaker; also what registry
/// handles point at.
#[derive(Debug)]
pub(crate) struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_ms: AtomicU64,
    open_streak: AtomicU32,
    trial_in_flight: AtomicUsize,
}

impl CircuitBreakerState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            opened_at_ms: AtomicU64::new(0),
            open_streak: AtomicU32::new(0),
            trial_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn current_state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Force the breaker back to Closed and clear every counter.
    pub(crate) fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.opened_at_ms.store(0, Ordering::Release);
        self.open_streak.store(0, Ordering::Release);
        self.trial_in_flight.store(0, Ordering::Release);
    }
}

/// Decides whether a wrapped call's error counts toward the threshold.
pub type FailurePredicate =
    Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

/// Per-instance circuit breaker. Clones share the same underlying state, so
/// every handle observes and affects the same circuit lifecycle.
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    counts_failure: FailurePredicate,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state.current_state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(
        failure_threshold: usize,
        reset_timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        Ok(Self::with_config(CircuitBreakerConfig::new(failure_threshold, reset_timeout)?))
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState::new()),
            config,
            clock: Arc::new(SystemClock),
            counts_failure: Arc::new(|_| true),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Exclude some errors from tripping the breaker.
    pub fn with_failure_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.counts_failure = Arc::new(predicate);
        self
    }

    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    /// Administrative reset back to Closed.
    pub fn force_reset(&self) {
        self.state.reset();
        tracing::info!("circuit breaker force-reset → closed");
    }

    /// Handle for the registry (inspection and forced reset by name).
    pub fn handle(&self) -> crate::circuit_breaker_registry::CircuitBreakerHandle {
        crate::circuit_breaker_registry::CircuitBreakerHandle { state: self.state.clone() }
    }

    /// Run `operation` under breaker protection.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, AdmissionError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        struct TrialGuard<'a> {
            state: &'a CircuitBreakerState,
            armed: bool,
        }
        impl Drop for TrialGuard<'_> {
            fn drop(&mut self) {
                if self.armed {
                    self.state.trial_in_flight.fetch_sub(1, Ordering::Release);
                }
            }
        }
        let mut guard: Option<TrialGuard<'_>> = None;

        loop {
            match self.state.current_state() {
                CircuitState::Open => {
                    let opened_at = self.state.opened_at_ms.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    let timeout =
                        self.config.timeout_for_streak(self.state.open_streak.load(Ordering::Acquire));

                    if elapsed < timeout.as_millis() as u64 {
                        return Err(self.short_circuit(elapsed));
                    }
                    match self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // Won the transition: this caller is the trial.
                            tracing::info!("circuit breaker → half-open");
                            self.state.trial_in_flight.store(1, Ordering::Release);
                            guard = Some(TrialGuard { state: &self.state, armed: true });
                            break;
                        }
                        Err(STATE_CLOSED) => break,
                        // Someone else went half-open first; re-evaluate.
                        Err(_) => continue,
                    }
                }
                CircuitState::HalfOpen => {
                    // Exactly one trial at a time; everyone else bounces.
                    if self.state.trial_in_flight.fetch_add(1, Ordering::AcqRel) >= 1 {
                        self.state.trial_in_flight.fetch_sub(1, Ordering::Release);
                        let opened_at = self.state.opened_at_ms.load(Ordering::Acquire);
                        let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                        return Err(self.short_circuit(elapsed));
                    }
                    guard = Some(TrialGuard { state: &self.state, armed: true });
                    tracing::debug!("circuit breaker: half-open trial call");
                    break;
                }
                CircuitState::Closed => break,
            }
        }

        let result = operation().await;
        drop(guard);

        match &result {
            Ok(_) => self.on_success(),
            Err(e) => {
                if (self.counts_failure)(e) {
                    self.on_failure();
                } else {
                    self.on_success();
                }
            }
        }

        result.map_err(AdmissionError::Inner)
    }

    fn short_circuit<E>(&self, elapsed_ms: u64) -> AdmissionError<E> {
        AdmissionError::CircuitOpen {
            failure_count: self.state.failure_count.load(Ordering::Acquire),
            open_for: Duration::from_millis(elapsed_ms),
        }
    }

    /// Any success (or excluded error) in Closed resets the consecutive
    /// count: only an unbroken streak of counted failures trips the breaker.
    fn on_success(&self) {
        match self.state.current_state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_ms.store(0, Ordering::Release);
                    self.state.open_streak.store(0, Ordering::Release);
                    self.state.trial_in_flight.store(0, Ordering::Release);
                    tracing::info!("circuit breaker → closed");
                }
            }
            CircuitState::Closed => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        match self.state.current_state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.opened_at_ms.store(self.clock.now_millis(), Ordering::Release);
                    self.state.open_streak.fetch_add(1, Ordering::AcqRel);
                    self.state.trial_in_flight.store(0, Ordering::Release);
                    tracing::warn!(failures, "circuit breaker: trial failed → open");
                }
            }
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.state.opened_at_ms.store(self.clock.now_millis(), Ordering::Release);
                    self.state.open_streak.store(1, Ordering::Release);
                    self.state.trial_in_flight.store(0, Ordering::Release);
                    tracing::error!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker → open"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RecordState {
    Closed,
    Open,
    HalfOpen,
}

/// Persisted form of a shared breaker: one JSON record with its own TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerRecord {
    state: RecordState,
    failure_count: u64,
    opened_at_ms: u64,
    open_streak: u32,
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self { state: RecordState::Closed, failure_count: 0, opened_at_ms: 0, open_streak: 0 }
    }
}

/// Circuit breaker shared across instances through the [`Store`].
///
/// State lives in a record under `{prefix}:breaker:{name}`; consecutive
/// failures are counted with atomic increments; the half-open single-flight
/// gate is a store lease, so across a whole fleet only the lease holder runs
/// the trial call. The record carries its own TTL, so an abandoned breaker
/// eventually reads as Closed again.
pub struct SharedCircuitBreaker {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
    counts_failure: FailurePredicate,
    name: String,
    prefix: String,
    record_ttl: Duration,
}

impl std::fmt::Debug for SharedCircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SharedCircuitBreaker {
    pub fn new(
        store: Arc<dyn Store>,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            counts_failure: Arc::new(|_| true),
            name: name.into(),
            prefix: "floodgate".to_string(),
            record_ttl: Duration::from_secs(3_600),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// TTL written on the persisted record and failure counter.
    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = ttl;
        self
    }

    pub fn with_failure_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.counts_failure = Arc::new(predicate);
        self
    }

    fn record_key(&self) -> String {
        format!("{}:breaker:{}", self.prefix, self.name)
    }

    fn failures_key(&self) -> String {
        format!("{}:breaker:{}:failures", self.prefix, self.name)
    }

    fn trial_key(&self) -> String {
        format!("{}:breaker:{}:trial", self.prefix, self.name)
    }

    async fn load(&self) -> Result<BreakerRecord, StoreError> {
        match self.store.get(&self.record_key()).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| StoreError::Codec(format!("breaker record: {}", e))),
            None => Ok(BreakerRecord::default()),
        }
    }

    async fn save(&self, record: &BreakerRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record)
            .map_err(|e| StoreError::Codec(format!("breaker record: {}", e)))?;
        self.store.set(&self.record_key(), &raw, Some(self.record_ttl)).await
    }

    /// Current state as persisted.
    pub async fn state(&self) -> Result<CircuitState, AdmissionError> {
        let record = self.load().await?;
        Ok(match record.state {
            RecordState::Closed => CircuitState::Closed,
            RecordState::Open => CircuitState::Open,
            RecordState::HalfOpen => CircuitState::HalfOpen,
        })
    }

    /// Administrative reset: drops the record, the failure counter, and any
    /// trial lease.
    pub async fn force_reset(&self) -> Result<(), AdmissionError> {
        self.store.delete(&self.record_key()).await?;
        self.store.delete(&self.failures_key()).await?;
        self.store.release_lease(&self.trial_key()).await?;
        tracing::info!(breaker = %self.name, "shared circuit breaker force-reset → closed");
        Ok(())
    }

    /// Run `operation` under breaker protection; the breaker state is shared
    /// with every other instance using the same store and name.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, AdmissionError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let now_ms = self.clock.now_millis();
        let record = self.load().await.map_err(AdmissionError::from)?;

        match record.state {
            RecordState::Closed => self.run_closed(operation, &record).await,
            RecordState::Open => {
                let elapsed = now_ms.saturating_sub(record.opened_at_ms);
                let timeout = self.config.timeout_for_streak(record.open_streak.max(1));
                if elapsed < timeout.as_millis() as u64 {
                    return Err(self.short_circuit(&record, elapsed));
                }
                self.try_trial(operation, &record, now_ms, elapsed).await
            }
            // A trial is (or was) in flight elsewhere. If its lease expired —
            // holder crashed mid-trial — take the trial over.
            RecordState::HalfOpen => {
                let elapsed = now_ms.saturating_sub(record.opened_at_ms);
                self.try_trial(operation, &record, now_ms, elapsed).await
            }
        }
    }

    async fn run_closed<T, E, Fut, Op>(
        &self,
        operation: Op,
        record: &BreakerRecord,
    ) -> Result<T, AdmissionError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let result = operation().await;
        match &result {
            Err(e) if (self.counts_failure)(e) => {
                let failures = self
                    .store
                    .increment(&self.failures_key(), 1, Some(self.record_ttl))
                    .await?
                    .max(0) as u64;
                if failures >= self.config.failure_threshold as u64 {
                    let opened = BreakerRecord {
                        state: RecordState::Open,
                        failure_count: failures,
                        opened_at_ms: self.clock.now_millis(),
                        open_streak: record.open_streak + 1,
                    };
                    self.save(&opened).await?;
                    tracing::error!(
                        breaker = %self.name,
                        failures,
                        "shared circuit breaker → open"
                    );
                }
            }
            // Consecutive counting: any non-counted outcome clears the run.
            _ => {
                self.store.delete(&self.failures_key()).await?;
            }
        }
        result.map_err(AdmissionError::Inner)
    }

    async fn try_trial<T, E, Fut, Op>(
        &self,
        operation: Op,
        record: &BreakerRecord,
        now_ms: u64,
        elapsed_ms: u64,
    ) -> Result<T, AdmissionError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        // The lease is the cross-instance single-flight gate; its TTL bounds
        // how long a crashed holder can block the next trial.
        let acquired = self
            .store
            .acquire_lease(&self.trial_key(), self.config.reset_timeout)
            .await?;
        if !acquired {
            return Err(self.short_circuit(record, elapsed_ms));
        }

        let half_open = BreakerRecord { state: RecordState::HalfOpen, ..record.clone() };
        self.save(&half_open).await?;
        tracing::info!(breaker = %self.name, "shared circuit breaker → half-open");

        let result = operation().await;
        let trial_succeeded = match &result {
            Ok(_) => true,
            Err(e) => !(self.counts_failure)(e),
        };

        if trial_succeeded {
            self.save(&BreakerRecord::default()).await?;
            self.store.delete(&self.failures_key()).await?;
            tracing::info!(breaker = %self.name, "shared circuit breaker → closed");
        } else {
            let reopened = BreakerRecord {
                state: RecordState::Open,
                failure_count: record.failure_count + 1,
                opened_at_ms: now_ms,
                open_streak: record.open_streak + 1,
            };
            self.save(&reopened).await?;
            tracing::warn!(breaker = %self.name, "shared circuit breaker: trial failed → open");
        }
        self.store.release_lease(&self.trial_key()).await?;

        result.map_err(AdmissionError::Inner)
    }

    fn short_circuit<E>(&self, record: &BreakerRecord, elapsed_ms: u64) -> AdmissionError<E> {
        AdmissionError::CircuitOpen {
            failure_count: record.failure_count as usize,
            open_for: Duration::from_millis(elapsed_ms),
        }
    }
}
