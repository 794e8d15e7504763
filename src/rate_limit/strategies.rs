//! The limiting algorithms.
//!
//! Each variant of [`LimitAlgorithm`] is a pure decision function over store
//! state plus a clock instant: all mutation goes through one specialized
//! atomic store op, so concurrent callers anywhere in the fleet agree on the
//! outcome. The enum is serde-taggable, which lets rules and tiers be loaded
//! from configuration.

use crate::rate_limit::Decision;
use crate::store::{Store, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Live signals the adaptive wrapper reacts to. Published by an external
/// feedback loop through a [`crate::DynamicConfig`] handle; all values are
/// fractions in `[0, 1]` except the latency, which is milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoadSignals {
    pub load: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
}

/// Weights and bounds for the adaptive scaling formula. These are heuristic
/// defaults, not law: tune them per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveTuning {
    pub load_weight: f64,
    pub error_weight: f64,
    /// The factor never drops below this, so a struggling server still
    /// admits a trickle instead of hard-flatlining.
    pub floor: f64,
    pub latency_threshold_ms: f64,
    pub latency_divisor: f64,
    pub latency_penalty_cap: f64,
}

impl Default for AdaptiveTuning {
    fn default() -> Self {
        Self {
            load_weight: 0.6,
            error_weight: 0.3,
            floor: 0.1,
            latency_threshold_ms: 100.0,
            latency_divisor: 1_000.0,
            latency_penalty_cap: 0.3,
        }
    }
}

impl AdaptiveTuning {
    /// Multiplier applied to the wrapped algorithm's effective limit.
    pub fn factor(&self, signals: &LoadSignals) -> f64 {
        let latency_penalty = if signals.avg_latency_ms > self.latency_threshold_ms {
            ((signals.avg_latency_ms - self.latency_threshold_ms) / self.latency_divisor)
                .min(self.latency_penalty_cap)
        } else {
            0.0
        };
        (1.0 - self.load_weight * signals.load
            - self.error_weight * signals.error_rate
            - latency_penalty)
            .clamp(self.floor, 1.0)
    }
}

/// Errors from validating algorithm parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum AlgorithmError {
    ZeroLimit,
    ZeroWindow,
    NonPositiveCapacity(f64),
    NonPositiveRate(f64),
    InvalidTuning(&'static str),
}

impl fmt::Display for AlgorithmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmError::ZeroLimit => write!(f, "limit must be > 0"),
            AlgorithmError::ZeroWindow => write!(f, "window must be > 0"),
            AlgorithmError::NonPositiveCapacity(c) => {
                write!(f, "capacity must be > 0 (got {})", c)
            }
            AlgorithmError::NonPositiveRate(r) => write!(f, "rate must be > 0 (got {})", r),
            AlgorithmError::InvalidTuning(what) => write!(f, "invalid adaptive tuning: {}", what),
        }
    }
}

impl std::error::Error for AlgorithmError {}

/// A rate-limiting algorithm plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LimitAlgorithm {
    /// Counter per `window`-sized slot of the timeline. Cheapest option, but
    /// up to `2×limit` requests can land across one window boundary; that is
    /// accepted behavior of this algorithm, not a defect.
    FixedWindow {
        limit: u64,
        #[serde(with = "humantime_serde")]
        window: Duration,
    },
    /// Exact rolling count over a timestamp log. Memory per key grows with
    /// `limit`, so it is unsuitable for very large limits; denied attempts
    /// also occupy the window.
    SlidingWindow {
        limit: u64,
        #[serde(with = "humantime_serde")]
        window: Duration,
    },
    /// Bursts up to `capacity`, long-run average `refill_rate`/second.
    TokenBucket { capacity: f64, refill_rate: f64 },
    /// Smooths the admission rate itself: at most `capacity` outstanding
    /// units, draining at `leak_rate`/second.
    LeakyBucket { capacity: f64, leak_rate: f64 },
    /// Wraps any algorithm, scaling its effective limit by a factor derived
    /// from live load signals.
    Adaptive {
        inner: Box<LimitAlgorithm>,
        #[serde(default)]
        tuning: AdaptiveTuning,
    },
}

fn scaled_limit(limit: u64, factor: f64) -> u64 {
    // The epsilon keeps float noise in the factor from flooring 7.0 to 6.
    ((((limit as f64) * factor) + 1e-9).floor() as u64).max(1)
}

fn secs_to_millis(secs: f64) -> u64 {
    (secs.max(0.0) * 1_000.0).round() as u64
}

/// Duration from a computed wait, saturating instead of panicking when a
/// degenerate rate pushes the math to infinity.
fn wait_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

impl LimitAlgorithm {
    /// Validate parameters; called by the rule builder before a rule can be
    /// installed.
    pub fn validate(&self) -> Result<(), AlgorithmError> {
        match self {
            LimitAlgorithm::FixedWindow { limit, window }
            | LimitAlgorithm::SlidingWindow { limit, window } => {
                if *limit == 0 {
                    return Err(AlgorithmError::ZeroLimit);
                }
                if window.is_zero() {
                    return Err(AlgorithmError::ZeroWindow);
                }
                Ok(())
            }
            LimitAlgorithm::TokenBucket { capacity, refill_rate } => {
                if *capacity <= 0.0 {
                    return Err(AlgorithmError::NonPositiveCapacity(*capacity));
                }
                if *refill_rate <= 0.0 {
                    return Err(AlgorithmError::NonPositiveRate(*refill_rate));
                }
                Ok(())
            }
            LimitAlgorithm::LeakyBucket { capacity, leak_rate } => {
                if *capacity <= 0.0 {
                    return Err(AlgorithmError::NonPositiveCapacity(*capacity));
                }
                if *leak_rate <= 0.0 {
                    return Err(AlgorithmError::NonPositiveRate(*leak_rate));
                }
                Ok(())
            }
            LimitAlgorithm::Adaptive { inner, tuning } => {
                if tuning.floor <= 0.0 || tuning.floor > 1.0 {
                    return Err(AlgorithmError::InvalidTuning("floor must be in (0, 1]"));
                }
                if tuning.load_weight < 0.0 || tuning.error_weight < 0.0 {
                    return Err(AlgorithmError::InvalidTuning("weights must be >= 0"));
                }
                if tuning.latency_divisor <= 0.0 {
                    return Err(AlgorithmError::InvalidTuning("latency divisor must be > 0"));
                }
                inner.validate()
            }
        }
    }

    /// Run one consume against the store. `key` is the composite key; the
    /// algorithm owns the `{prefix}:{kind}:` namespace layout around it.
    pub async fn consume(
        &self,
        store: &dyn Store,
        prefix: &str,
        key: &str,
        cost: f64,
        now_ms: u64,
        signals: &LoadSignals,
    ) -> Result<Decision, StoreError> {
        let mut algorithm = self;
        let mut factor = 1.0;
        while let LimitAlgorithm::Adaptive { inner, tuning } = algorithm {
            factor *= tuning.factor(signals);
            algorithm = inner.as_ref();
        }
        algorithm.consume_scaled(store, prefix, key, cost, now_ms, factor).await
    }

    async fn consume_scaled(
        &self,
        store: &dyn Store,
        prefix: &str,
        key: &str,
        cost: f64,
        now_ms: u64,
        factor: f64,
    ) -> Result<Decision, StoreError> {
        match self {
            LimitAlgorithm::FixedWindow { limit, window } => {
                let window_ms = (window.as_millis() as u64).max(1);
                let limit = scaled_limit(*limit, factor);
                let index = now_ms / window_ms;
                let counter_key = format!("{}:fixed:{}:{}", prefix, key, index);
                let step = (cost.ceil() as i64).max(1);
                let count = store.increment(&counter_key, step, Some(*window)).await?.max(0) as u64;
                let reset_at_ms = (index + 1) * window_ms;
                if count <= limit {
                    Ok(Decision::allow(limit, limit - count, reset_at_ms))
                } else {
                    Ok(Decision::deny(
                        limit,
                        reset_at_ms,
                        Duration::from_millis(reset_at_ms.saturating_sub(now_ms)),
                        "fixed window limit exceeded",
                    ))
                }
            }
            LimitAlgorithm::SlidingWindow { limit, window } => {
                let window_ms = (window.as_millis() as u64).max(1);
                let limit = scaled_limit(*limit, factor);
                let window_key = format!("{}:window:{}", prefix, key);
                let outcome = store.sliding_window_add(&window_key, now_ms, window_ms).await?;
                let reset_at_ms = outcome.oldest_ms.unwrap_or(now_ms) + window_ms;
                if outcome.count <= limit {
                    Ok(Decision::allow(limit, limit - outcome.count, reset_at_ms))
                } else {
                    Ok(Decision::deny(
                        limit,
                        reset_at_ms,
                        Duration::from_millis(reset_at_ms.saturating_sub(now_ms)),
                        "sliding window limit exceeded",
                    ))
                }
            }
            LimitAlgorithm::TokenBucket { capacity, refill_rate } => {
                let capacity = capacity * factor;
                let bucket_key = format!("{}:bucket:{}", prefix, key);
                let outcome = store
                    .token_bucket_consume(&bucket_key, capacity, *refill_rate, cost, now_ms)
                    .await?;
                let limit = capacity.floor() as u64;
                let reset_at_ms =
                    now_ms.saturating_add(secs_to_millis((capacity - outcome.level) / refill_rate));
                if outcome.allowed {
                    Ok(Decision::allow(limit, outcome.level.floor() as u64, reset_at_ms))
                } else {
                    let deficit = (cost - outcome.level).max(0.0);
                    Ok(Decision::deny(
                        limit,
                        reset_at_ms,
                        wait_duration(deficit / refill_rate),
                        "token bucket exhausted",
                    ))
                }
            }
            LimitAlgorithm::LeakyBucket { capacity, leak_rate } => {
                let capacity = capacity * factor;
                let bucket_key = format!("{}:bucket:{}", prefix, key);
                let outcome = store
                    .leaky_bucket_consume(&bucket_key, capacity, *leak_rate, cost, now_ms)
                    .await?;
                let limit = capacity.floor() as u64;
                let reset_at_ms =
                    now_ms.saturating_add(secs_to_millis(outcome.level / leak_rate));
                if outcome.allowed {
                    Ok(Decision::allow(
                        limit,
                        (capacity - outcome.level).floor().max(0.0) as u64,
                        reset_at_ms,
                    ))
                } else {
                    let overflow = (outcome.level + cost - capacity).max(0.0);
                    Ok(Decision::deny(
                        limit,
                        reset_at_ms,
                        wait_duration(overflow / leak_rate),
                        "leaky bucket full",
                    ))
                }
            }
            LimitAlgorithm::Adaptive { .. } => {
                unreachable!("adaptive layers are unwrapped before dispatch")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    const NO_SIGNALS: LoadSignals = LoadSignals { load: 0.0, error_rate: 0.0, avg_latency_ms: 0.0 };

    fn harness() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::starting_at(1_700_000_000_000);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    async fn run(
        algorithm: &LimitAlgorithm,
        store: &MemoryStore,
        clock: &ManualClock,
    ) -> Decision {
        algorithm
            .consume(store, "fg", "k", 1.0, clock.now_millis(), &NO_SIGNALS)
            .await
            .expect("store is in-process")
    }

    #[tokio::test]
    async fn fixed_window_counts_against_the_slot() {
        let (store, clock) = harness();
        let algorithm =
            LimitAlgorithm::FixedWindow { limit: 3, window: Duration::from_secs(60) };
        for _ in 0..3 {
            assert!(run(&algorithm, &store, &clock).await.allowed);
        }
        let denied = run(&algorithm, &store, &clock).await;
        assert!(!denied.allowed);
        assert!(denied.retry_after.is_some());
        assert_eq!(denied.remaining, 0);
    }

    #[tokio::test]
    async fn fixed_window_boundary_admits_up_to_double() {
        // Documented behavior: a burst straddling one boundary can pass
        // 2×limit requests inside a window-length interval.
        let (store, clock) = harness();
        let window = Duration::from_secs(10);
        let algorithm = LimitAlgorithm::FixedWindow { limit: 5, window };

        // Land just before the boundary of the current slot.
        let window_ms = 10_000;
        let to_boundary = window_ms - (clock.now_millis() % window_ms);
        clock.advance(to_boundary - 1);

        let mut admitted = 0;
        for _ in 0..5 {
            if run(&algorithm, &store, &clock).await.allowed {
                admitted += 1;
            }
        }
        clock.advance(2); // cross into the next slot
        for _ in 0..5 {
            if run(&algorithm, &store, &clock).await.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10, "2×limit across the boundary is accepted behavior");
    }

    #[tokio::test]
    async fn sliding_window_never_exceeds_limit_in_any_window() {
        let (store, clock) = harness();
        let algorithm =
            LimitAlgorithm::SlidingWindow { limit: 5, window: Duration::from_secs(10) };

        // 5 admissions spread over 5 seconds, then denials until the oldest
        // entries age out.
        for _ in 0..5 {
            assert!(run(&algorithm, &store, &clock).await.allowed);
            clock.advance(1_000);
        }
        let denied = run(&algorithm, &store, &clock).await;
        assert!(!denied.allowed);

        // The denial occupies a log slot too: at t=11s five entries are
        // still inside the window, so the request is denied again.
        clock.advance(6_000);
        assert!(!run(&algorithm, &store, &clock).await.allowed);

        // By t=12.5s only three entries survive and admission resumes.
        clock.advance(1_500);
        let decision = run(&algorithm, &store, &clock).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn sliding_window_denial_reports_exact_wait() {
        let (store, clock) = harness();
        let algorithm =
            LimitAlgorithm::SlidingWindow { limit: 2, window: Duration::from_secs(10) };
        assert!(run(&algorithm, &store, &clock).await.allowed);
        clock.advance(4_000);
        assert!(run(&algorithm, &store, &clock).await.allowed);
        clock.advance(1_000);
        let denied = run(&algorithm, &store, &clock).await;
        assert!(!denied.allowed);
        // Oldest entry is 5s old; it leaves the window 5s from now.
        assert_eq!(denied.retry_after, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn token_bucket_scenario_ten_at_once_then_refill() {
        let (store, clock) = harness();
        let algorithm = LimitAlgorithm::TokenBucket { capacity: 10.0, refill_rate: 1.0 };

        for _ in 0..10 {
            assert!(run(&algorithm, &store, &clock).await.allowed);
        }
        let eleventh = run(&algorithm, &store, &clock).await;
        assert!(!eleventh.allowed);
        assert_eq!(eleventh.retry_after_secs(), Some(1));

        clock.advance(5_000);
        let mut admitted = 0;
        for _ in 0..10 {
            if run(&algorithm, &store, &clock).await.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5, "exactly refill_rate × 5s tokens accrued");
    }

    #[tokio::test]
    async fn token_bucket_bounds_admissions_over_any_interval() {
        let (store, clock) = harness();
        let capacity = 4.0;
        let rate = 2.0;
        let algorithm = LimitAlgorithm::TokenBucket { capacity, refill_rate: rate };

        let interval_secs = 3_u64;
        let mut admitted = 0_u64;
        for _ in 0..(interval_secs * 10) {
            if run(&algorithm, &store, &clock).await.allowed {
                admitted += 1;
            }
            clock.advance(100);
        }
        let bound = capacity + rate * interval_secs as f64;
        assert!(
            (admitted as f64) <= bound,
            "admitted {} exceeds C + R×Δt = {}",
            admitted,
            bound
        );
    }

    #[tokio::test]
    async fn leaky_bucket_drains_to_empty() {
        let (store, clock) = harness();
        let algorithm = LimitAlgorithm::LeakyBucket { capacity: 4.0, leak_rate: 2.0 };

        for _ in 0..4 {
            assert!(run(&algorithm, &store, &clock).await.allowed);
        }
        let denied = run(&algorithm, &store, &clock).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs_f64(0.5)));

        // capacity/leak_rate = 2s to fully drain.
        clock.advance(2_000);
        let decision = run(&algorithm, &store, &clock).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);
    }

    #[tokio::test]
    async fn adaptive_with_quiet_signals_changes_nothing() {
        let (store, clock) = harness();
        let algorithm = LimitAlgorithm::Adaptive {
            inner: Box::new(LimitAlgorithm::FixedWindow {
                limit: 4,
                window: Duration::from_secs(60),
            }),
            tuning: AdaptiveTuning::default(),
        };
        let decision = run(&algorithm, &store, &clock).await;
        assert_eq!(decision.limit, 4);
    }

    #[tokio::test]
    async fn adaptive_scales_limit_under_stress() {
        let (store, clock) = harness();
        let algorithm = LimitAlgorithm::Adaptive {
            inner: Box::new(LimitAlgorithm::FixedWindow {
                limit: 10,
                window: Duration::from_secs(60),
            }),
            tuning: AdaptiveTuning::default(),
        };
        let signals = LoadSignals { load: 0.5, error_rate: 0.0, avg_latency_ms: 0.0 };
        let decision = algorithm
            .consume(&store, "fg", "k", 1.0, clock.now_millis(), &signals)
            .await
            .expect("store is in-process");
        // factor = 1 - 0.6×0.5 = 0.7 → effective limit 7.
        assert_eq!(decision.limit, 7);
    }

    #[test]
    fn adaptive_factor_honors_floor_and_latency_cap() {
        let tuning = AdaptiveTuning::default();
        let crushed = LoadSignals { load: 1.0, error_rate: 1.0, avg_latency_ms: 5_000.0 };
        assert_eq!(tuning.factor(&crushed), 0.1);

        let slow = LoadSignals { load: 0.0, error_rate: 0.0, avg_latency_ms: 1_000.0 };
        // Penalty (900/1000 = 0.9) is capped at 0.3.
        assert!((tuning.factor(&slow) - 0.7).abs() < 1e-9);

        let quiet = LoadSignals::default();
        assert_eq!(tuning.factor(&quiet), 1.0);
    }

    #[test]
    fn validation_rejects_degenerate_parameters() {
        assert_eq!(
            LimitAlgorithm::FixedWindow { limit: 0, window: Duration::from_secs(1) }.validate(),
            Err(AlgorithmError::ZeroLimit)
        );
        assert_eq!(
            LimitAlgorithm::SlidingWindow { limit: 5, window: Duration::ZERO }.validate(),
            Err(AlgorithmError::ZeroWindow)
        );
        assert_eq!(
            LimitAlgorithm::TokenBucket { capacity: 0.0, refill_rate: 1.0 }.validate(),
            Err(AlgorithmError::NonPositiveCapacity(0.0))
        );
        assert_eq!(
            LimitAlgorithm::LeakyBucket { capacity: 5.0, leak_rate: 0.0 }.validate(),
            Err(AlgorithmError::NonPositiveRate(0.0))
        );
        let nested_bad = LimitAlgorithm::Adaptive {
            inner: Box::new(LimitAlgorithm::TokenBucket { capacity: -1.0, refill_rate: 1.0 }),
            tuning: AdaptiveTuning::default(),
        };
        assert!(nested_bad.validate().is_err());
    }

    #[test]
    fn algorithm_config_round_trips_through_serde() {
        let algorithm = LimitAlgorithm::Adaptive {
            inner: Box::new(LimitAlgorithm::SlidingWindow {
                limit: 100,
                window: Duration::from_secs(60),
            }),
            tuning: AdaptiveTuning { load_weight: 0.5, ..AdaptiveTuning::default() },
        };
        let json = serde_json::to_string(&algorithm).expect("serializes");
        let back: LimitAlgorithm = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(back, algorithm);
    }
}
