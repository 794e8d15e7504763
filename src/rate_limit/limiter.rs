//! The admission orchestrator.
//!
//! `RateLimiter::consume` is the one call adapters make per unit of work:
//! bypass check, rule/tier resolution, composite-key construction, algorithm
//! invocation, and failure-policy handling, in that order. The store is the
//! only shared state; the limiter itself can be rebuilt freely.

use crate::clock::{Clock, SystemClock};
use crate::dynamic::DynamicConfig;
use crate::error::AdmissionError;
use crate::rate_limit::rules::{
    composite_key, RateLimitRule, RateLimitTier, RuleAction, RuleSet, ScopeDimension,
    TierRegistry,
};
use crate::rate_limit::strategies::{LimitAlgorithm, LoadSignals};
use crate::rate_limit::{BypassList, Decision, RequestContext};
use crate::store::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Dimensions a tier keys its counters by: the caller's identity in its
/// strongest available form.
const TIER_SCOPE: [ScopeDimension; 3] =
    [ScopeDimension::User, ScopeDimension::Ip, ScopeDimension::ApiKey];

/// What `consume` does when the store itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Admit, flag the decision, and log the failure. Protects availability
    /// at the cost of unenforced limits while the store is down.
    #[default]
    FailOpen,
    /// Reject with [`AdmissionError::StoreUnavailable`]. Protects downstream
    /// resources at the cost of availability.
    FailClosed,
}

/// Composed admission decision engine. Build one per deployment with
/// [`RateLimiter::builder`]; it is cheap to share behind an `Arc`.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    rules: Arc<RuleSet>,
    tiers: Arc<TierRegistry>,
    bypass: Arc<BypassList>,
    signals: DynamicConfig<LoadSignals>,
    prefix: String,
    policy: FailurePolicy,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("prefix", &self.prefix)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for RateLimiterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterBuilder").field("prefix", &self.prefix).finish_non_exhaustive()
    }
}

/// Builder for [`RateLimiter`]. Every component has a sensible default:
/// system clock, empty registries, `floodgate` key prefix, fail-open.
pub struct RateLimiterBuilder {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    rules: Arc<RuleSet>,
    tiers: Arc<TierRegistry>,
    bypass: Arc<BypassList>,
    signals: DynamicConfig<LoadSignals>,
    prefix: String,
    policy: FailurePolicy,
}

impl RateLimiterBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rules(mut self, rules: Arc<RuleSet>) -> Self {
        self.rules = rules;
        self
    }

    pub fn tiers(mut self, tiers: Arc<TierRegistry>) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn bypass(mut self, bypass: Arc<BypassList>) -> Self {
        self.bypass = bypass;
        self
    }

    /// Share a signals handle with the feedback loop feeding the adaptive
    /// algorithm.
    pub fn signals(mut self, signals: DynamicConfig<LoadSignals>) -> Self {
        self.signals = signals;
        self
    }

    /// Namespace for every key this limiter writes.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter {
            store: self.store,
            clock: self.clock,
            rules: self.rules,
            tiers: self.tiers,
            bypass: self.bypass,
            signals: self.signals,
            prefix: self.prefix,
            policy: self.policy,
        }
    }
}

impl RateLimiter {
    pub fn builder(store: Arc<dyn Store>) -> RateLimiterBuilder {
        RateLimiterBuilder {
            store,
            clock: Arc::new(SystemClock),
            rules: Arc::new(RuleSet::new()),
            tiers: Arc::new(TierRegistry::new()),
            bypass: Arc::new(BypassList::new()),
            signals: DynamicConfig::new(LoadSignals::default()),
            prefix: "floodgate".to_string(),
            policy: FailurePolicy::default(),
        }
    }

    /// Rule registry, for administration.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Tier registry, for administration.
    pub fn tiers(&self) -> &TierRegistry {
        &self.tiers
    }

    /// Bypass allow-lists, for administration.
    pub fn bypass(&self) -> &BypassList {
        &self.bypass
    }

    /// Handle for publishing live load signals.
    pub fn signals(&self) -> DynamicConfig<LoadSignals> {
        self.signals.clone()
    }

    /// Decide one unit of work. This is the combined check-and-mutate call:
    /// an allowed decision has already been charged against the counters.
    pub async fn consume(
        &self,
        ctx: &RequestContext,
        cost: f64,
    ) -> Result<Decision, AdmissionError> {
        let now_ms = self.clock.now_millis();

        if self.bypass.exempts(ctx) {
            tracing::debug!(path = %ctx.path, "admission bypassed");
            return Ok(Decision::bypass(now_ms));
        }

        let outcome = match self.rules.matching(ctx) {
            Some(rule) if rule.action != RuleAction::DeferToTier => {
                self.consume_rule(&rule, ctx, cost, now_ms).await
            }
            _ => self.consume_tier(ctx, cost, now_ms).await,
        };

        match outcome {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::debug!(
                        path = %ctx.path,
                        reason = decision.reason.as_deref().unwrap_or(""),
                        "admission denied"
                    );
                }
                Ok(decision)
            }
            Err(store_err) => self.apply_failure_policy(store_err, now_ms),
        }
    }

    /// Clear bucket and window state for one composite key.
    pub async fn reset_key(&self, key: &str) -> Result<(), AdmissionError> {
        self.store.delete(&format!("{}:bucket:{}", self.prefix, key)).await?;
        self.store.delete(&format!("{}:window:{}", self.prefix, key)).await?;
        Ok(())
    }

    async fn consume_rule(
        &self,
        rule: &RateLimitRule,
        ctx: &RequestContext,
        cost: f64,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        let source = format!("rule:{}", rule.name);
        let key = composite_key(&source, &rule.scope, ctx);
        let signals = self.signals.get();
        let mut decision = rule
            .algorithm
            .consume(self.store.as_ref(), &self.prefix, &key, cost, now_ms, &signals)
            .await?;
        if !decision.allowed {
            if let RuleAction::Reject { message, .. } = &rule.action {
                decision.reason = Some(message.clone());
            }
        }
        Ok(decision)
    }

    async fn consume_tier(
        &self,
        ctx: &RequestContext,
        cost: f64,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        let Some(tier) = self.tiers.resolve(ctx.tier.as_deref()) else {
            return Ok(Decision::unconstrained(now_ms));
        };
        let base_key = composite_key(&format!("tier:{}", tier.name), &TIER_SCOPE, ctx);
        let signals = self.signals.get();

        // Every configured limit must pass. A later denial leaves earlier
        // counters charged: denied traffic counts toward every window it
        // reached, same as a denied sliding-window attempt.
        let mut binding: Option<Decision> = None;
        for (label, algorithm) in tier_checks(&tier) {
            let key = format!("{}:{}", base_key, label);
            let decision = algorithm
                .consume(self.store.as_ref(), &self.prefix, &key, cost, now_ms, &signals)
                .await?;
            if !decision.allowed {
                let mut decision = decision;
                decision.reason =
                    Some(format!("tier '{}' {} limit exceeded", tier.name, label));
                return Ok(decision);
            }
            let tighter = match &binding {
                Some(current) => decision.remaining < current.remaining,
                None => true,
            };
            if tighter {
                binding = Some(decision);
            }
        }
        Ok(binding.unwrap_or_else(|| Decision::unconstrained(now_ms)))
    }

    fn apply_failure_policy(
        &self,
        err: StoreError,
        now_ms: u64,
    ) -> Result<Decision, AdmissionError> {
        match self.policy {
            FailurePolicy::FailOpen => {
                tracing::warn!(error = %err, "store unavailable; admitting (fail-open)");
                Ok(Decision::fail_open(now_ms))
            }
            FailurePolicy::FailClosed => {
                tracing::error!(error = %err, "store unavailable; rejecting (fail-closed)");
                Err(AdmissionError::StoreUnavailable { detail: err.to_string() })
            }
        }
    }
}

/// The algorithms a tier's limits translate into.
fn tier_checks(tier: &RateLimitTier) -> Vec<(&'static str, LimitAlgorithm)> {
    let mut checks = Vec::new();
    if let Some(burst) = tier.burst {
        checks.push((
            "burst",
            LimitAlgorithm::TokenBucket {
                capacity: burst as f64,
                refill_rate: tier_refill_rate(tier, burst),
            },
        ));
    }
    if let Some(limit) = tier.per_minute {
        checks.push((
            "minute",
            LimitAlgorithm::FixedWindow { limit, window: Duration::from_secs(60) },
        ));
    }
    if let Some(limit) = tier.per_hour {
        checks.push((
            "hour",
            LimitAlgorithm::FixedWindow { limit, window: Duration::from_secs(3_600) },
        ));
    }
    if let Some(limit) = tier.per_day {
        checks.push((
            "day",
            LimitAlgorithm::FixedWindow { limit, window: Duration::from_secs(86_400) },
        ));
    }
    checks
}

/// Burst tokens refill at the tightest configured per-period rate, so the
/// bucket never admits more than the periods would.
fn tier_refill_rate(tier: &RateLimitTier, burst: u64) -> f64 {
    if let Some(per_minute) = tier.per_minute {
        per_minute as f64 / 60.0
    } else if let Some(per_hour) = tier.per_hour {
        per_hour as f64 / 3_600.0
    } else if let Some(per_day) = tier.per_day {
        per_day as f64 / 86_400.0
    } else {
        burst as f64
    }
}
