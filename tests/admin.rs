//! The administrative surface: live rule/bypass/tier changes, key resets,
//! and quota inspection, all while traffic is flowing.

use floodgate::prelude::*;
use floodgate::ManualClock;
use std::sync::Arc;
use std::time::Duration;

fn harness() -> (RateLimiter, ManualClock) {
    let clock = ManualClock::starting_at(1_750_000_000_000);
    let store = MemoryStore::with_clock(Arc::new(clock.clone()));
    let limiter = RateLimiter::builder(Arc::new(store))
        .clock(Arc::new(clock.clone()))
        .failure_policy(FailurePolicy::FailClosed)
        .build();
    (limiter, clock)
}

fn minute_rule(name: &str, limit: u64) -> RateLimitRule {
    RateLimitRule::builder(name)
        .path("/api/*")
        .algorithm(LimitAlgorithm::FixedWindow { limit, window: Duration::from_secs(60) })
        .scope([ScopeDimension::User])
        .build()
        .expect("valid rule")
}

#[tokio::test]
async fn rule_changes_apply_to_live_traffic() {
    let (limiter, _clock) = harness();
    let ctx = RequestContext::new("GET", "/api/items").with_user("u1");

    // No rules yet: unconstrained.
    assert!(limiter.consume(&ctx, 1.0).await.expect("ok").allowed);

    limiter.rules().add(minute_rule("cap", 1));
    assert!(limiter.consume(&ctx, 1.0).await.expect("ok").allowed);
    assert!(!limiter.consume(&ctx, 1.0).await.expect("ok").allowed);

    // Raising the limit in place unblocks the caller. The counter already
    // holds 2 hits (one denied), so a limit of 5 admits three more.
    assert!(limiter.rules().update(minute_rule("cap", 5)));
    for _ in 0..3 {
        assert!(limiter.consume(&ctx, 1.0).await.expect("ok").allowed);
    }
    assert!(!limiter.consume(&ctx, 1.0).await.expect("ok").allowed);

    // Deleting the rule removes the constraint entirely.
    assert!(limiter.rules().remove("cap"));
    assert!(limiter.consume(&ctx, 1.0).await.expect("ok").allowed);
    assert!(limiter.rules().list().is_empty());
}

#[tokio::test]
async fn bypass_lists_are_editable_at_runtime() {
    let (limiter, _clock) = harness();
    limiter.rules().add(minute_rule("cap", 1));
    let ip = "198.51.100.4".parse().expect("valid ip");
    let ctx = RequestContext::new("GET", "/api/items").with_user("u1").with_ip(ip);

    assert!(limiter.consume(&ctx, 1.0).await.expect("ok").allowed);
    assert!(!limiter.consume(&ctx, 1.0).await.expect("ok").allowed);

    limiter.bypass().allow_ip(ip);
    let bypassed = limiter.consume(&ctx, 1.0).await.expect("ok");
    assert!(bypassed.allowed);
    assert_eq!(bypassed.reason.as_deref(), Some("bypass"));

    limiter.bypass().remove_ip(&ip);
    assert!(!limiter.consume(&ctx, 1.0).await.expect("ok").allowed);
}

#[tokio::test]
async fn resetting_a_key_clears_its_counters() {
    let (limiter, _clock) = harness();
    limiter.rules().add(
        RateLimitRule::builder("burst")
            .path("/api/*")
            .algorithm(LimitAlgorithm::TokenBucket { capacity: 3.0, refill_rate: 0.01 })
            .scope([ScopeDimension::User])
            .build()
            .expect("valid rule"),
    );
    let ctx = RequestContext::new("GET", "/api/items").with_user("u1");

    for _ in 0..3 {
        assert!(limiter.consume(&ctx, 1.0).await.expect("ok").allowed);
    }
    assert!(!limiter.consume(&ctx, 1.0).await.expect("ok").allowed);

    limiter.reset_key("rule:burst:user=u1").await.expect("reset");
    assert!(limiter.consume(&ctx, 1.0).await.expect("ok").allowed);
}

#[tokio::test]
async fn tier_management_and_default_assignment() {
    let (limiter, _clock) = harness();
    let mut free = RateLimitTier::new("free");
    free.per_minute = Some(1);
    let mut pro = RateLimitTier::new("pro");
    pro.per_minute = Some(100);
    limiter.tiers().add(free);
    limiter.tiers().add(pro);
    limiter.tiers().set_default("free");

    let anonymous = RequestContext::new("GET", "/data").with_user("u1");
    assert!(limiter.consume(&anonymous, 1.0).await.expect("ok").allowed);
    assert!(!limiter.consume(&anonymous, 1.0).await.expect("ok").allowed);

    let paying = RequestContext::new("GET", "/data").with_user("u2").with_tier("pro");
    for _ in 0..10 {
        assert!(limiter.consume(&paying, 1.0).await.expect("ok").allowed);
    }
}

#[tokio::test]
async fn quota_usage_is_inspectable() {
    let clock = ManualClock::starting_at(1_750_000_000_000);
    let store = MemoryStore::with_clock(Arc::new(clock.clone()));
    let quotas = QuotaManager::new(Arc::new(store)).with_clock(Arc::new(clock.clone()));
    quotas.define(QuotaDefinition::new("embeddings").daily(50).monthly(500));

    quotas.consume("tenant:t9", "embeddings", 20).await.expect("within quota");
    let usage = quotas.usage("tenant:t9", "embeddings").await.expect("usage");
    assert_eq!(usage.len(), 2);
    assert_eq!(usage[0].period, QuotaPeriod::Daily);
    assert_eq!(usage[0].used, 20);
    assert_eq!(usage[0].limit, 50);
    assert!(usage[0].reset_at_ms > clock_now(&clock));
    assert_eq!(usage[1].period, QuotaPeriod::Monthly);
    assert_eq!(usage[1].used, 20);

    // A fresh key reports zero usage, not an error.
    let untouched = quotas.usage("tenant:new", "embeddings").await.expect("usage");
    assert_eq!(untouched[0].used, 0);
}

fn clock_now(clock: &ManualClock) -> u64 {
    use floodgate::Clock;
    clock.now_millis()
}
