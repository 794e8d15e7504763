//! Rule matching and tier resolution.
//!
//! A rule is a tagged set of pure predicates (path glob, method, custom
//! function) evaluated explicitly — no reflection, no regex. Rules live in a
//! [`RuleSet`] ordered by priority; when several rules match a request, the
//! highest-priority rule alone applies (ties break on insertion order), so
//! exactly one rule is accountable for every decision.
//!
//! Tiers are named limit bundles attached to callers rather than routes;
//! they apply when no rule matches, or when a matching rule defers.

use crate::rate_limit::strategies::{AlgorithmError, LimitAlgorithm};
use crate::rate_limit::RequestContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Scope dimensions a rule or tier can key its counters by. Composite keys
/// always render dimensions in this declaration order, so the same request
/// maps to the same counter everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeDimension {
    User,
    Tenant,
    Ip,
    ApiKey,
    Endpoint,
}

impl ScopeDimension {
    pub const ALL: [ScopeDimension; 5] = [
        ScopeDimension::User,
        ScopeDimension::Tenant,
        ScopeDimension::Ip,
        ScopeDimension::ApiKey,
        ScopeDimension::Endpoint,
    ];

    fn label(&self) -> &'static str {
        match self {
            ScopeDimension::User => "user",
            ScopeDimension::Tenant => "tenant",
            ScopeDimension::Ip => "ip",
            ScopeDimension::ApiKey => "api_key",
            ScopeDimension::Endpoint => "endpoint",
        }
    }

    fn value(&self, ctx: &RequestContext) -> Option<String> {
        match self {
            ScopeDimension::User => ctx.user_id.clone(),
            ScopeDimension::Tenant => ctx.tenant_id.clone(),
            ScopeDimension::Ip => ctx.ip.map(|ip| ip.to_string()),
            ScopeDimension::ApiKey => ctx.api_key.clone(),
            ScopeDimension::Endpoint => Some(format!("{} {}", ctx.method, ctx.path)),
        }
    }
}

/// Build the deterministic composite key for one counter: the source (rule
/// or tier) name followed by the selected dimensions in fixed order, missing
/// values rendered as `-`.
pub fn composite_key(source: &str, scope: &[ScopeDimension], ctx: &RequestContext) -> String {
    let mut key = source.to_string();
    for dim in ScopeDimension::ALL.iter().filter(|d| scope.contains(d)) {
        let value = dim.value(ctx).unwrap_or_else(|| "-".to_string());
        key.push(':');
        key.push_str(dim.label());
        key.push('=');
        key.push_str(&value);
    }
    key
}

/// Path pattern with single-segment wildcards: `*` matches exactly one
/// segment, never across slashes, and nothing else is special.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathPattern {
    raw: String,
}

impl PathPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self { raw: pattern.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        let pattern: Vec<&str> = self.raw.split('/').filter(|s| !s.is_empty()).collect();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        pattern.len() == segments.len()
            && pattern.iter().zip(&segments).all(|(p, s)| *p == "*" || p == s)
    }
}

/// One predicate of a rule's match condition.
#[derive(Clone)]
pub enum RulePredicate {
    Path(PathPattern),
    /// Uppercase HTTP method name.
    Method(String),
    Custom(Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>),
}

impl RulePredicate {
    fn evaluate(&self, ctx: &RequestContext) -> bool {
        match self {
            RulePredicate::Path(pattern) => pattern.matches(&ctx.path),
            RulePredicate::Method(method) => ctx.method.eq_ignore_ascii_case(method),
            RulePredicate::Custom(f) => f(ctx),
        }
    }
}

impl fmt::Debug for RulePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RulePredicate::Path(p) => f.debug_tuple("Path").field(&p.raw).finish(),
            RulePredicate::Method(m) => f.debug_tuple("Method").field(m).finish(),
            RulePredicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// What a denial under this rule looks like to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    /// Deny with this status hint and message.
    Reject { status: u16, message: String },
    /// The rule only narrows scope; the caller's tier limits apply instead.
    DeferToTier,
}

impl Default for RuleAction {
    fn default() -> Self {
        RuleAction::Reject { status: 429, message: "rate limit exceeded".to_string() }
    }
}

/// Errors from building a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleError {
    MissingAlgorithm,
    Algorithm(AlgorithmError),
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::MissingAlgorithm => write!(f, "rule has no algorithm"),
            RuleError::Algorithm(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RuleError {}

impl From<AlgorithmError> for RuleError {
    fn from(e: AlgorithmError) -> Self {
        RuleError::Algorithm(e)
    }
}

/// A named limit rule: predicates, algorithm, counter scope, priority, and
/// denial action.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub name: String,
    predicates: Vec<RulePredicate>,
    pub algorithm: LimitAlgorithm,
    pub scope: Vec<ScopeDimension>,
    pub priority: i32,
    pub action: RuleAction,
}

impl RateLimitRule {
    pub fn builder(name: impl Into<String>) -> RateLimitRuleBuilder {
        RateLimitRuleBuilder {
            name: name.into(),
            predicates: Vec::new(),
            algorithm: None,
            scope: Vec::new(),
            priority: 0,
            action: RuleAction::default(),
        }
    }

    /// True when every predicate holds. A rule with no predicates matches
    /// everything (a catch-all).
    pub fn matches(&self, ctx: &RequestContext) -> bool {
        self.predicates.iter().all(|p| p.evaluate(ctx))
    }
}

/// Builder for [`RateLimitRule`]; validates the algorithm on `build`.
#[derive(Debug)]
pub struct RateLimitRuleBuilder {
    name: String,
    predicates: Vec<RulePredicate>,
    algorithm: Option<LimitAlgorithm>,
    scope: Vec<ScopeDimension>,
    priority: i32,
    action: RuleAction,
}

impl RateLimitRuleBuilder {
    pub fn path(mut self, pattern: impl Into<String>) -> Self {
        self.predicates.push(RulePredicate::Path(PathPattern::new(pattern)));
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.predicates.push(RulePredicate::Method(method.into()));
        self
    }

    pub fn predicate<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(RulePredicate::Custom(Arc::new(f)));
        self
    }

    pub fn algorithm(mut self, algorithm: LimitAlgorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    pub fn scope(mut self, dimensions: impl IntoIterator<Item = ScopeDimension>) -> Self {
        self.scope = dimensions.into_iter().collect();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn action(mut self, action: RuleAction) -> Self {
        self.action = action;
        self
    }

    pub fn reject_with(self, status: u16, message: impl Into<String>) -> Self {
        self.action(RuleAction::Reject { status, message: message.into() })
    }

    pub fn build(self) -> Result<RateLimitRule, RuleError> {
        let algorithm = self.algorithm.ok_or(RuleError::MissingAlgorithm)?;
        algorithm.validate()?;
        Ok(RateLimitRule {
            name: self.name,
            predicates: self.predicates,
            algorithm,
            scope: self.scope,
            priority: self.priority,
            action: self.action,
        })
    }
}

/// Injected, concurrently administered rule registry. Rules are kept sorted
/// by descending priority; the sort is stable, so equal priorities preserve
/// insertion order.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: RwLock<Vec<Arc<RateLimitRule>>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, rule: RateLimitRule) {
        let mut rules = self.rules.write().expect("rule set poisoned");
        rules.push(Arc::new(rule));
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Replace the rule with the same name; returns false if absent.
    pub fn update(&self, rule: RateLimitRule) -> bool {
        let mut rules = self.rules.write().expect("rule set poisoned");
        match rules.iter().position(|r| r.name == rule.name) {
            Some(idx) => {
                rules[idx] = Arc::new(rule);
                rules.sort_by(|a, b| b.priority.cmp(&a.priority));
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut rules = self.rules.write().expect("rule set poisoned");
        let before = rules.len();
        rules.retain(|r| r.name != name);
        rules.len() != before
    }

    pub fn list(&self) -> Vec<Arc<RateLimitRule>> {
        self.rules.read().expect("rule set poisoned").clone()
    }

    /// Highest-priority rule matching this request, if any.
    pub fn matching(&self, ctx: &RequestContext) -> Option<Arc<RateLimitRule>> {
        let rules = self.rules.read().expect("rule set poisoned");
        rules.iter().find(|r| r.matches(ctx)).cloned()
    }
}

/// Named bundle of limits attached to a caller instead of a route.
///
/// Period limits are enforced by the limiter; `max_concurrent` is the
/// ceiling a [`crate::ConcurrencyLimit`] guard enforces around the work
/// itself, since admission alone carries no completion signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitTier {
    pub name: String,
    #[serde(default)]
    pub per_minute: Option<u64>,
    #[serde(default)]
    pub per_hour: Option<u64>,
    #[serde(default)]
    pub per_day: Option<u64>,
    /// Token-bucket burst capacity layered over the period limits.
    #[serde(default)]
    pub burst: Option<u64>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

impl RateLimitTier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            per_minute: None,
            per_hour: None,
            per_day: None,
            burst: None,
            max_concurrent: None,
        }
    }
}

/// Registry of tiers plus the fallback applied to callers with none.
#[derive(Debug, Default)]
pub struct TierRegistry {
    tiers: RwLock<HashMap<String, RateLimitTier>>,
    default_tier: RwLock<Option<String>>,
}

impl TierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tier: RateLimitTier) {
        self.tiers.write().expect("tier registry poisoned").insert(tier.name.clone(), tier);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.tiers.write().expect("tier registry poisoned").remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<RateLimitTier> {
        self.tiers.read().expect("tier registry poisoned").get(name).cloned()
    }

    /// Tier applied to callers that do not name one.
    pub fn set_default(&self, name: impl Into<String>) {
        *self.default_tier.write().expect("tier registry poisoned") = Some(name.into());
    }

    /// The requested tier if registered, else the default tier, else none.
    pub fn resolve(&self, requested: Option<&str>) -> Option<RateLimitTier> {
        if let Some(tier) = requested.and_then(|name| self.get(name)) {
            return Some(tier);
        }
        let default = self.default_tier.read().expect("tier registry poisoned").clone();
        default.and_then(|name| self.get(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn minute_window(limit: u64) -> LimitAlgorithm {
        LimitAlgorithm::FixedWindow { limit, window: Duration::from_secs(60) }
    }

    #[test]
    fn path_pattern_wildcards_match_single_segments() {
        let pattern = PathPattern::new("/api/users/*/posts");
        assert!(pattern.matches("/api/users/42/posts"));
        assert!(pattern.matches("api/users/abc/posts/"));
        assert!(!pattern.matches("/api/users/42"));
        assert!(!pattern.matches("/api/users/42/posts/7"));
        // A wildcard never spans segments.
        assert!(!pattern.matches("/api/users/42/extra/posts"));
    }

    #[test]
    fn path_pattern_is_not_a_regex() {
        let pattern = PathPattern::new("/api/v.");
        assert!(!pattern.matches("/api/v1"));
        assert!(pattern.matches("/api/v."));
    }

    #[test]
    fn rule_matches_all_predicates() {
        let rule = RateLimitRule::builder("writes")
            .path("/api/*/items")
            .method("POST")
            .predicate(|ctx| ctx.user_id.is_some())
            .algorithm(minute_window(10))
            .build()
            .expect("valid rule");

        let hit = RequestContext::new("post", "/api/a/items").with_user("u1");
        assert!(rule.matches(&hit));
        assert!(!rule.matches(&RequestContext::new("GET", "/api/a/items").with_user("u1")));
        assert!(!rule.matches(&RequestContext::new("POST", "/api/a/items")));
    }

    #[test]
    fn rule_without_predicates_is_a_catch_all() {
        let rule = RateLimitRule::builder("global")
            .algorithm(minute_window(100))
            .build()
            .expect("valid rule");
        assert!(rule.matches(&RequestContext::new("GET", "/anything")));
    }

    #[test]
    fn builder_requires_a_valid_algorithm() {
        assert_eq!(
            RateLimitRule::builder("empty").build().unwrap_err(),
            RuleError::MissingAlgorithm
        );
        let err = RateLimitRule::builder("bad")
            .algorithm(LimitAlgorithm::TokenBucket { capacity: 0.0, refill_rate: 1.0 })
            .build()
            .unwrap_err();
        assert!(matches!(err, RuleError::Algorithm(_)));
    }

    #[test]
    fn highest_priority_rule_wins() {
        let rules = RuleSet::new();
        let ctx = RequestContext::new("GET", "/api/reports");
        rules.add(
            RateLimitRule::builder("broad")
                .path("/api/*")
                .priority(1)
                .algorithm(minute_window(100))
                .build()
                .expect("valid rule"),
        );
        rules.add(
            RateLimitRule::builder("reports")
                .path("/api/reports")
                .priority(10)
                .algorithm(minute_window(5))
                .build()
                .expect("valid rule"),
        );
        let winner = rules.matching(&ctx).expect("a rule matches");
        assert_eq!(winner.name, "reports");
    }

    #[test]
    fn equal_priority_breaks_on_insertion_order() {
        let rules = RuleSet::new();
        for name in ["first", "second"] {
            rules.add(
                RateLimitRule::builder(name)
                    .priority(5)
                    .algorithm(minute_window(10))
                    .build()
                    .expect("valid rule"),
            );
        }
        let winner = rules.matching(&RequestContext::new("GET", "/x")).expect("matches");
        assert_eq!(winner.name, "first");
    }

    #[test]
    fn rule_set_crud() {
        let rules = RuleSet::new();
        rules.add(
            RateLimitRule::builder("a").algorithm(minute_window(10)).build().expect("valid"),
        );
        assert_eq!(rules.list().len(), 1);

        let updated = RateLimitRule::builder("a")
            .algorithm(minute_window(20))
            .build()
            .expect("valid");
        assert!(rules.update(updated));
        assert!(matches!(
            rules.list()[0].algorithm,
            LimitAlgorithm::FixedWindow { limit: 20, .. }
        ));

        assert!(!rules.update(
            RateLimitRule::builder("ghost").algorithm(minute_window(1)).build().expect("valid")
        ));
        assert!(rules.remove("a"));
        assert!(!rules.remove("a"));
        assert!(rules.list().is_empty());
    }

    #[test]
    fn composite_key_renders_fixed_order_and_missing_dims() {
        let ctx = RequestContext::new("GET", "/api/items")
            .with_user("u1")
            .with_ip("10.0.0.9".parse().expect("valid ip"));
        // Request scope in shuffled order; the key must come out in
        // declaration order regardless.
        let key = composite_key(
            "rule:items",
            &[ScopeDimension::Ip, ScopeDimension::ApiKey, ScopeDimension::User],
            &ctx,
        );
        assert_eq!(key, "rule:items:user=u1:ip=10.0.0.9:api_key=-");
    }

    #[test]
    fn tier_registry_resolves_with_default_fallback() {
        let tiers = TierRegistry::new();
        let mut free = RateLimitTier::new("free");
        free.per_minute = Some(60);
        tiers.add(free);
        let mut pro = RateLimitTier::new("pro");
        pro.per_minute = Some(600);
        tiers.add(pro);
        tiers.set_default("free");

        assert_eq!(tiers.resolve(Some("pro")).expect("registered").name, "pro");
        assert_eq!(tiers.resolve(Some("unknown")).expect("default").name, "free");
        assert_eq!(tiers.resolve(None).expect("default").name, "free");
        assert!(tiers.remove("free"));
        assert!(tiers.resolve(None).is_none());
    }

    #[test]
    fn tier_config_round_trips_through_serde() {
        let json = r#"{"name":"free","per_minute":60,"per_day":5000,"burst":10}"#;
        let tier: RateLimitTier = serde_json::from_str(json).expect("deserializes");
        assert_eq!(tier.per_minute, Some(60));
        assert_eq!(tier.per_hour, None);
        assert_eq!(tier.max_concurrent, None);
    }
}
