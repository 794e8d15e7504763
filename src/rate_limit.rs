//! Rate limiting: algorithms, rules, tiers, bypass, and the orchestrator.
//!
//! The pieces compose bottom-up:
//! - **Storage**: the [`crate::store::Store`] trait holds all counter/bucket
//!   state, so one limiter works in-process or across a fleet.
//! - **Logic**: [`strategies::LimitAlgorithm`] implements the decision math.
//! - **Policy**: [`rules::RuleSet`] and [`rules::TierRegistry`] decide which
//!   algorithm and which scope apply to a request.
//! - **Orchestration**: [`limiter::RateLimiter`] ties key resolution, bypass,
//!   rule/tier matching, and the algorithm into one `consume` call.
//! - **Middleware**: [`middleware::AdmissionLayer`] enforces the result
//!   around any tower service.

use std::net::IpAddr;
use std::time::Duration;

pub mod bypass;
pub mod limiter;
pub mod middleware;
pub mod rules;
pub mod strategies;

pub use bypass::BypassList;
pub use limiter::{FailurePolicy, RateLimiter, RateLimiterBuilder};
pub use middleware::{AdmissionLayer, AdmissionService};
pub use rules::{
    PathPattern, RateLimitRule, RateLimitTier, RuleAction, RulePredicate, RuleSet,
    ScopeDimension, TierRegistry,
};
pub use strategies::{AdaptiveTuning, LimitAlgorithm, LoadSignals};

/// The uniform result of a rate-limit decision.
///
/// Carries everything an adapter needs to surface `X-RateLimit-Limit`,
/// `X-RateLimit-Remaining`, `X-RateLimit-Reset`, and `Retry-After`.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Effective limit that applied to this request.
    pub limit: u64,
    /// Headroom left under that limit after this request.
    pub remaining: u64,
    /// Epoch milliseconds at which the limit state resets.
    pub reset_at_ms: u64,
    /// How long to wait before retrying; denials only.
    pub retry_after: Option<Duration>,
    /// Human-readable explanation for denials and special admissions.
    pub reason: Option<String>,
}

impl Decision {
    pub fn allow(limit: u64, remaining: u64, reset_at_ms: u64) -> Self {
        Self { allowed: true, limit, remaining, reset_at_ms, retry_after: None, reason: None }
    }

    pub fn deny(
        limit: u64,
        reset_at_ms: u64,
        retry_after: Duration,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at_ms,
            retry_after: Some(retry_after),
            reason: Some(reason.into()),
        }
    }

    /// Admission that never consulted the store (allow-listed caller or
    /// internal call). Adapters should skip rate-limit headers for these.
    pub fn bypass(now_ms: u64) -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_at_ms: now_ms,
            retry_after: None,
            reason: Some("bypass".to_string()),
        }
    }

    /// Admission because no rule or tier constrains this request.
    pub fn unconstrained(now_ms: u64) -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_at_ms: now_ms,
            retry_after: None,
            reason: None,
        }
    }

    /// Admission despite a store failure under the fail-open policy.
    pub fn fail_open(now_ms: u64) -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_at_ms: now_ms,
            retry_after: None,
            reason: Some("store unavailable (fail-open)".to_string()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Whole-second retry-after for `Retry-After` headers, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| d.as_secs_f64().ceil() as u64)
    }
}

/// Resolved request context handed in by an adapter.
///
/// Identity and tenant resolution happen upstream; the limiter only consumes
/// the outcome.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub path: String,
    pub method: String,
    pub ip: Option<IpAddr>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub api_key: Option<String>,
    /// Named tier this caller belongs to, when no rule decides for it.
    pub tier: Option<String>,
    /// Marks trusted service-to-service calls that bypass limiting.
    pub internal: bool,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self { method: method.into(), path: path.into(), ..Self::default() }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}
