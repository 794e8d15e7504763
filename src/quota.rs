//! Long-horizon usage ceilings.
//!
//! Quotas ride above the short-window rate limits: a definition may cap
//! daily, weekly, and monthly usage at once, and `consume` is all-or-nothing
//! across those periods — if any would be breached, no counter moves and the
//! denial names the breached period. Counters live in the store under keys
//! whose TTL expires exactly at the period boundary (UTC midnight, ISO week
//! start, first of month), so a reset is a hard edge, not a lazy smear.

use crate::clock::{Clock, SystemClock};
use crate::error::AdmissionError;
use crate::store::{CounterCheck, MultiIncrementOutcome, Store};
use chrono::{DateTime, Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A quota accounting period with a fixed UTC reset boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    /// Resets at UTC midnight.
    Daily,
    /// Resets at the ISO week start (Monday 00:00 UTC).
    Weekly,
    /// Resets on the first of the month, 00:00 UTC.
    Monthly,
}

impl QuotaPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaPeriod::Daily => "daily",
            QuotaPeriod::Weekly => "weekly",
            QuotaPeriod::Monthly => "monthly",
        }
    }

    /// Epoch milliseconds of this period's next reset boundary.
    pub fn reset_at_ms(&self, now_ms: u64) -> u64 {
        self.boundary_after(now_ms).unwrap_or_else(|| {
            // Out-of-range calendar arithmetic; fall back to a nominal span.
            now_ms + self.nominal_length().as_millis() as u64
        })
    }

    fn boundary_after(&self, now_ms: u64) -> Option<u64> {
        let now = DateTime::from_timestamp_millis(i64::try_from(now_ms).ok()?)?;
        let today = now.date_naive();
        let boundary = match self {
            QuotaPeriod::Daily => today.checked_add_days(Days::new(1))?,
            QuotaPeriod::Weekly => {
                let monday = today
                    .checked_sub_days(Days::new(now.weekday().num_days_from_monday() as u64))?;
                monday.checked_add_days(Days::new(7))?
            }
            QuotaPeriod::Monthly => {
                let (year, month) = if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)?
            }
        };
        let millis = boundary.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
        u64::try_from(millis).ok()
    }

    fn nominal_length(&self) -> Duration {
        match self {
            QuotaPeriod::Daily => Duration::from_secs(86_400),
            QuotaPeriod::Weekly => Duration::from_secs(7 * 86_400),
            QuotaPeriod::Monthly => Duration::from_secs(31 * 86_400),
        }
    }
}

impl fmt::Display for QuotaPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named quota: one ceiling per configured period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDefinition {
    pub name: String,
    #[serde(default)]
    pub daily: Option<u64>,
    #[serde(default)]
    pub weekly: Option<u64>,
    #[serde(default)]
    pub monthly: Option<u64>,
}

impl QuotaDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), daily: None, weekly: None, monthly: None }
    }

    pub fn daily(mut self, limit: u64) -> Self {
        self.daily = Some(limit);
        self
    }

    pub fn weekly(mut self, limit: u64) -> Self {
        self.weekly = Some(limit);
        self
    }

    pub fn monthly(mut self, limit: u64) -> Self {
        self.monthly = Some(limit);
        self
    }

    /// Configured `(period, limit)` pairs in fixed period order.
    pub fn limits(&self) -> Vec<(QuotaPeriod, u64)> {
        [
            (QuotaPeriod::Daily, self.daily),
            (QuotaPeriod::Weekly, self.weekly),
            (QuotaPeriod::Monthly, self.monthly),
        ]
        .into_iter()
        .filter_map(|(period, limit)| limit.map(|l| (period, l)))
        .collect()
    }
}

/// Per-period usage for client-facing reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodUsage {
    pub period: QuotaPeriod,
    pub used: u64,
    pub limit: u64,
    pub reset_at_ms: u64,
}

/// Tracks long-horizon ceilings independent of short-window limiting.
pub struct QuotaManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    prefix: String,
    definitions: RwLock<HashMap<String, QuotaDefinition>>,
}

impl fmt::Debug for QuotaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaManager").field("prefix", &self.prefix).finish_non_exhaustive()
    }
}

impl QuotaManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            prefix: "floodgate".to_string(),
            definitions: RwLock::new(HashMap::new()),
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

    pub fn define(&self, definition: QuotaDefinition) {
        self.definitions
            .write()
            .expect("quota definitions poisoned")
            .insert(definition.name.clone(), definition);
    }

    pub fn remove_definition(&self, name: &str) -> bool {
        self.definitions.write().expect("quota definitions poisoned").remove(name).is_some()
    }

    pub fn definition(&self, name: &str) -> Option<QuotaDefinition> {
        self.definitions.read().expect("quota definitions poisoned").get(name).cloned()
    }

    fn counter_key(&self, key: &str, quota: &str, period: QuotaPeriod) -> String {
        format!("{}:quota:{}:{}:{}", self.prefix, key, quota, period.as_str())
    }

    /// Charge `amount` against every configured period of `quota`, only if
    /// none would be exceeded. On denial nothing is mutated and the error
    /// names the breached period. An undefined quota imposes no ceiling.
    pub async fn consume(
        &self,
        key: &str,
        quota: &str,
        amount: u64,
    ) -> Result<Vec<PeriodUsage>, AdmissionError> {
        let Some(definition) = self.definition(quota) else {
            return Ok(Vec::new());
        };
        let limits = definition.limits();
        if limits.is_empty() {
            return Ok(Vec::new());
        }
        let now_ms = self.clock.now_millis();
        let checks: Vec<CounterCheck> = limits
            .iter()
            .map(|&(period, limit)| CounterCheck {
                key: self.counter_key(key, quota, period),
                limit,
                ttl: Duration::from_millis(period.reset_at_ms(now_ms).saturating_sub(now_ms)),
            })
            .collect();

        match self.store.checked_multi_increment(&checks, amount).await? {
            MultiIncrementOutcome::Applied(values) => Ok(limits
                .iter()
                .zip(values)
                .map(|(&(period, limit), used)| PeriodUsage {
                    period,
                    used,
                    limit,
                    reset_at_ms: period.reset_at_ms(now_ms),
                })
                .collect()),
            MultiIncrementOutcome::WouldExceed { index, .. } => {
                let (period, _) = limits[index];
                tracing::debug!(key, quota, period = %period, "quota denial");
                Err(AdmissionError::QuotaExceeded {
                    period,
                    reset_at_ms: period.reset_at_ms(now_ms),
                })
            }
        }
    }

    /// Current `{used, limit, reset}` per configured period.
    pub async fn usage(&self, key: &str, quota: &str) -> Result<Vec<PeriodUsage>, AdmissionError> {
        let Some(definition) = self.definition(quota) else {
            return Ok(Vec::new());
        };
        let now_ms = self.clock.now_millis();
        let mut report = Vec::new();
        for (period, limit) in definition.limits() {
            let used = self
                .store
                .get(&self.counter_key(key, quota, period))
                .await?
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0);
            report.push(PeriodUsage {
                period,
                used,
                limit,
                reset_at_ms: period.reset_at_ms(now_ms),
            });
        }
        Ok(report)
    }
}
