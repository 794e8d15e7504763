//! In-process store for single-instance deployments.
//!
//! Every operation runs inside one mutex-guarded critical section, which
//! gives the same per-key atomicity contract as the scripted Redis backend
//! at in-process cost. Expiry is lazy: keys are checked against the clock on
//! access, so no sweeper task is needed.

use crate::clock::{Clock, SystemClock};
use crate::store::{
    bucket_ttl, BucketOutcome, CounterCheck, MultiIncrementOutcome, Store, StoreError,
    WindowOutcome,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Int(i64),
    Bucket { level: f64, updated_ms: u64 },
    Window(Vec<u64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn live(&self, now_ms: u64) -> bool {
        match self.expires_at_ms {
            Some(at) => at > now_ms,
            None => true,
        }
    }
}

/// Mutex-guarded in-memory [`Store`].
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use an injected clock; expiry and bucket math then follow it.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock }
    }

    /// Run `f` under the store lock with expired entries for `key` already
    /// dropped. This is the critical section every operation goes through.
    fn with_key<R>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Entry>, u64) -> R) -> R {
        let now_ms = self.clock.now_millis();
        let mut map = self.entries.lock().expect("memory store poisoned");
        if map.get(key).is_some_and(|e| !e.live(now_ms)) {
            map.remove(key);
        }
        f(&mut map, now_ms)
    }

    fn expiry(now_ms: u64, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|t| now_ms + t.as_millis() as u64)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_key(key, |map, _| match map.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(Value::Int(i)) => Ok(Some(i.to_string())),
            Some(_) => Err(StoreError::TypeMismatch { key: key.to_string(), expected: "string" }),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.with_key(key, |map, now| {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Text(value.to_string()),
                    expires_at_ms: Self::expiry(now, ttl),
                },
            );
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.with_key(key, |map, _| Ok(map.remove(key).is_some()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.with_key(key, |map, _| Ok(map.contains_key(key)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with_key(key, |map, now| match map.get_mut(key) {
            Some(entry) => {
                entry.expires_at_ms = Self::expiry(now, Some(ttl));
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.with_key(key, |map, now| {
            Ok(map
                .get(key)
                .and_then(|e| e.expires_at_ms)
                .map(|at| Duration::from_millis(at.saturating_sub(now))))
        })
    }

    async fn increment(
        &self,
        key: &str,
        by: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        self.with_key(key, |map, now| match map.get_mut(key) {
            None => {
                map.insert(
                    key.to_string(),
                    Entry { value: Value::Int(by), expires_at_ms: Self::expiry(now, ttl) },
                );
                Ok(by)
            }
            Some(Entry { value: Value::Int(v), .. }) => {
                *v += by;
                Ok(*v)
            }
            Some(_) => Err(StoreError::TypeMismatch { key: key.to_string(), expected: "integer" }),
        })
    }

    async fn decrement(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.increment(key, -by, None).await
    }

    async fn acquire_lease(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with_key(key, |map, now| {
            if map.contains_key(key) {
                return Ok(false);
            }
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Text("lease".to_string()),
                    expires_at_ms: Self::expiry(now, Some(ttl)),
                },
            );
            Ok(true)
        })
    }

    async fn release_lease(&self, key: &str) -> Result<(), StoreError> {
        self.with_key(key, |map, _| {
            map.remove(key);
            Ok(())
        })
    }

    async fn sliding_window_add(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<WindowOutcome, StoreError> {
        self.with_key(key, |map, _| {
            let entry = map.entry(key.to_string()).or_insert(Entry {
                value: Value::Window(Vec::new()),
                expires_at_ms: None,
            });
            let Value::Window(log) = &mut entry.value else {
                return Err(StoreError::TypeMismatch {
                    key: key.to_string(),
                    expected: "timestamp log",
                });
            };
            let cutoff = now_ms.saturating_sub(window_ms);
            log.retain(|&ts| ts >= cutoff);
            log.push(now_ms);
            entry.expires_at_ms = Some(now_ms + 2 * window_ms);
            Ok(WindowOutcome {
                count: log.len() as u64,
                oldest_ms: log.iter().copied().min(),
            })
        })
    }

    async fn token_bucket_consume(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        cost: f64,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError> {
        self.with_key(key, |map, _| {
            let (level, updated_ms) = match map.get(key).map(|e| &e.value) {
                Some(Value::Bucket { level, updated_ms }) => (*level, *updated_ms),
                Some(_) => {
                    return Err(StoreError::TypeMismatch {
                        key: key.to_string(),
                        expected: "bucket",
                    })
                }
                // First sight of this key: a full bucket.
                None => (capacity, now_ms),
            };
            let elapsed_secs = now_ms.saturating_sub(updated_ms) as f64 / 1_000.0;
            let mut tokens = (level + elapsed_secs * refill_rate).min(capacity);
            let allowed = tokens + EPSILON >= cost;
            if allowed {
                tokens = (tokens - cost).max(0.0);
            }
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Bucket { level: tokens, updated_ms: now_ms.max(updated_ms) },
                    expires_at_ms: Some(
                        now_ms + bucket_ttl(capacity, refill_rate).as_millis() as u64,
                    ),
                },
            );
            Ok(BucketOutcome { allowed, level: tokens })
        })
    }

    async fn leaky_bucket_consume(
        &self,
        key: &str,
        capacity: f64,
        leak_rate: f64,
        cost: f64,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError> {
        self.with_key(key, |map, _| {
            let (level, updated_ms) = match map.get(key).map(|e| &e.value) {
                Some(Value::Bucket { level, updated_ms }) => (*level, *updated_ms),
                Some(_) => {
                    return Err(StoreError::TypeMismatch {
                        key: key.to_string(),
                        expected: "bucket",
                    })
                }
                // First sight of this key: an empty bucket.
                None => (0.0, now_ms),
            };
            let elapsed_secs = now_ms.saturating_sub(updated_ms) as f64 / 1_000.0;
            let mut water = (level - elapsed_secs * leak_rate).max(0.0);
            let allowed = water + cost <= capacity + EPSILON;
            if allowed {
                water += cost;
            }
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Bucket { level: water, updated_ms: now_ms.max(updated_ms) },
                    expires_at_ms: Some(now_ms + bucket_ttl(capacity, leak_rate).as_millis() as u64),
                },
            );
            Ok(BucketOutcome { allowed, level: water })
        })
    }

    async fn checked_multi_increment(
        &self,
        checks: &[CounterCheck],
        amount: u64,
    ) -> Result<MultiIncrementOutcome, StoreError> {
        let now_ms = self.clock.now_millis();
        let mut map = self.entries.lock().expect("memory store poisoned");
        for check in checks {
            if map.get(&check.key).is_some_and(|e| !e.live(now_ms)) {
                map.remove(&check.key);
            }
        }
        let mut currents = Vec::with_capacity(checks.len());
        for (index, check) in checks.iter().enumerate() {
            let current = match map.get(&check.key).map(|e| &e.value) {
                None => 0,
                Some(Value::Int(v)) => (*v).max(0) as u64,
                Some(_) => {
                    return Err(StoreError::TypeMismatch {
                        key: check.key.clone(),
                        expected: "integer",
                    })
                }
            };
            if current + amount > check.limit {
                return Ok(MultiIncrementOutcome::WouldExceed { index, current });
            }
            currents.push(current);
        }
        let mut applied = Vec::with_capacity(checks.len());
        for (check, current) in checks.iter().zip(currents) {
            let next = current + amount;
            let expires_at_ms = match map.get(&check.key) {
                Some(entry) => entry.expires_at_ms,
                None => Some(now_ms + check.ttl.as_millis() as u64),
            };
            map.insert(
                check.key.clone(),
                Entry { value: Value::Int(next as i64), expires_at_ms },
            );
            applied.push(next);
        }
        Ok(MultiIncrementOutcome::Applied(applied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::starting_at(1_000_000);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    #[tokio::test]
    async fn get_set_delete_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.exists("k").await.unwrap());
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn keys_expire_lazily() {
        let (store, clock) = store_with_clock();
        store.set("k", "v", Some(Duration::from_secs(10))).await.unwrap();
        clock.advance(9_999);
        assert!(store.exists("k").await.unwrap());
        clock.advance(1);
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_applies_ttl_only_on_creation() {
        let (store, clock) = store_with_clock();
        let ttl = Some(Duration::from_secs(60));
        assert_eq!(store.increment("c", 1, ttl).await.unwrap(), 1);
        clock.advance(30_000);
        assert_eq!(store.increment("c", 1, ttl).await.unwrap(), 2);
        // Expiry still anchored to the first increment.
        clock.advance(30_000);
        assert_eq!(store.increment("c", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn increment_rejects_non_integer_values() {
        let store = MemoryStore::new();
        store.set("k", "text", None).await.unwrap();
        let err = store.increment("k", 1, None).await.unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn lease_is_single_holder_until_expiry() {
        let (store, clock) = store_with_clock();
        assert!(store.acquire_lease("lease", Duration::from_secs(5)).await.unwrap());
        assert!(!store.acquire_lease("lease", Duration::from_secs(5)).await.unwrap());
        clock.advance(5_000);
        assert!(store.acquire_lease("lease", Duration::from_secs(5)).await.unwrap());
        store.release_lease("lease").await.unwrap();
        assert!(store.acquire_lease("lease", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn sliding_window_prunes_and_counts() {
        let (store, clock) = store_with_clock();
        let window = 10_000;
        for _ in 0..3 {
            store.sliding_window_add("w", clock.now_millis(), window).await.unwrap();
            clock.advance(1_000);
        }
        let outcome =
            store.sliding_window_add("w", clock.now_millis(), window).await.unwrap();
        assert_eq!(outcome.count, 4);

        // Push all but the newest prior entry out of the window.
        clock.advance(9_100);
        let outcome =
            store.sliding_window_add("w", clock.now_millis(), window).await.unwrap();
        assert_eq!(outcome.count, 2);
        assert_eq!(outcome.oldest_ms, Some(1_003_000));
    }

    #[tokio::test]
    async fn token_bucket_starts_full_and_refills() {
        let (store, clock) = store_with_clock();
        let now = clock.now_millis();
        let out = store.token_bucket_consume("b", 10.0, 1.0, 10.0, now).await.unwrap();
        assert!(out.allowed);
        assert!(out.level.abs() < 1e-6);

        let out = store.token_bucket_consume("b", 10.0, 1.0, 1.0, now).await.unwrap();
        assert!(!out.allowed);

        clock.advance(3_000);
        let out =
            store.token_bucket_consume("b", 10.0, 1.0, 3.0, clock.now_millis()).await.unwrap();
        assert!(out.allowed);
        assert!(out.level.abs() < 1e-6);
    }

    #[tokio::test]
    async fn leaky_bucket_fills_and_drains() {
        let (store, clock) = store_with_clock();
        let now = clock.now_millis();
        let out = store.leaky_bucket_consume("l", 5.0, 1.0, 5.0, now).await.unwrap();
        assert!(out.allowed);
        assert!((out.level - 5.0).abs() < 1e-6);

        let out = store.leaky_bucket_consume("l", 5.0, 1.0, 1.0, now).await.unwrap();
        assert!(!out.allowed);

        clock.advance(2_000);
        let out =
            store.leaky_bucket_consume("l", 5.0, 1.0, 1.0, clock.now_millis()).await.unwrap();
        assert!(out.allowed);
        assert!((out.level - 4.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn multi_increment_is_all_or_nothing() {
        let store = MemoryStore::new();
        let checks = vec![
            CounterCheck { key: "a".into(), limit: 10, ttl: Duration::from_secs(60) },
            CounterCheck { key: "b".into(), limit: 2, ttl: Duration::from_secs(60) },
        ];
        assert_eq!(
            store.checked_multi_increment(&checks, 2).await.unwrap(),
            MultiIncrementOutcome::Applied(vec![2, 2])
        );
        // "b" would go to 4 > 2; "a" must stay untouched.
        assert_eq!(
            store.checked_multi_increment(&checks, 2).await.unwrap(),
            MultiIncrementOutcome::WouldExceed { index: 1, current: 2 }
        );
        assert_eq!(store.get("a").await.unwrap(), Some("2".to_string()));
    }
}
