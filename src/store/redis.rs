//! Redis-backed store for multi-instance deployments.
//!
//! Each specialized operation is one `EVAL` round-trip: Redis executes Lua
//! scripts atomically, so concurrent limiters on different machines observe
//! every read-modify-write as a single step. Every call is bounded by a
//! per-operation timeout; an elapsed timeout surfaces as
//! [`StoreError::Timeout`] so the orchestrator's failure policy can decide
//! the outcome.

use crate::store::{
    bucket_ttl, BucketOutcome, CounterCheck, MultiIncrementOutcome, Store, StoreError,
    WindowOutcome,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// KEYS[1] = log key; ARGV = cutoff_ms, now_ms, member, ttl_ms.
const SLIDING_WINDOW: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
local count = redis.call('ZCARD', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
return {count, oldest[2] or ''}
"#;

/// KEYS[1] = bucket key; ARGV = capacity, refill_rate, cost, now_ms, ttl_ms.
const TOKEN_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local tokens = capacity
local updated = now
local state = redis.call('HMGET', KEYS[1], 'level', 'ts')
if state[1] then
  tokens = tonumber(state[1])
  updated = tonumber(state[2])
end
local elapsed = math.max(0, now - updated) / 1000.0
tokens = math.min(capacity, tokens + elapsed * rate)
local allowed = 0
if tokens + 1e-9 >= cost then
  tokens = math.max(0, tokens - cost)
  allowed = 1
end
redis.call('HSET', KEYS[1], 'level', tokens, 'ts', math.max(now, updated))
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {allowed, tostring(tokens)}
"#;

/// KEYS[1] = bucket key; ARGV = capacity, leak_rate, cost, now_ms, ttl_ms.
const LEAKY_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local leak = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local water = 0
local updated = now
local state = redis.call('HMGET', KEYS[1], 'level', 'ts')
if state[1] then
  water = tonumber(state[1])
  updated = tonumber(state[2])
end
local elapsed = math.max(0, now - updated) / 1000.0
water = math.max(0, water - elapsed * leak)
local allowed = 0
if water + cost <= capacity + 1e-9 then
  water = water + cost
  allowed = 1
end
redis.call('HSET', KEYS[1], 'level', water, 'ts', math.max(now, updated))
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {allowed, tostring(water)}
"#;

/// KEYS = counter keys; ARGV[1] = amount, then per key: limit, ttl_ms.
const CHECKED_MULTI_INCR: &str = r#"
local amount = tonumber(ARGV[1])
for i = 1, #KEYS do
  local current = tonumber(redis.call('GET', KEYS[i]) or '0')
  local limit = tonumber(ARGV[2 * i])
  if current + amount > limit then
    return {0, i - 1, current}
  end
end
local result = {1}
for i = 1, #KEYS do
  local value = redis.call('INCRBY', KEYS[i], amount)
  if redis.call('PTTL', KEYS[i]) < 0 then
    redis.call('PEXPIRE', KEYS[i], ARGV[2 * i + 1])
  end
  result[i + 1] = value
end
return result
"#;

/// Network-shared [`Store`] over Redis.
pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    seq: AtomicU64,
}

impl RedisStore {
    /// Connect and hand back a store with the default per-op timeout.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { conn, op_timeout: DEFAULT_OP_TIMEOUT, seq: AtomicU64::new(0) })
    }

    /// Override the bounded per-operation timeout.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(|e| StoreError::Unavailable(e.to_string())),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            redis::cmd("GET").arg(key).query_async::<_, Option<String>>(&mut conn).await
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.bounded(async move { cmd.query_async::<_, ()>(&mut conn).await }).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed = self
            .bounded(async move { redis::cmd("DEL").arg(key).query_async::<_, i64>(&mut conn).await })
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let found = self
            .bounded(async move {
                redis::cmd("EXISTS").arg(key).query_async::<_, i64>(&mut conn).await
            })
            .await?;
        Ok(found > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let millis = ttl.as_millis() as u64;
        let set = self
            .bounded(async move {
                redis::cmd("PEXPIRE").arg(key).arg(millis).query_async::<_, i64>(&mut conn).await
            })
            .await?;
        Ok(set > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let millis = self
            .bounded(async move {
                redis::cmd("PTTL").arg(key).query_async::<_, i64>(&mut conn).await
            })
            .await?;
        // -2 = no key, -1 = no expiry.
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn increment(
        &self,
        key: &str,
        by: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.map(|t| t.as_millis() as u64);
        self.bounded(async move {
            let value: i64 = redis::cmd("INCRBY").arg(key).arg(by).query_async(&mut conn).await?;
            if let Some(ttl_ms) = ttl_ms {
                let remaining: i64 =
                    redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
                if remaining < 0 {
                    redis::cmd("PEXPIRE")
                        .arg(key)
                        .arg(ttl_ms)
                        .query_async::<_, i64>(&mut conn)
                        .await?;
                }
            }
            Ok(value)
        })
        .await
    }

    async fn decrement(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            redis::cmd("DECRBY").arg(key).arg(by).query_async(&mut conn).await
        })
        .await
    }

    async fn acquire_lease(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let millis = ttl.as_millis() as u64;
        let reply = self
            .bounded(async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg("lease")
                    .arg("NX")
                    .arg("PX")
                    .arg(millis)
                    .query_async::<_, Option<String>>(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lease(&self, key: &str) -> Result<(), StoreError> {
        self.delete(key).await.map(|_| ())
    }

    async fn sliding_window_add(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<WindowOutcome, StoreError> {
        let mut conn = self.conn.clone();
        // Unique member per event, so same-millisecond hits all count.
        let member = format!("{}-{}", now_ms, self.seq.fetch_add(1, Ordering::Relaxed));
        let cutoff = now_ms.saturating_sub(window_ms);
        let script = Script::new(SLIDING_WINDOW);
        let (count, oldest): (i64, String) = self
            .bounded(async move {
                script
                    .key(key)
                    .arg(cutoff)
                    .arg(now_ms)
                    .arg(member)
                    .arg(2 * window_ms)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        let oldest_ms = oldest.parse::<f64>().ok().map(|s| s as u64);
        Ok(WindowOutcome { count: count.max(0) as u64, oldest_ms })
    }

    async fn token_bucket_consume(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        cost: f64,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = bucket_ttl(capacity, refill_rate).as_millis() as u64;
        let script = Script::new(TOKEN_BUCKET);
        let (allowed, level): (i64, String) = self
            .bounded(async move {
                script
                    .key(key)
                    .arg(capacity)
                    .arg(refill_rate)
                    .arg(cost)
                    .arg(now_ms)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        let level = level
            .parse::<f64>()
            .map_err(|e| StoreError::Codec(format!("bucket level '{}': {}", level, e)))?;
        Ok(BucketOutcome { allowed: allowed == 1, level })
    }

    async fn leaky_bucket_consume(
        &self,
        key: &str,
        capacity: f64,
        leak_rate: f64,
        cost: f64,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = bucket_ttl(capacity, leak_rate).as_millis() as u64;
        let script = Script::new(LEAKY_BUCKET);
        let (allowed, level): (i64, String) = self
            .bounded(async move {
                script
                    .key(key)
                    .arg(capacity)
                    .arg(leak_rate)
                    .arg(cost)
                    .arg(now_ms)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        let level = level
            .parse::<f64>()
            .map_err(|e| StoreError::Codec(format!("bucket level '{}': {}", level, e)))?;
        Ok(BucketOutcome { allowed: allowed == 1, level })
    }

    async fn checked_multi_increment(
        &self,
        checks: &[CounterCheck],
        amount: u64,
    ) -> Result<MultiIncrementOutcome, StoreError> {
        if checks.is_empty() {
            return Ok(MultiIncrementOutcome::Applied(Vec::new()));
        }
        let mut conn = self.conn.clone();
        let script = Script::new(CHECKED_MULTI_INCR);
        let mut invocation = script.prepare_invoke();
        invocation.arg(amount);
        for check in checks {
            invocation.key(check.key.as_str());
            invocation.arg(check.limit).arg(check.ttl.as_millis() as u64);
        }
        let reply: Vec<i64> = self
            .bounded(async move { invocation.invoke_async(&mut conn).await })
            .await?;
        match reply.split_first() {
            Some((1, values)) => Ok(MultiIncrementOutcome::Applied(
                values.iter().map(|&v| v.max(0) as u64).collect(),
            )),
            Some((0, rest)) if rest.len() == 2 => Ok(MultiIncrementOutcome::WouldExceed {
                index: rest[0].max(0) as usize,
                current: rest[1].max(0) as u64,
            }),
            _ => Err(StoreError::Codec(format!("unexpected quota reply: {:?}", reply))),
        }
    }
}
