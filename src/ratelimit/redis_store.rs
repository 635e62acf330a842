//! Redis-backed counter store.
//!
//! Each counter is a single integer key named `<prefix>:<key>` whose Redis
//! TTL is the record's expiry, so stale windows are evicted by Redis itself.
//! Conditional creation uses `SET NX PX`; increments and the combined
//! increment-and-check run as Lua scripts so they execute atomically on the
//! server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Script;
use tracing::{info, warn};

use super::store::{BackendError, CounterRecord, CounterStore, HitOutcome, StoreResult};

/// Default namespace for counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// Increment only if the key exists, so a lapsed window is never revived
/// without a TTL.
const INCREMENT_EXISTING: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return redis.call('INCR', KEYS[1])
end
return false
";

/// Returns `{allowed, count, pttl_ms}`. A key without a TTL is treated as
/// a lapsed window and reopened.
const INCREMENT_AND_CHECK: &str = r"
local current = redis.call('GET', KEYS[1])
if (not current) or redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('SET', KEYS[1], 1, 'PX', ARGV[2])
  return {1, 1, tonumber(ARGV[2])}
end
current = tonumber(current)
if current >= tonumber(ARGV[1]) then
  return {0, current, redis.call('PTTL', KEYS[1])}
end
local updated = redis.call('INCR', KEYS[1])
return {1, updated, redis.call('PTTL', KEYS[1])}
";

/// A durable counter store backed by Redis.
pub struct RedisCounterStore {
    manager: ConnectionManager,
    prefix: String,
    increment_existing: Script,
    increment_and_check: Script,
}

/// Limits on establishing the Redis connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedisConnectOptions {
    /// Deadline for each connection attempt, and for `connect` as a whole
    pub connect_timeout: Duration,
    /// Reconnect attempts after the first failure
    pub retries: usize,
}

impl Default for RedisConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            retries: 2,
        }
    }
}

impl RedisCounterStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`) with the
    /// default connection limits.
    pub async fn connect(url: &str, prefix: &str) -> StoreResult<Self> {
        Self::connect_with(url, prefix, RedisConnectOptions::default()).await
    }

    /// Connect to Redis at `url`, failing with [`BackendError::Unavailable`]
    /// once `options.connect_timeout` has elapsed.
    pub async fn connect_with(
        url: &str,
        prefix: &str,
        options: RedisConnectOptions,
    ) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(options.retries)
            .set_connection_timeout(options.connect_timeout);

        let manager = tokio::time::timeout(
            options.connect_timeout,
            client.get_connection_manager_with_config(manager_config),
        )
        .await
        .map_err(|_| {
            warn!(timeout = ?options.connect_timeout, "Timed out connecting to Redis");
            BackendError::Unavailable(format!(
                "timed out after {:?} connecting to Redis",
                options.connect_timeout
            ))
        })?
        .map_err(|e| {
            warn!(error = %e, "Failed to connect to Redis");
            BackendError::Unavailable(e.to_string())
        })?;

        info!(prefix, "Connected to Redis counter store");

        Ok(Self {
            manager,
            prefix: prefix.to_string(),
            increment_existing: Script::new(INCREMENT_EXISTING),
            increment_and_check: Script::new(INCREMENT_AND_CHECK),
        })
    }

    /// The key prefix this store writes under.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn make_key(&self, key: &str) -> String {
        namespaced(&self.prefix, key)
    }
}

fn namespaced(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}:{}", prefix, key)
    }
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn ttl_from_pttl(key: &str, pttl: i64) -> StoreResult<Duration> {
    u64::try_from(pttl)
        .map(Duration::from_millis)
        .map_err(|_| BackendError::CorruptRecord {
            key: key.to_string(),
            reason: format!("counter has no expiry (PTTL {})", pttl),
        })
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<CounterRecord>> {
        let full_key = self.make_key(key);
        let mut conn = self.manager.clone();

        let (count, pttl): (Option<u64>, i64) = redis::pipe()
            .atomic()
            .get(&full_key)
            .pttl(&full_key)
            .query_async(&mut conn)
            .await?;

        match count {
            // PTTL -2 means the key lapsed between commands; MULTI rules
            // that out, but treat it as absent regardless.
            None => Ok(None),
            Some(_) if pttl == -2 => Ok(None),
            Some(count) => Ok(Some(CounterRecord::new(key, count, ttl_from_pttl(key, pttl)?))),
        }
    }

    async fn create(&self, key: &str, window: Duration) -> StoreResult<()> {
        let full_key = self.make_key(key);
        let mut conn = self.manager.clone();

        let _: () = redis::cmd("SET")
            .arg(&full_key)
            .arg(1)
            .arg("PX")
            .arg(window_millis(window))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> StoreResult<()> {
        let full_key = self.make_key(key);
        let mut conn = self.manager.clone();

        let updated: Option<u64> = self
            .increment_existing
            .key(&full_key)
            .invoke_async(&mut conn)
            .await?;

        match updated {
            Some(_) => Ok(()),
            None => Err(BackendError::MissingRecord(key.to_string())),
        }
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        let full_key = self.make_key(key);
        let mut conn = self.manager.clone();

        let removed: u64 = redis::cmd("DEL").arg(&full_key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn create_if_absent(&self, key: &str, window: Duration) -> StoreResult<bool> {
        let full_key = self.make_key(key);
        let mut conn = self.manager.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(window_millis(window))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn increment_and_check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> StoreResult<HitOutcome> {
        let full_key = self.make_key(key);
        let mut conn = self.manager.clone();

        let (allowed, count, pttl): (i64, u64, i64) = self
            .increment_and_check
            .key(&full_key)
            .arg(limit)
            .arg(window_millis(window))
            .invoke_async(&mut conn)
            .await?;

        let record = CounterRecord::new(key, count, ttl_from_pttl(key, pttl)?);
        if allowed == 1 {
            Ok(HitOutcome::Allowed(record))
        } else {
            Ok(HitOutcome::Exceeded(record))
        }
    }
}
