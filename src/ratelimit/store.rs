//! Counter store trait for abstracting in-memory and durable backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by a counter store.
///
/// These are faults. The limiter never turns them into an allow or deny
/// decision; callers choose between failing open and failing closed.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("No live counter for key: {0}")]
    MissingRecord(String),
    #[error("Corrupt counter for key {key}: {reason}")]
    CorruptRecord { key: String, reason: String },
}

/// Result type for counter store operations.
pub type StoreResult<T> = std::result::Result<T, BackendError>;

/// A per-key counter as seen by a single read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterRecord {
    /// The rate limited key
    pub key: String,
    /// Requests counted in the current window
    pub count: u64,
    /// Wall-clock time after which the record is void
    pub expires_at: DateTime<Utc>,
    /// Time remaining until expiry, measured at read time
    pub ttl: Duration,
}

impl CounterRecord {
    /// Build a record from a count and the remaining time to live.
    pub fn new(key: &str, count: u64, ttl: Duration) -> Self {
        Self {
            key: key.to_string(),
            count,
            expires_at: expiry_from_now(ttl),
            ttl,
        }
    }

    /// The record written when a key opens a new window.
    pub fn fresh(key: &str, window: Duration) -> Self {
        Self::new(key, 1, window)
    }
}

fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Result of an increment-and-check against a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitOutcome {
    /// The hit was counted; the record holds the updated count.
    Allowed(CounterRecord),
    /// The key was already at its limit; nothing was counted.
    Exceeded(CounterRecord),
}

impl HitOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, HitOutcome::Allowed(_))
    }

    pub fn record(&self) -> &CounterRecord {
        match self {
            HitOutcome::Allowed(record) | HitOutcome::Exceeded(record) => record,
        }
    }
}

/// Persistence for per-key counters with expiry.
///
/// `get`, `create` and `increment` are the minimal capability. Stores with
/// native atomic primitives should also override `create_if_absent` and
/// `increment_and_check`; the provided defaults compose the minimal
/// operations and can let concurrent callers past the limit.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the live record for a key. Expired records read as `None`.
    async fn get(&self, key: &str) -> StoreResult<Option<CounterRecord>>;

    /// Write a record with count 1 expiring after `window`, replacing any
    /// existing record.
    async fn create(&self, key: &str, window: Duration) -> StoreResult<()>;

    /// Atomically add one to a live record without touching its expiry.
    ///
    /// Fails with [`BackendError::MissingRecord`] if the key has no live
    /// record.
    async fn increment(&self, key: &str) -> StoreResult<()>;

    /// Delete the record for a key. Returns whether a live record existed.
    async fn remove(&self, key: &str) -> StoreResult<bool>;

    /// Write a fresh record only if the key has no live one.
    ///
    /// Returns `true` if this call opened the window.
    async fn create_if_absent(&self, key: &str, window: Duration) -> StoreResult<bool> {
        if self.get(key).await?.is_some() {
            return Ok(false);
        }
        self.create(key, window).await?;
        Ok(true)
    }

    /// Count a hit unless the key is already at `limit`.
    ///
    /// An absent key opens a new window with count 1. A key at or above the
    /// limit is reported as exceeded and not incremented.
    async fn increment_and_check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> StoreResult<HitOutcome> {
        let record = match self.get(key).await? {
            Some(record) => record,
            None => {
                if self.create_if_absent(key, window).await? {
                    return Ok(HitOutcome::Allowed(CounterRecord::fresh(key, window)));
                }
                // Another caller opened the window between our read and write.
                match self.get(key).await? {
                    Some(record) => record,
                    None => {
                        self.create(key, window).await?;
                        return Ok(HitOutcome::Allowed(CounterRecord::fresh(key, window)));
                    }
                }
            }
        };

        if record.count >= limit {
            return Ok(HitOutcome::Exceeded(record));
        }

        match self.increment(key).await {
            Ok(()) => Ok(HitOutcome::Allowed(CounterRecord {
                count: record.count + 1,
                ..record
            })),
            Err(BackendError::MissingRecord(_)) => {
                // The window lapsed between the read and the increment.
                self.create(key, window).await?;
                Ok(HitOutcome::Allowed(CounterRecord::fresh(key, window)))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<CounterRecord>> {
        (**self).get(key).await
    }

    async fn create(&self, key: &str, window: Duration) -> StoreResult<()> {
        (**self).create(key, window).await
    }

    async fn increment(&self, key: &str) -> StoreResult<()> {
        (**self).increment(key).await
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        (**self).remove(key).await
    }

    async fn create_if_absent(&self, key: &str, window: Duration) -> StoreResult<bool> {
        (**self).create_if_absent(key, window).await
    }

    async fn increment_and_check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> StoreResult<HitOutcome> {
        (**self).increment_and_check(key, limit, window).await
    }
}
