//! In-memory counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::store::{BackendError, CounterRecord, CounterStore, HitOutcome, StoreResult};

/// Deadline used when `now + window` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    deadline: Instant,
}

impl Slot {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            deadline: now
                .checked_add(window)
                .or_else(|| now.checked_add(FAR_FUTURE))
                .unwrap_or(now),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.deadline
    }

    fn to_record(self, key: &str, now: Instant) -> CounterRecord {
        CounterRecord::new(key, self.count, self.deadline.saturating_duration_since(now))
    }
}

/// A counter store backed by a concurrent hash map.
///
/// Suitable for tests and single-process deployments. Every operation on a
/// key runs under that key's shard lock, so `increment_and_check` is atomic
/// with respect to other callers in the same process. Expired records are
/// ignored on read and reclaimed by [`MemoryCounterStore::purge_expired`].
#[derive(Debug, Clone, Default)]
pub struct MemoryCounterStore {
    slots: Arc<DashMap<String, Slot>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.slots.len())
    }

    /// Number of records held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Spawn a task that purges expired records every `interval`.
    ///
    /// The task runs until the returned handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "Purged expired counters");
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<CounterRecord>> {
        let now = Instant::now();
        Ok(self
            .slots
            .get(key)
            .map(|slot| *slot.value())
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.to_record(key, now)))
    }

    async fn create(&self, key: &str, window: Duration) -> StoreResult<()> {
        self.slots
            .insert(key.to_string(), Slot::fresh(Instant::now(), window));
        Ok(())
    }

    async fn increment(&self, key: &str) -> StoreResult<()> {
        let now = Instant::now();
        match self.slots.get_mut(key) {
            Some(mut slot) if slot.is_live(now) => {
                slot.count += 1;
                Ok(())
            }
            _ => Err(BackendError::MissingRecord(key.to_string())),
        }
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .slots
            .remove(key)
            .is_some_and(|(_, slot)| slot.is_live(now)))
    }

    async fn create_if_absent(&self, key: &str, window: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().is_live(now) => Ok(false),
            Entry::Occupied(mut entry) => {
                entry.insert(Slot::fresh(now, window));
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::fresh(now, window));
                Ok(true)
            }
        }
    }

    async fn increment_and_check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> StoreResult<HitOutcome> {
        let now = Instant::now();
        let outcome = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                if !slot.is_live(now) {
                    *slot = Slot::fresh(now, window);
                    HitOutcome::Allowed(slot.to_record(key, now))
                } else if slot.count >= limit {
                    HitOutcome::Exceeded(slot.to_record(key, now))
                } else {
                    slot.count += 1;
                    HitOutcome::Allowed(slot.to_record(key, now))
                }
            }
            Entry::Vacant(entry) => {
                let slot = entry.insert(Slot::fresh(now, window));
                HitOutcome::Allowed(slot.to_record(key, now))
            }
        };

        trace!(key, count = outcome.record().count, allowed = outcome.is_allowed(), "Counted hit");
        Ok(outcome)
    }
}
