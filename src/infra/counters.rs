//! In-process counter store.

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::application::{
    rate_limit::RateLimitRecord,
    repos::{CounterStore, RepoError, Versioned},
};

#[derive(Debug, Clone)]
struct Slot {
    record: RateLimitRecord,
    version: i64,
    expires_at: Instant,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Counter store for single-process deployments and tests.
///
/// Versions come from one store-wide sequence, so they keep increasing across
/// expiry and [`sweep`](Self::sweep). A writer holding a version read before
/// a record expired can never overwrite its replacement.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    slots: DashMap<String, Slot>,
    versions: AtomicI64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> i64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drop expired entries.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.live(now));
        before - self.slots.len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<RateLimitRecord>>, RepoError> {
        let now = Instant::now();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.live(now))
            .map(|slot| Versioned {
                value: slot.record.clone(),
                version: slot.version,
            }))
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<i64>,
        record: &RateLimitRecord,
        ttl: Duration,
    ) -> Result<bool, RepoError> {
        let now = Instant::now();
        let expires_at = now + ttl;
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let current = slot.live(now).then_some(slot.version);
                if current != expected {
                    return Ok(false);
                }
                slot.version = self.next_version();
                slot.record = record.clone();
                slot.expires_at = expires_at;
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(Slot {
                    record: record.clone(),
                    version: self.next_version(),
                    expires_at,
                });
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(count: u32) -> RateLimitRecord {
        RateLimitRecord {
            window_start_ms: 0,
            count,
            penalty: 1,
            ban_until_ms: None,
        }
    }

    #[tokio::test]
    async fn compare_and_put_rejects_stale_versions() {
        let store = MemoryCounterStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.compare_and_put("k", None, &record(1), ttl).await.expect("insert"));
        assert!(!store.compare_and_put("k", None, &record(9), ttl).await.expect("dup insert"));

        let current = store.get("k").await.expect("get").expect("present");
        assert_eq!(current.value.count, 1);
        assert!(
            store
                .compare_and_put("k", Some(current.version), &record(2), ttl)
                .await
                .expect("update")
        );
        assert!(
            !store
                .compare_and_put("k", Some(current.version), &record(3), ttl)
                .await
                .expect("stale update")
        );
        assert_eq!(store.get("k").await.expect("get").expect("present").value.count, 2);
    }

    #[tokio::test]
    async fn expired_records_read_as_absent() {
        let store = MemoryCounterStore::new();
        assert!(
            store
                .compare_and_put("k", None, &record(1), Duration::ZERO)
                .await
                .expect("insert")
        );
        assert!(store.get("k").await.expect("get").is_none());

        // An expired slot is replaced as if it were vacant.
        assert!(
            store
                .compare_and_put("k", None, &record(2), Duration::from_secs(60))
                .await
                .expect("reinsert")
        );
        let current = store.get("k").await.expect("get").expect("present");
        assert_eq!(current.version, 2);
        assert_eq!(store.sweep(), 0);
    }

    #[tokio::test]
    async fn swept_keys_never_reuse_a_version() {
        let store = MemoryCounterStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.compare_and_put("k", None, &record(1), Duration::ZERO).await.expect("insert"));
        let stale_version = 1;

        assert_eq!(store.sweep(), 1);
        assert!(store.compare_and_put("k", None, &record(2), ttl).await.expect("reinsert"));
        let current = store.get("k").await.expect("get").expect("present");
        assert!(current.version > stale_version);

        assert!(
            !store
                .compare_and_put("k", Some(stale_version), &record(9), ttl)
                .await
                .expect("stale writer")
        );
        assert_eq!(store.get("k").await.expect("get").expect("present").value.count, 2);
    }
}
