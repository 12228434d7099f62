//! Process-local counter store.
//!
//! Counts are node-scoped: during an outage of the shared store each node
//! enforces limits on its own traffic only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

use super::counter::{CounterKey, CounterRecord, CounterSnapshot};
use super::{CounterStore, StoreError};

/// In-memory counter store keyed by rendered counter key.
///
/// Each key is updated under its `DashMap` shard lock, so concurrent
/// increments on the same key are never lost.
#[derive(Debug, Default)]
pub struct LocalStore {
    counters: DashMap<String, CounterRecord>,
}

impl LocalStore {
    /// Create an empty local store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn increment(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<CounterSnapshot, StoreError> {
        let mut record = self
            .counters
            .entry(key.to_store_key())
            .or_insert_with(|| CounterRecord::new(key));

        if record.is_expired(now) {
            *record = CounterRecord::new(key);
        }
        record.count += 1;
        let count = record.count;
        drop(record);

        trace!(key = %key, count = count, "Incremented local counter");

        Ok(CounterSnapshot {
            count,
            ttl_remaining: key.ttl_remaining(now),
        })
    }

    async fn get(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<CounterSnapshot, StoreError> {
        let count = self
            .counters
            .get(&key.to_store_key())
            .filter(|record| !record.is_expired(now))
            .map(|record| record.count)
            .unwrap_or(0);

        Ok(CounterSnapshot {
            count,
            ttl_remaining: key.ttl_remaining(now),
        })
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError> {
        self.counters.remove(&key.to_store_key());
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.counters.len();
        self.counters.retain(|_, record| !record.is_expired(now));
        Ok(before.saturating_sub(self.counters.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration;

    // Aligned to a minute boundary.
    const WINDOW_START: i64 = 1_000_000_020;

    fn at_secs(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn minute_key(now: DateTime<Utc>) -> CounterKey {
        CounterKey::at("ip", "10.0.0.1", Duration::from_secs(60), now)
    }

    #[tokio::test]
    async fn test_increment_creates_and_counts() {
        let store = LocalStore::new();
        let now = at_secs(WINDOW_START + 20);
        let key = minute_key(now);

        let first = store.increment(&key, now).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.ttl_remaining, Duration::from_secs(40));

        let second = store.increment(&key, now).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_get_does_not_mutate() {
        let store = LocalStore::new();
        let now = at_secs(WINDOW_START + 20);
        let key = minute_key(now);

        store.increment(&key, now).await.unwrap();
        store.increment(&key, now).await.unwrap();

        for _ in 0..5 {
            assert_eq!(store.get(&key, now).await.unwrap().count, 2);
        }

        let third = store.increment(&key, now).await.unwrap();
        assert_eq!(third.count, 3);
    }

    #[tokio::test]
    async fn test_get_missing_key_is_zero() {
        let store = LocalStore::new();
        let now = at_secs(WINDOW_START + 20);
        let snapshot = store.get(&minute_key(now), now).await.unwrap();
        assert_eq!(snapshot.count, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_reset_zeroes_counter() {
        let store = LocalStore::new();
        let now = at_secs(WINDOW_START + 20);
        let key = minute_key(now);

        store.increment(&key, now).await.unwrap();
        store.reset(&key).await.unwrap();

        assert_eq!(store.get(&key, now).await.unwrap().count, 0);
        assert_eq!(store.increment(&key, now).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_window_boundary_independent_counts() {
        let store = LocalStore::new();
        let window = Duration::from_secs(60);
        let start = at_secs(WINDOW_START);
        let before = start + chrono::Duration::seconds(60) - chrono::Duration::milliseconds(1);
        let after = start + chrono::Duration::seconds(60) + chrono::Duration::milliseconds(1);

        let key_before = CounterKey::at("ip", "10.0.0.1", window, before);
        let key_after = CounterKey::at("ip", "10.0.0.1", window, after);
        assert_ne!(key_before, key_after);

        for _ in 0..3 {
            store.increment(&key_before, before).await.unwrap();
        }
        let snapshot = store.increment(&key_after, after).await.unwrap();
        assert_eq!(snapshot.count, 1);
        assert_eq!(store.get(&key_before, before).await.unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = LocalStore::new();
        let now = at_secs(WINDOW_START + 20);
        let old = minute_key(now);
        let later = now + chrono::Duration::seconds(120);
        let current = minute_key(later);

        store.increment(&old, now).await.unwrap();
        store.increment(&current, later).await.unwrap();

        let removed = store.purge_expired(later).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&current, later).await.unwrap().count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(LocalStore::new());
        let now = at_secs(WINDOW_START + 20);
        let key = minute_key(now);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..500 {
                    store.increment(&key, now).await.unwrap();
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get(&key, now).await.unwrap().count, 4000);
    }
}
