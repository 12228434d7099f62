//! Counter store test doubles.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CounterKey, CounterSnapshot, CounterStore, LocalStore, StoreError};

/// A store that can be switched into an outage.
///
/// While healthy it counts like a [`LocalStore`]; while failing every call
/// returns [`StoreError::Unavailable`].
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: LocalStore,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl FlakyStore {
    pub fn failing() -> Self {
        let store = Self::default();
        store.set_failing(true);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of calls the store has received, failed or not.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("flaky", "simulated outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn increment(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<CounterSnapshot, StoreError> {
        self.check()?;
        self.inner.increment(key, now).await
    }

    async fn get(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<CounterSnapshot, StoreError> {
        self.check()?;
        self.inner.get(key, now).await
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError> {
        self.check()?;
        self.inner.reset(key).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.purge_expired(now).await
    }
}

/// A store whose every call takes longer than any sane operation budget.
#[derive(Debug)]
pub struct SlowStore {
    delay: Duration,
    calls: AtomicU64,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of calls that reached the store, finished or not.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn stall(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
    }
}

#[async_trait]
impl CounterStore for SlowStore {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn increment(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<CounterSnapshot, StoreError> {
        self.stall().await;
        Ok(CounterSnapshot {
            count: 1,
            ttl_remaining: key.ttl_remaining(now),
        })
    }

    async fn get(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<CounterSnapshot, StoreError> {
        self.stall().await;
        Ok(CounterSnapshot {
            count: 0,
            ttl_remaining: key.ttl_remaining(now),
        })
    }

    async fn reset(&self, _key: &CounterKey) -> Result<(), StoreError> {
        self.stall().await;
        Ok(())
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(0)
    }
}
