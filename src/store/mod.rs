//! Counter storage backends.
//!
//! The [`CounterStore`] trait abstracts over the process-local
//! [`LocalStore`] and the gossip-replicated [`ClusterStore`], and the
//! [`FailoverStore`] routes between a primary and a fallback store.

mod cluster;
mod counter;
mod failover;
mod local;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub use cluster::ClusterStore;
pub use counter::{epoch_millis, CounterKey, CounterRecord, CounterSnapshot};
pub use failover::{BackendState, FailoverConfig, FailoverStatus, FailoverStore, FailureMode};
pub use local::LocalStore;

/// Errors returned by counter stores.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("{backend} store unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },

    /// The backend did not answer within the operation budget.
    #[error("{backend} store timed out after {after:?}")]
    Timeout {
        backend: &'static str,
        after: Duration,
    },
}

impl StoreError {
    /// Create an unavailability error for a backend.
    pub fn unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        StoreError::Unavailable {
            backend,
            reason: reason.into(),
        }
    }
}

/// Trait for counter store implementations.
///
/// `increment` must be atomic per key across all concurrent callers.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Increment the counter for `key` and return the post-increment count.
    async fn increment(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<CounterSnapshot, StoreError>;

    /// Read the counter for `key` without modifying it.
    async fn get(&self, key: &CounterKey, now: DateTime<Utc>)
        -> Result<CounterSnapshot, StoreError>;

    /// Administratively zero the counter for `key`.
    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError>;

    /// Drop records whose window has closed. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}
