//! Counter store backed by the gossip cluster.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::counter::{CounterKey, CounterSnapshot};
use super::{CounterStore, StoreError};
use crate::mesh::{strip_baseline_prefix, Cluster};

/// Shared counter store replicated through the chitchat cluster.
///
/// Counts converge across nodes within a few gossip rounds. The store
/// reports itself unavailable when fewer than `min_live_nodes` peers are
/// visible, which makes a partitioned node fall back to local counting.
pub struct ClusterStore {
    cluster: Arc<Cluster>,
    min_live_nodes: usize,
}

impl ClusterStore {
    /// Create a store over a running cluster.
    pub fn new(cluster: Arc<Cluster>, min_live_nodes: usize) -> Self {
        Self {
            cluster,
            min_live_nodes: min_live_nodes.max(1),
        }
    }

    async fn ensure_quorum(&self) -> Result<(), StoreError> {
        let live = self.cluster.live_node_count().await;
        if live < self.min_live_nodes {
            return Err(StoreError::unavailable(
                self.name(),
                format!("{} live nodes, {} required", live, self.min_live_nodes),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for ClusterStore {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn increment(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<CounterSnapshot, StoreError> {
        self.ensure_quorum().await?;

        let count = self.cluster.increment_counter(&key.to_store_key(), 1).await;
        trace!(key = %key, count = count, "Incremented cluster counter");

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
        self.ensure_quorum().await?;

        let count = if key.is_expired(now) {
            0
        } else {
            self.cluster.get_count(&key.to_store_key()).await
        };

        Ok(CounterSnapshot {
            count,
            ttl_remaining: key.ttl_remaining(now),
        })
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError> {
        self.cluster.reset_counter(&key.to_store_key()).await;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self
            .cluster
            .remove_local_keys(|raw| {
                CounterKey::from_store_key(strip_baseline_prefix(raw))
                    .map(|key| key.is_expired(now))
                    .unwrap_or(false)
            })
            .await;

        debug!(removed = removed, "Purged expired cluster counters");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ClusterConfig;
    use chrono::TimeZone;
    use std::time::Duration;

    fn test_cluster_config(port: u16) -> ClusterConfig {
        let addr: std::net::SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    fn at_secs(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_cluster_store_increment_get_reset() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18946)).await.unwrap());

        {
            let store = ClusterStore::new(cluster.clone(), 1);
            let now = at_secs(1_000_000_030);
            let key = CounterKey::at("ip", "10.0.0.1", Duration::from_secs(60), now);

            assert_eq!(store.increment(&key, now).await.unwrap().count, 1);
            let snapshot = store.increment(&key, now).await.unwrap();
            assert_eq!(snapshot.count, 2);
            assert_eq!(snapshot.ttl_remaining, Duration::from_secs(50));

            assert_eq!(store.get(&key, now).await.unwrap().count, 2);
            assert_eq!(store.get(&key, now).await.unwrap().count, 2);

            store.reset(&key).await.unwrap();
            assert_eq!(store.get(&key, now).await.unwrap().count, 0);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_store_requires_quorum() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18947)).await.unwrap());

        {
            let store = ClusterStore::new(cluster.clone(), 2);
            let now = at_secs(1_000_000_030);
            let key = CounterKey::at("ip", "10.0.0.1", Duration::from_secs(60), now);

            let err = store.increment(&key, now).await.unwrap_err();
            assert!(matches!(err, StoreError::Unavailable { backend: "cluster", .. }));
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_store_purge_expired() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18948)).await.unwrap());

        {
            let store = ClusterStore::new(cluster.clone(), 1);
            let now = at_secs(1_000_000_030);
            let key = CounterKey::at("ip", "10.0.0.2", Duration::from_secs(60), now);

            store.increment(&key, now).await.unwrap();
            store.reset(&key).await.unwrap();

            // Counter and its baseline are both gone once the window closes
            let later = now + chrono::Duration::seconds(120);
            assert_eq!(store.purge_expired(later).await.unwrap(), 2);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }
}
