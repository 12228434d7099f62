//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and state gossip for the shared counter store.
//! Every node publishes its own contribution to each counter; the cluster
//! value of a counter is the sum over live nodes minus the highest reset
//! baseline any node has published for it.

use std::net::SocketAddr;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::duration_millis;

/// Prefix of the key holding a counter's reset baseline.
const BASELINE_PREFIX: &str = "reset|";

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Unique node identifier.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// The address to listen on for gossip.
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    #[serde(default = "default_gossip_addr")]
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    #[serde(default)]
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
    /// How often to gossip with peers.
    #[serde(
        rename = "gossip_interval_ms",
        default = "default_gossip_interval",
        with = "duration_millis"
    )]
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    #[serde(
        rename = "dead_node_grace_period_ms",
        default = "default_dead_node_grace_period",
        with = "duration_millis"
    )]
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            listen_addr: default_gossip_addr(),
            advertise_addr: default_gossip_addr(),
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval: default_gossip_interval(),
            dead_node_grace_period: default_dead_node_grace_period(),
        }
    }
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "turnstile".to_string()
}

fn default_gossip_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_dead_node_grace_period() -> Duration {
    Duration::from_secs(3600)
}

/// The cluster handle for distributed counter state.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    config: ClusterConfig,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            config,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Increment our contribution to a counter and return the cluster total.
    ///
    /// The read-modify-write of our own contribution happens under the
    /// chitchat state lock, so concurrent local callers never lose updates.
    pub async fn increment_counter(&self, key: &str, amount: u64) -> u64 {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current_local: u64 = chitchat
            .self_node_state()
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let new_local = current_local + amount;
        chitchat.self_node_state().set(key, new_local.to_string());

        debug!(key = %key, local_value = new_local, "Incremented local contribution");

        Self::total_internal(&chitchat, key)
    }

    /// Get the cluster total for a counter.
    pub async fn get_count(&self, key: &str) -> u64 {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        Self::total_internal(&chitchat, key)
    }

    /// Zero a counter cluster-wide by publishing the current raw sum as its baseline.
    ///
    /// Returns the baseline that was published.
    pub async fn reset_counter(&self, key: &str) -> u64 {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let baseline = Self::raw_sum(&chitchat, key);
        chitchat
            .self_node_state()
            .set(&baseline_key(key), baseline.to_string());

        info!(key = %key, baseline = baseline, "Published counter reset baseline");
        baseline
    }

    /// Delete our own keys matching a predicate. Returns the number deleted.
    pub async fn remove_local_keys<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let doomed: Vec<String> = chitchat
            .self_node_state()
            .key_values()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.to_string())
            .collect();

        let node_state = chitchat.self_node_state();
        for key in &doomed {
            node_state.delete(key);
        }

        doomed.len()
    }

    /// Total for a counter: raw sum minus the highest published baseline.
    fn total_internal(chitchat: &Chitchat, key: &str) -> u64 {
        let raw = Self::raw_sum(chitchat, key);
        let baseline = Self::max_value(chitchat, &baseline_key(key));
        raw.saturating_sub(baseline)
    }

    /// Sum a key across all live nodes (including ourselves).
    fn raw_sum(chitchat: &Chitchat, key: &str) -> u64 {
        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|state| state.get(key).and_then(|v| v.parse::<u64>().ok()))
            .sum()
    }

    /// Highest value of a key across all live nodes.
    fn max_value(chitchat: &Chitchat, key: &str) -> u64 {
        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|state| state.get(key).and_then(|v| v.parse::<u64>().ok()))
            .max()
            .unwrap_or(0)
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

/// Key under which a counter's reset baseline is published.
pub fn baseline_key(key: &str) -> String {
    format!("{}{}", BASELINE_PREFIX, key)
}

/// Strip the baseline prefix from a key, if present.
pub fn strip_baseline_prefix(key: &str) -> &str {
    key.strip_prefix(BASELINE_PREFIX).unwrap_or(key)
}
