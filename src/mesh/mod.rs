//! Peer mesh networking module using Chitchat.
//!
//! This module implements the peer-to-peer mesh network that replicates
//! counter contributions between Turnstile nodes. It uses the chitchat
//! library for gossip-based cluster membership and state dissemination.

mod cluster;

pub use cluster::{baseline_key, strip_baseline_prefix, Cluster, ClusterConfig, ClusterError};
