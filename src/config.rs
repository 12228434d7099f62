//! Configuration management for Turnstile.
//!
//! The service configuration is read with the `config` crate from a YAML
//! file, layered with `TURNSTILE__`-prefixed environment overrides
//! (`TURNSTILE__FAILOVER__MODE=fail_closed`). The rule table lives in its own
//! YAML file, see [`crate::ratelimit::RulesConfig`].

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::mesh::ClusterConfig;
use crate::ratelimit::PenaltyConfig;
use crate::store::FailoverConfig;

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Gossip cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Failover configuration; its `mode` must be set explicitly
    pub failover: FailoverConfig,

    /// Penalty escalation configuration
    #[serde(default)]
    pub penalty: PenaltyConfig,

    /// Path to the rule table
    pub rules_path: PathBuf,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// How often expired counters, penalties and blocks are swept
    #[serde(
        rename = "sweep_interval_secs",
        default = "default_sweep_interval",
        with = "duration_secs"
    )]
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Live cluster members required before the shared store is used
    #[serde(default = "default_min_live_nodes")]
    pub min_live_nodes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            min_live_nodes: default_min_live_nodes(),
        }
    }
}

fn default_min_live_nodes() -> usize {
    1
}

impl TurnstileConfig {
    /// Load configuration from a YAML file with environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading service configuration");

        let settings = config::Config::builder()
            .add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Yaml,
            ))
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: TurnstileConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.penalty.validate()?;

        if self.failover.failure_threshold == 0 {
            return Err(TurnstileError::Config(
                "failover.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.failover.operation_timeout.is_zero() {
            return Err(TurnstileError::Config(
                "failover.operation_timeout_ms must be positive".to_string(),
            ));
        }
        if self.server.sweep_interval.is_zero() {
            return Err(TurnstileError::Config(
                "server.sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helper for durations expressed in whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serde helper for durations expressed in milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FailureMode;
    use std::io::Write;

    const MINIMAL: &str = r#"
failover:
  mode: fail_open
rules_path: /etc/turnstile/rules.yaml
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = TurnstileConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.server.grpc_addr, default_grpc_addr());
        assert_eq!(config.server.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.store.min_live_nodes, 1);
        assert_eq!(config.failover.mode, FailureMode::FailOpen);
        assert_eq!(config.failover.failure_threshold, 3);
        assert_eq!(config.penalty.escalate_after, 5);
        assert_eq!(config.rules_path, PathBuf::from("/etc/turnstile/rules.yaml"));
    }

    #[test]
    fn test_failure_mode_must_be_explicit() {
        let yaml = r#"
failover:
  failure_threshold: 3
rules_path: rules.yaml
"#;
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
server:
  grpc_addr: 0.0.0.0:9000
  sweep_interval_secs: 5
cluster:
  node_id: node-a
  listen_addr: 10.0.0.5:7946
  advertise_addr: 10.0.0.5:7946
  seed_nodes: ["10.0.0.6:7946"]
  cluster_id: edge
  gossip_interval_ms: 200
store:
  min_live_nodes: 2
failover:
  failure_threshold: 5
  cooldown_ms: 10000
  operation_timeout_ms: 3
  fallback_enabled: false
  mode: fail_closed
penalty:
  warn_after: 2
  penalize_after: 4
  escalate_after: 6
  multiplier_ceiling: 16.0
  decay_period_secs: 120
rules_path: rules.yaml
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.grpc_addr.port(), 9000);
        assert_eq!(config.cluster.node_id, "node-a");
        assert_eq!(config.cluster.gossip_interval, Duration::from_millis(200));
        assert_eq!(config.store.min_live_nodes, 2);
        assert_eq!(config.failover.cooldown, Duration::from_secs(10));
        assert!(!config.failover.fallback_enabled);
        assert_eq!(config.failover.mode, FailureMode::FailClosed);
        assert_eq!(config.penalty.multiplier_ceiling, 16.0);
        assert_eq!(config.penalty.decay_period, Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_penalty_thresholds_rejected() {
        let yaml = r#"
failover:
  mode: fail_open
penalty:
  warn_after: 3
  penalize_after: 2
rules_path: rules.yaml
"#;
        assert!(matches!(
            TurnstileConfig::from_yaml(yaml),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("turnstile-{}.yaml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = TurnstileConfig::load(&path).unwrap();
        assert_eq!(config.failover.mode, FailureMode::FailOpen);

        std::fs::remove_file(&path).unwrap();
    }
}
