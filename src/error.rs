//! Error types for the Turnstile service.

use thiserror::Error;

use crate::mesh::ClusterError;
use crate::store::StoreError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule in the rule table is malformed
    #[error("Invalid rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    /// Counter store errors that escaped failover handling
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Cluster membership errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Build an [`TurnstileError::InvalidRule`] for the named rule.
    pub fn invalid_rule(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        TurnstileError::InvalidRule {
            rule: rule.into(),
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
