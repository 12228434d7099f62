//! Failover between the primary and fallback counter stores.
//!
//! The controller is a small state machine:
//!
//! - `Healthy`: calls go to the primary under the operation timeout. Each
//!   failed call is retried on the fallback; `failure_threshold` consecutive
//!   failures move the controller to `Degraded`.
//! - `Degraded`: calls go straight to the fallback until the cool-down
//!   elapses, then the controller moves to `ColdRetry`.
//! - `ColdRetry`: the first call after the cool-down claims the probe and
//!   tries the primary; concurrent calls keep using the fallback. Success
//!   returns to `Healthy`, failure returns to `Degraded`. A probe that never
//!   reports back is given up after another cool-down.
//!
//! When neither store can serve a call the error reaches the caller, which
//! applies the configured [`FailureMode`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use super::counter::{CounterKey, CounterSnapshot};
use super::{CounterStore, StoreError};
use crate::config::duration_millis;

/// Behaviour when no counter store is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Admit requests, prioritising availability.
    FailOpen,
    /// Reject requests, prioritising protection.
    FailClosed,
}

impl FailureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureMode::FailOpen => "fail_open",
            FailureMode::FailClosed => "fail_closed",
        }
    }
}

/// Failover configuration.
///
/// `mode` has no default: a configuration must name it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Consecutive primary failures before routing to the fallback
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long to stay on the fallback before probing the primary again
    #[serde(
        rename = "cooldown_ms",
        default = "default_cooldown",
        with = "duration_millis"
    )]
    pub cooldown: Duration,

    /// Upper bound on a single primary store call
    #[serde(
        rename = "operation_timeout_ms",
        default = "default_operation_timeout",
        with = "duration_millis"
    )]
    pub operation_timeout: Duration,

    /// Whether the process-local fallback store is used at all
    #[serde(default = "default_fallback_enabled")]
    pub fallback_enabled: bool,

    /// Behaviour when no store is reachable
    pub mode: FailureMode,
}

impl FailoverConfig {
    /// Create a configuration with default thresholds for the given mode.
    pub fn new(mode: FailureMode) -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
            operation_timeout: default_operation_timeout(),
            fallback_enabled: default_fallback_enabled(),
            mode,
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_operation_timeout() -> Duration {
    Duration::from_millis(2)
}

fn default_fallback_enabled() -> bool {
    true
}

/// Which backend the controller currently routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Primary is serving traffic
    Healthy,
    /// Primary is considered down; fallback serves traffic
    Degraded { since: Instant },
    /// Cool-down elapsed; one call is probing the primary
    ColdRetry { since: Instant },
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Healthy => "healthy",
            BackendState::Degraded { .. } => "degraded",
            BackendState::ColdRetry { .. } => "cold_retry",
        }
    }
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverStatus {
    pub state: &'static str,
    pub consecutive_failures: u64,
    pub mode: FailureMode,
    pub fallback_enabled: bool,
}

#[derive(Debug)]
struct Inner {
    state: BackendState,
    consecutive_failures: u64,
}

/// Counter store that routes between a primary and a fallback store.
pub struct FailoverStore {
    primary: Arc<dyn CounterStore>,
    fallback: Option<Arc<dyn CounterStore>>,
    config: FailoverConfig,
    inner: Mutex<Inner>,
}

impl FailoverStore {
    /// Create a failover store. The fallback is ignored when the
    /// configuration disables it.
    pub fn new(
        primary: Arc<dyn CounterStore>,
        fallback: Option<Arc<dyn CounterStore>>,
        config: FailoverConfig,
    ) -> Self {
        let fallback = if config.fallback_enabled { fallback } else { None };
        Self {
            primary,
            fallback,
            config,
            inner: Mutex::new(Inner {
                state: BackendState::Healthy,
                consecutive_failures: 0,
            }),
        }
    }

    /// Current backend state.
    pub fn state(&self) -> BackendState {
        self.inner.lock().state
    }

    /// Configured failure mode.
    pub fn mode(&self) -> FailureMode {
        self.config.mode
    }

    /// Active configuration.
    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Snapshot of the controller state.
    pub fn status(&self) -> FailoverStatus {
        let inner = self.inner.lock();
        FailoverStatus {
            state: inner.state.as_str(),
            consecutive_failures: inner.consecutive_failures,
            mode: self.config.mode,
            fallback_enabled: self.fallback.is_some(),
        }
    }

    /// Decide whether the next call should go to the primary.
    ///
    /// Outside `Healthy` at most one caller at a time is sent to the primary.
    fn select_primary(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BackendState::Healthy => true,
            BackendState::Degraded { since } | BackendState::ColdRetry { since }
                if since.elapsed() >= self.config.cooldown =>
            {
                info!(
                    backend = self.primary.name(),
                    previous = inner.state.as_str(),
                    "Failover cool-down elapsed, probing primary store"
                );
                inner.state = BackendState::ColdRetry {
                    since: Instant::now(),
                };
                true
            }
            BackendState::Degraded { .. } | BackendState::ColdRetry { .. } => false,
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state != BackendState::Healthy {
            info!(
                backend = self.primary.name(),
                previous = inner.state.as_str(),
                "Primary store recovered"
            );
            inner.state = BackendState::Healthy;
        }
    }

    fn record_failure(&self, err: &StoreError) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;

        match inner.state {
            BackendState::Healthy => {
                if inner.consecutive_failures >= u64::from(self.config.failure_threshold) {
                    warn!(
                        backend = self.primary.name(),
                        failures = inner.consecutive_failures,
                        error = %err,
                        cooldown = ?self.config.cooldown,
                        "Primary store failing, routing to fallback"
                    );
                    inner.state = BackendState::Degraded {
                        since: Instant::now(),
                    };
                } else {
                    warn!(
                        backend = self.primary.name(),
                        failures = inner.consecutive_failures,
                        error = %err,
                        "Primary store call failed"
                    );
                }
            }
            BackendState::ColdRetry { .. } => {
                warn!(
                    backend = self.primary.name(),
                    error = %err,
                    "Primary store probe failed, staying on fallback"
                );
                inner.state = BackendState::Degraded {
                    since: Instant::now(),
                };
            }
            BackendState::Degraded { .. } => {}
        }
    }

    /// Run a primary call under the operation timeout.
    async fn guarded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.operation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                backend: self.primary.name(),
                after: self.config.operation_timeout,
            }),
        }
    }

    fn fallback(&self) -> Result<&Arc<dyn CounterStore>, StoreError> {
        self.fallback
            .as_ref()
            .ok_or_else(|| StoreError::unavailable("failover", "primary down and no fallback"))
    }
}

#[async_trait]
impl CounterStore for FailoverStore {
    fn name(&self) -> &'static str {
        "failover"
    }

    async fn increment(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<CounterSnapshot, StoreError> {
        if self.select_primary() {
            match self.guarded(self.primary.increment(key, now)).await {
                Ok(snapshot) => {
                    self.record_success();
                    return Ok(snapshot);
                }
                Err(err) => self.record_failure(&err),
            }
        }
        self.fallback()?.increment(key, now).await
    }

    async fn get(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<CounterSnapshot, StoreError> {
        if self.select_primary() {
            match self.guarded(self.primary.get(key, now)).await {
                Ok(snapshot) => {
                    self.record_success();
                    return Ok(snapshot);
                }
                Err(err) => self.record_failure(&err),
            }
        }
        self.fallback()?.get(key, now).await
    }

    /// Resets go to both stores so no stale count survives a failover.
    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError> {
        let primary = self.guarded(self.primary.reset(key)).await;
        if let Err(ref err) = primary {
            warn!(key = %key, error = %err, "Primary store reset failed");
        }

        match &self.fallback {
            Some(fallback) => fallback.reset(key).await,
            None => primary,
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;

        if self.state() == BackendState::Healthy {
            match self.primary.purge_expired(now).await {
                Ok(count) => removed += count,
                Err(err) => warn!(error = %err, "Primary store purge failed"),
            }
        }

        if let Some(fallback) = &self.fallback {
            removed += fallback.purge_expired(now).await?;
        }

        Ok(removed)
    }
}
