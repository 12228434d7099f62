//! Escalating penalties for repeat offenders.
//!
//! Each denied request counts as a violation against the caller's
//! principal. Violations move the caller up through [`PenaltyLevel`]s, and
//! every level above `Clean` divides the caller's limits by a multiplier.
//! Quiet periods step the level back down one `decay_period` at a time.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::offset;
use crate::config::duration_secs;
use crate::error::{Result, TurnstileError};

/// Penalty escalation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltyConfig {
    /// Violations before `Warned`
    #[serde(default = "default_warn_after")]
    pub warn_after: u32,

    /// Violations before `Penalized`
    #[serde(default = "default_penalize_after")]
    pub penalize_after: u32,

    /// Violations before `Escalated`
    #[serde(default = "default_escalate_after")]
    pub escalate_after: u32,

    /// Largest multiplier ever applied; `Escalated` always uses it
    #[serde(default = "default_multiplier_ceiling")]
    pub multiplier_ceiling: f64,

    /// Quiet time needed to step down one level
    #[serde(
        rename = "decay_period_secs",
        default = "default_decay_period",
        with = "duration_secs"
    )]
    pub decay_period: Duration,

    /// Violations further apart than this do not accumulate
    #[serde(
        rename = "observation_period_secs",
        default = "default_observation_period",
        with = "duration_secs"
    )]
    pub observation_period: Duration,

    /// Inactive penalty states are dropped after this long
    #[serde(
        rename = "state_ttl_secs",
        default = "default_state_ttl",
        with = "duration_secs"
    )]
    pub state_ttl: Duration,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            warn_after: default_warn_after(),
            penalize_after: default_penalize_after(),
            escalate_after: default_escalate_after(),
            multiplier_ceiling: default_multiplier_ceiling(),
            decay_period: default_decay_period(),
            observation_period: default_observation_period(),
            state_ttl: default_state_ttl(),
        }
    }
}

fn default_warn_after() -> u32 {
    1
}

fn default_penalize_after() -> u32 {
    3
}

fn default_escalate_after() -> u32 {
    5
}

fn default_multiplier_ceiling() -> f64 {
    8.0
}

fn default_decay_period() -> Duration {
    Duration::from_secs(300)
}

fn default_observation_period() -> Duration {
    Duration::from_secs(600)
}

fn default_state_ttl() -> Duration {
    Duration::from_secs(3600)
}

impl PenaltyConfig {
    /// Check that thresholds are ordered and the multiplier is sane.
    pub fn validate(&self) -> Result<()> {
        if self.warn_after == 0
            || self.warn_after >= self.penalize_after
            || self.penalize_after >= self.escalate_after
        {
            return Err(TurnstileError::Config(format!(
                "penalty thresholds must satisfy 0 < warn_after < penalize_after < escalate_after (got {}/{}/{})",
                self.warn_after, self.penalize_after, self.escalate_after
            )));
        }
        if !self.multiplier_ceiling.is_finite() || self.multiplier_ceiling < 1.0 {
            return Err(TurnstileError::Config(
                "penalty.multiplier_ceiling must be at least 1.0".to_string(),
            ));
        }
        if self.decay_period.is_zero() {
            return Err(TurnstileError::Config(
                "penalty.decay_period_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Violation count at which `level` begins.
    pub fn threshold_for(&self, level: PenaltyLevel) -> u32 {
        match level {
            PenaltyLevel::Clean => 0,
            PenaltyLevel::Warned => self.warn_after,
            PenaltyLevel::Penalized => self.penalize_after,
            PenaltyLevel::Escalated => self.escalate_after,
        }
    }

    /// Level reached after `violations` violations.
    pub fn level_for(&self, violations: u32) -> PenaltyLevel {
        if violations >= self.escalate_after {
            PenaltyLevel::Escalated
        } else if violations >= self.penalize_after {
            PenaltyLevel::Penalized
        } else if violations >= self.warn_after {
            PenaltyLevel::Warned
        } else {
            PenaltyLevel::Clean
        }
    }

    /// Multiplier applied at `level`.
    pub fn multiplier_for(&self, level: PenaltyLevel) -> f64 {
        match level {
            PenaltyLevel::Clean => 1.0,
            PenaltyLevel::Escalated => self.multiplier_ceiling,
            other => 2f64.powi(other as i32).min(self.multiplier_ceiling),
        }
    }
}

/// How badly a caller has behaved recently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PenaltyLevel {
    Clean = 0,
    Warned = 1,
    Penalized = 2,
    Escalated = 3,
}

impl PenaltyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PenaltyLevel::Clean => "clean",
            PenaltyLevel::Warned => "warned",
            PenaltyLevel::Penalized => "penalized",
            PenaltyLevel::Escalated => "escalated",
        }
    }

    fn step_down(self) -> Self {
        match self {
            PenaltyLevel::Escalated => PenaltyLevel::Penalized,
            PenaltyLevel::Penalized => PenaltyLevel::Warned,
            PenaltyLevel::Warned | PenaltyLevel::Clean => PenaltyLevel::Clean,
        }
    }
}

/// Penalty state for one principal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PenaltyState {
    /// Principal key, `user:<id>` or `ip:<addr>`
    pub identity: String,
    pub level: PenaltyLevel,
    pub violation_count: u32,
    /// Divisor applied to every limit for this principal, `>= 1.0`
    pub multiplier: f64,
    pub last_violation_at: Option<DateTime<Utc>>,
    /// When the level next steps down, if no violation happens first
    pub decay_deadline: DateTime<Utc>,
}

impl PenaltyState {
    fn new(identity: &str, now: DateTime<Utc>) -> Self {
        Self {
            identity: identity.to_string(),
            level: PenaltyLevel::Clean,
            violation_count: 0,
            multiplier: 1.0,
            last_violation_at: None,
            decay_deadline: now,
        }
    }

    /// Step down one level for each decay period that has fully elapsed.
    fn apply_decay(&mut self, config: &PenaltyConfig, now: DateTime<Utc>) {
        while self.level != PenaltyLevel::Clean && now >= self.decay_deadline {
            let from = self.level;
            self.level = from.step_down();
            self.violation_count = config.threshold_for(self.level);
            self.multiplier = config.multiplier_for(self.level);
            self.decay_deadline = offset(self.decay_deadline, config.decay_period);

            debug!(
                identity = %self.identity,
                from = from.as_str(),
                to = self.level.as_str(),
                "Penalty decayed"
            );
        }
    }
}

/// Tracks penalty state per principal.
///
/// Transitions for one principal run under that principal's map entry lock,
/// so concurrent violations for the same caller never lose an update.
pub struct PenaltyEngine {
    config: PenaltyConfig,
    states: DashMap<String, PenaltyState>,
}

impl PenaltyEngine {
    pub fn new(config: PenaltyConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PenaltyConfig {
        &self.config
    }

    /// Current multiplier for a principal, after applying decay at `now`.
    pub fn multiplier(&self, identity: &str, now: DateTime<Utc>) -> f64 {
        match self.states.get_mut(identity) {
            Some(mut state) => {
                state.apply_decay(&self.config, now);
                state.multiplier
            }
            None => 1.0,
        }
    }

    /// Record one violation and return the resulting state.
    pub fn record_violation(&self, identity: &str, now: DateTime<Utc>) -> PenaltyState {
        let mut state = self
            .states
            .entry(identity.to_string())
            .or_insert_with(|| PenaltyState::new(identity, now));

        state.apply_decay(&self.config, now);

        // A violation outside the observation period starts a fresh run at
        // the current level
        if let Some(last) = state.last_violation_at {
            if now >= offset(last, self.config.observation_period) {
                state.violation_count = self.config.threshold_for(state.level);
            }
        }

        state.violation_count = state.violation_count.saturating_add(1);
        let reached = self.config.level_for(state.violation_count);
        if reached > state.level {
            info!(
                identity = %identity,
                from = state.level.as_str(),
                to = reached.as_str(),
                violations = state.violation_count,
                "Penalty escalated"
            );
            state.level = reached;
        }

        state.multiplier = self.config.multiplier_for(state.level);
        state.last_violation_at = Some(now);
        state.decay_deadline = offset(now, self.config.decay_period);

        state.clone()
    }

    /// Penalty state for a principal, after applying decay at `now`.
    pub fn state(&self, identity: &str, now: DateTime<Utc>) -> Option<PenaltyState> {
        self.states.get_mut(identity).map(|mut state| {
            state.apply_decay(&self.config, now);
            state.clone()
        })
    }

    /// Forget a principal's history. Returns whether any state existed.
    pub fn clear(&self, identity: &str) -> bool {
        self.states.remove(identity).is_some()
    }

    /// Drop states that have decayed back to `Clean` and saw no violation
    /// within `state_ttl`. Returns the number removed.
    /// States above `Clean` are kept until they decay.
    pub fn purge_inactive(&self, now: DateTime<Utc>) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| {
            state.apply_decay(&self.config, now);
            let last_active = state.last_violation_at.unwrap_or(state.decay_deadline);
            state.level != PenaltyLevel::Clean
                || now < offset(last_active, self.config.state_ttl)
        });
        before.saturating_sub(self.states.len())
    }

    /// Number of tracked principals.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Number of principals currently at `Escalated`.
    pub fn escalated_count(&self) -> usize {
        self.states
            .iter()
            .filter(|state| state.level == PenaltyLevel::Escalated)
            .count()
    }
}
