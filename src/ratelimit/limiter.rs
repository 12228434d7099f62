//! The admission decision pipeline.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::identity::Identity;
use super::offset;
use super::penalty::{PenaltyConfig, PenaltyEngine};
use super::rules::{RuleResolver, RuleTable, RulesConfig};
use super::verdict::Verdict;
use super::window::{most_restrictive, WindowAlgorithm};
use crate::error::Result;
use crate::store::{
    CounterStore, FailoverConfig, FailoverStatus, FailoverStore, FailureMode, StoreError,
};

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub backend: FailoverStatus,
    pub tracked_penalties: usize,
    pub escalated_identities: usize,
    pub blocked_identities: usize,
    pub rule_count: usize,
    pub rules_generation: u64,
}

/// What an administrative reset removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub counters_reset: usize,
    pub penalty_cleared: bool,
}

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub counters_purged: usize,
    pub penalties_purged: usize,
    pub blocks_expired: usize,
}

/// Active configuration, as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfigView {
    pub rules: RulesConfig,
    pub rules_generation: u64,
    pub failover: FailoverConfig,
    pub penalty: PenaltyConfig,
}

/// Decides whether requests may proceed.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct AdmissionEngine {
    /// Active rule table
    resolver: RuleResolver,
    /// Rule evaluation against the routed store
    window: WindowAlgorithm,
    /// Per-principal penalty state
    penalties: PenaltyEngine,
    /// Primary/fallback routing
    store: Arc<FailoverStore>,
    /// Admin blocks: principal key -> blocked until
    blocks: DashMap<String, DateTime<Utc>>,
}

impl AdmissionEngine {
    pub fn new(rules: RuleTable, penalties: PenaltyEngine, store: Arc<FailoverStore>) -> Self {
        Self {
            resolver: RuleResolver::new(rules),
            window: WindowAlgorithm::new(store.clone()),
            penalties,
            store,
            blocks: DashMap::new(),
        }
    }

    /// Decide one request, counting it against every applicable rule.
    pub async fn evaluate(
        &self,
        identity: &Identity,
        endpoint_class: Option<&str>,
        now: DateTime<Utc>,
    ) -> Verdict {
        if let Some(until) = self.blocked_until(identity, now) {
            debug!(identity = %identity, until = %until, "Request from blocked caller");
            return Verdict::blocked(until, now);
        }

        let table = self.resolver.snapshot();
        let rules = table.resolve(identity, endpoint_class);
        let principal = identity.principal();
        let multiplier = self.penalties.multiplier(&principal, now);

        let mut outcomes = Vec::with_capacity(rules.len());
        for rule in rules {
            match self.window.evaluate(rule, identity, multiplier, now).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => return self.outage_verdict(&err, now),
            }
        }

        let Some(outcome) = most_restrictive(outcomes) else {
            warn!(identity = %identity, "No rules resolved for request");
            return self.outage_verdict(&StoreError::unavailable("engine", "no rules"), now);
        };

        if !outcome.allowed {
            let state = self.penalties.record_violation(&principal, now);
            debug!(
                identity = %identity,
                rule = %outcome.rule,
                denied_by = ?outcome.denied_by,
                level = state.level.as_str(),
                multiplier = state.multiplier,
                "Request denied"
            );
        }

        Verdict::from_outcome(outcome, now)
    }

    /// Report the caller's quota without counting a request.
    pub async fn quota(
        &self,
        identity: &Identity,
        endpoint_class: Option<&str>,
        now: DateTime<Utc>,
    ) -> Verdict {
        if let Some(until) = self.blocked_until(identity, now) {
            return Verdict::blocked(until, now);
        }

        let table = self.resolver.snapshot();
        let multiplier = self.penalties.multiplier(&identity.principal(), now);

        let mut outcomes = Vec::new();
        for rule in table.resolve(identity, endpoint_class) {
            match self.window.peek(rule, identity, multiplier, now).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => return self.outage_verdict(&err, now),
            }
        }

        match most_restrictive(outcomes) {
            Some(outcome) => Verdict::from_outcome(outcome, now),
            None => self.outage_verdict(&StoreError::unavailable("engine", "no rules"), now),
        }
    }

    /// Verdict when no counter store could answer.
    fn outage_verdict(&self, err: &StoreError, now: DateTime<Utc>) -> Verdict {
        let mode = self.store.mode();
        warn!(error = %err, mode = mode.as_str(), "No counter store available, applying failure mode");
        match mode {
            FailureMode::FailOpen => Verdict::failover_open(now),
            FailureMode::FailClosed => Verdict::failover_closed(self.store.config().cooldown, now),
        }
    }

    /// The latest active block covering the caller's address or user.
    fn blocked_until(&self, identity: &Identity, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let keys = std::iter::once(identity.ip_key()).chain(identity.user_key());

        let mut latest: Option<DateTime<Utc>> = None;
        for key in keys {
            let until = match self.blocks.get(&key) {
                Some(entry) => *entry,
                None => continue,
            };
            if until > now {
                latest = Some(latest.map_or(until, |current| current.max(until)));
            } else {
                self.blocks.remove_if(&key, |_, until| *until <= now);
            }
        }
        latest
    }

    /// Snapshot of the engine.
    pub fn status(&self) -> EngineStatus {
        let table = self.resolver.snapshot();
        EngineStatus {
            backend: self.store.status(),
            tracked_penalties: self.penalties.len(),
            escalated_identities: self.penalties.escalated_count(),
            blocked_identities: self.blocks.len(),
            rule_count: table.rule_count(),
            rules_generation: self.resolver.generation(),
        }
    }

    /// Zero every counter the identity currently uses and clear its penalty.
    pub async fn reset_identity(&self, identity: &Identity, now: DateTime<Utc>) -> Result<ResetReport> {
        let penalty_cleared = self.penalties.clear(&identity.principal());

        let table = self.resolver.snapshot();
        let keys: Vec<_> = table
            .resolve_all(identity)
            .into_iter()
            .flat_map(|rule| WindowAlgorithm::keys_for(rule, identity, now))
            .collect();
        try_join_all(keys.iter().map(|key| self.store.reset(key))).await?;
        let counters_reset = keys.len();

        info!(
            identity = %identity,
            counters = counters_reset,
            penalty_cleared = penalty_cleared,
            "Identity reset"
        );

        Ok(ResetReport {
            counters_reset,
            penalty_cleared,
        })
    }

    /// Deny every request from the identity's principal for `duration`.
    pub fn block_identity(
        &self,
        identity: &Identity,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let until = offset(now, duration);
        let principal = identity.principal();
        self.blocks.insert(principal.clone(), until);
        info!(principal = %principal, until = %until, "Identity blocked");
        until
    }

    /// Lift any block on the identity's address or user.
    pub fn unblock_identity(&self, identity: &Identity) -> bool {
        let keys = std::iter::once(identity.ip_key()).chain(identity.user_key());
        let mut removed = false;
        for key in keys {
            removed |= self.blocks.remove(&key).is_some();
        }
        if removed {
            info!(identity = %identity, "Identity unblocked");
        }
        removed
    }

    /// Active configuration.
    pub fn get_config(&self) -> EngineConfigView {
        let table = self.resolver.snapshot();
        EngineConfigView {
            rules: table.source().clone(),
            rules_generation: self.resolver.generation(),
            failover: self.store.config().clone(),
            penalty: self.penalties.config().clone(),
        }
    }

    /// Validate and install a new rule table. On error the active table
    /// stays in place.
    pub fn reload_rules(&self, rules: RulesConfig) -> Result<u64> {
        let table = RuleTable::from_config(rules).map_err(|err| {
            warn!(error = %err, "Rejected rule table reload");
            err
        })?;
        Ok(self.resolver.reload(table))
    }

    /// Drop expired counters, inactive penalties and lapsed blocks.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let counters_purged = match self.store.purge_expired(now).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(error = %err, "Failed to purge expired counters");
                0
            }
        };
        let penalties_purged = self.penalties.purge_inactive(now);

        let before = self.blocks.len();
        self.blocks.retain(|_, until| *until > now);
        let blocks_expired = before.saturating_sub(self.blocks.len());

        SweepReport {
            counters_purged,
            penalties_purged,
            blocks_expired,
        }
    }

    /// Run [`AdmissionEngine::sweep`] every `every` until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.sweep(Utc::now()).await;
                debug!(
                    counters = report.counters_purged,
                    penalties = report.penalties_purged,
                    blocks = report.blocks_expired,
                    "Sweep complete"
                );
            }
        })
    }
}
