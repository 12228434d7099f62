//! Admission control: rules, windows, penalties and the decision pipeline.

mod identity;
mod limiter;
mod penalty;
mod rules;
mod verdict;
mod window;

use chrono::{DateTime, Utc};
use std::time::Duration;

pub use identity::Identity;
pub use limiter::{AdmissionEngine, EngineConfigView, EngineStatus, ResetReport, SweepReport};
pub use penalty::{PenaltyConfig, PenaltyEngine, PenaltyLevel, PenaltyState};
pub use rules::{BurstConfig, RuleConfig, RuleResolver, RuleScope, RuleSpec, RuleTable, RulesConfig};
pub use verdict::{Verdict, BLOCK_RULE, FAILOVER_CLOSED_RULE, FAILOVER_OPEN_RULE};
pub use window::{burst_limit, effective_limit, most_restrictive, RuleOutcome, SubWindow, WindowAlgorithm};

/// `at + duration`, saturating at the latest representable time.
pub(crate) fn offset(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
