//! Admission decisions and their HTTP rendering.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use super::offset;
use super::window::RuleOutcome;

/// Rule name reported for admin blocks.
pub const BLOCK_RULE: &str = "block";
/// Rule name reported when no store answered and the mode is fail-open.
pub const FAILOVER_OPEN_RULE: &str = "failover:open";
/// Rule name reported when no store answered and the mode is fail-closed.
pub const FAILOVER_CLOSED_RULE: &str = "failover:closed";

/// The decision for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    /// Limit of the deciding rule, after penalties
    pub limit: u64,
    pub remaining: u64,
    /// When the deciding window resets
    pub reset_at: DateTime<Utc>,
    /// Set on denial
    pub retry_after: Option<Duration>,
    /// Name of the deciding rule
    pub matched_rule: String,
}

impl Verdict {
    /// Verdict from the deciding rule outcome.
    pub fn from_outcome(outcome: RuleOutcome, now: DateTime<Utc>) -> Self {
        Self {
            allowed: outcome.allowed,
            limit: outcome.limit,
            remaining: outcome.remaining,
            reset_at: offset(now, outcome.reset_after),
            retry_after: outcome.retry_after,
            matched_rule: outcome.rule,
        }
    }

    /// Denial for a caller on the block list.
    pub fn blocked(until: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let retry_after = (until - now).to_std().unwrap_or(Duration::ZERO);
        Self {
            allowed: false,
            limit: 0,
            remaining: 0,
            reset_at: until,
            retry_after: Some(retry_after),
            matched_rule: BLOCK_RULE.to_string(),
        }
    }

    /// Admission while no counter store is reachable.
    pub fn failover_open(now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_at: now,
            retry_after: None,
            matched_rule: FAILOVER_OPEN_RULE.to_string(),
        }
    }

    /// Rejection while no counter store is reachable.
    pub fn failover_closed(cooldown: Duration, now: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            limit: 0,
            remaining: 0,
            reset_at: offset(now, cooldown),
            retry_after: Some(cooldown),
            matched_rule: FAILOVER_CLOSED_RULE.to_string(),
        }
    }

    /// 200 when allowed, 429 otherwise.
    pub fn http_status(&self) -> u16 {
        if self.allowed {
            200
        } else {
            429
        }
    }

    /// Response headers describing the quota.
    ///
    /// `Retry-After` is rounded up to whole seconds, and is present only on
    /// denial.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];
        if !self.allowed {
            if let Some(retry_after) = self.retry_after {
                headers.push(("Retry-After", ceil_secs(retry_after).to_string()));
            }
        }
        headers
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
