//! Fixed-window counting with optional burst protection.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::identity::Identity;
use super::rules::{RuleScope, RuleSpec};
use crate::store::{CounterKey, CounterSnapshot, CounterStore, StoreError};

/// Which counter of a rule denied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubWindow {
    Main,
    Burst,
}

/// Result of evaluating one rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    /// Name of the rule
    pub rule: String,
    pub allowed: bool,
    /// Limit after the penalty multiplier
    pub limit: u64,
    pub remaining: u64,
    /// Time until the main window resets
    pub reset_after: Duration,
    /// Set on denial: time until the denying window resets
    pub retry_after: Option<Duration>,
    pub denied_by: Option<SubWindow>,
}

/// `floor(limit / multiplier)`, never below 1 for a non-zero limit.
pub fn effective_limit(limit: u64, multiplier: f64) -> u64 {
    if limit == 0 {
        return 0;
    }
    if !multiplier.is_finite() || multiplier <= 1.0 {
        return limit;
    }
    ((limit as f64 / multiplier).floor() as u64).max(1)
}

/// Burst cap for a rule: the effective limit pro-rated to the burst window
/// and scaled by the burst multiplier, rounded up.
pub fn burst_limit(rule: &RuleSpec, effective: u64) -> Option<u64> {
    let burst_window = rule.burst_window?;
    let scaled = effective as f64 * rule.burst_multiplier * burst_window.as_millis() as f64;
    let cap = (scaled / rule.window.as_millis().max(1) as f64).ceil() as u64;
    Some(cap.max(1))
}

/// Counter subject for a rule. User and address overrides count against
/// the override itself; every other scope counts per principal.
fn subject(rule: &RuleSpec, identity: &Identity) -> String {
    match rule.scope {
        RuleScope::User | RuleScope::Ip => rule.name.clone(),
        _ => format!("{}|{}", identity.principal(), rule.name),
    }
}

/// Applies rules to counters in a store.
#[derive(Clone)]
pub struct WindowAlgorithm {
    store: Arc<dyn CounterStore>,
}

impl WindowAlgorithm {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// The main counter key for `rule` at `now`.
    pub fn counter_key(rule: &RuleSpec, identity: &Identity, now: DateTime<Utc>) -> CounterKey {
        CounterKey::at(rule.scope.as_str(), &subject(rule, identity), rule.window, now)
    }

    fn burst_key(rule: &RuleSpec, identity: &Identity, now: DateTime<Utc>) -> Option<CounterKey> {
        rule.burst_window
            .map(|window| CounterKey::at(rule.scope.as_str(), &subject(rule, identity), window, now))
    }

    /// All counter keys `rule` uses at `now`: the main window, then the
    /// burst window if configured.
    pub fn keys_for(rule: &RuleSpec, identity: &Identity, now: DateTime<Utc>) -> Vec<CounterKey> {
        let mut keys = vec![Self::counter_key(rule, identity, now)];
        keys.extend(Self::burst_key(rule, identity, now));
        keys
    }

    /// Count one request against `rule` and decide it.
    pub async fn evaluate(
        &self,
        rule: &RuleSpec,
        identity: &Identity,
        multiplier: f64,
        now: DateTime<Utc>,
    ) -> Result<RuleOutcome, StoreError> {
        let main_key = Self::counter_key(rule, identity, now);
        if rule.is_block() {
            let ttl = main_key.ttl_remaining(now);
            return Ok(RuleOutcome {
                rule: rule.name.clone(),
                allowed: false,
                limit: 0,
                remaining: 0,
                reset_after: ttl,
                retry_after: Some(ttl),
                denied_by: Some(SubWindow::Main),
            });
        }

        let limit = effective_limit(rule.limit, multiplier);
        let main = self.store.increment(&main_key, now).await?;

        let burst = match (Self::burst_key(rule, identity, now), burst_limit(rule, limit)) {
            (Some(key), Some(cap)) => Some((self.store.increment(&key, now).await?, cap)),
            _ => None,
        };

        trace!(
            rule = %rule.name,
            key = %main_key,
            count = main.count,
            limit = limit,
            "Counted request"
        );

        Ok(Self::decide(rule, limit, main, burst, true))
    }

    /// Report what `evaluate` would decide for the next request, without
    /// counting anything.
    pub async fn peek(
        &self,
        rule: &RuleSpec,
        identity: &Identity,
        multiplier: f64,
        now: DateTime<Utc>,
    ) -> Result<RuleOutcome, StoreError> {
        let main_key = Self::counter_key(rule, identity, now);
        let limit = effective_limit(rule.limit, multiplier);
        let main = self.store.get(&main_key, now).await?;

        let burst = match (Self::burst_key(rule, identity, now), burst_limit(rule, limit)) {
            (Some(key), Some(cap)) => Some((self.store.get(&key, now).await?, cap)),
            _ => None,
        };

        Ok(Self::decide(rule, limit, main, burst, false))
    }

    /// Decide from counter snapshots. With `counted` the snapshots already
    /// include this request; otherwise they describe the state before it.
    fn decide(
        rule: &RuleSpec,
        limit: u64,
        main: CounterSnapshot,
        burst: Option<(CounterSnapshot, u64)>,
        counted: bool,
    ) -> RuleOutcome {
        let over = |count: u64, cap: u64| if counted { count > cap } else { count >= cap };

        let main_denied = over(main.count, limit);
        let burst_denied = burst.map_or(false, |(snapshot, cap)| over(snapshot.count, cap));

        let (denied_by, retry_after) = match (main_denied, burst_denied, burst) {
            (true, true, Some((snapshot, _))) => (
                Some(SubWindow::Main),
                Some(main.ttl_remaining.max(snapshot.ttl_remaining)),
            ),
            (true, _, _) => (Some(SubWindow::Main), Some(main.ttl_remaining)),
            (false, true, Some((snapshot, _))) => {
                (Some(SubWindow::Burst), Some(snapshot.ttl_remaining))
            }
            _ => (None, None),
        };

        let remaining = if denied_by.is_some() {
            0
        } else {
            let main_left = limit.saturating_sub(main.count);
            match burst {
                Some((snapshot, cap)) => main_left.min(cap.saturating_sub(snapshot.count)),
                None => main_left,
            }
        };

        RuleOutcome {
            rule: rule.name.clone(),
            allowed: denied_by.is_none(),
            limit,
            remaining,
            reset_after: main.ttl_remaining,
            retry_after,
            denied_by,
        }
    }
}

/// Merge per-rule outcomes into the one that decides the request.
///
/// Any denial wins; among denials the longest `retry_after` wins. When all
/// rules allow, the one with the least headroom wins, preferring the more
/// specific (later) rule on ties.
pub fn most_restrictive(outcomes: Vec<RuleOutcome>) -> Option<RuleOutcome> {
    outcomes.into_iter().reduce(|current, candidate| {
        let replace = match (current.allowed, candidate.allowed) {
            (true, false) => true,
            (false, true) => false,
            (false, false) => candidate.retry_after >= current.retry_after,
            (true, true) => candidate.remaining <= current.remaining,
        };
        if replace {
            candidate
        } else {
            current
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::{BurstConfig, RuleConfig};
    use crate::store::LocalStore;
    use chrono::TimeZone;

    // Minute aligned
    const WINDOW_START: i64 = 1_000_000_020;

    fn at_secs(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(WINDOW_START + offset, 0).unwrap()
    }

    fn rule(scope: RuleScope, name: &str, limit: u64, burst: Option<BurstConfig>) -> RuleSpec {
        let config = RuleConfig {
            limit,
            window_secs: 60,
            burst,
        };
        RuleSpec::from_config(scope, name.to_string(), &config).unwrap()
    }

    fn identity() -> Identity {
        Identity::anonymous("10.0.0.1".parse().unwrap())
    }

    fn algorithm() -> WindowAlgorithm {
        WindowAlgorithm::new(Arc::new(LocalStore::new()))
    }

    #[test]
    fn test_effective_limit() {
        assert_eq!(effective_limit(100, 1.0), 100);
        assert_eq!(effective_limit(100, 8.0), 12);
        assert_eq!(effective_limit(100, 3.0), 33);
        assert_eq!(effective_limit(3, 8.0), 1);
        assert_eq!(effective_limit(0, 2.0), 0);
    }

    #[test]
    fn test_burst_limit_is_pro_rated() {
        let spiky = rule(
            RuleScope::Global,
            "global",
            100,
            Some(BurstConfig {
                multiplier: 2.0,
                window_secs: 10,
            }),
        );
        assert_eq!(burst_limit(&spiky, 100), Some(34));
        assert_eq!(burst_limit(&spiky, 12), Some(4));

        let plain = rule(RuleScope::Global, "global", 100, None);
        assert_eq!(burst_limit(&plain, 100), None);
    }

    #[test]
    fn test_subjects_per_scope() {
        let identity = identity().with_user("42");
        let global = rule(RuleScope::Global, "global", 10, None);
        let user = rule(RuleScope::User, "user:42", 10, None);

        let now = at_secs(0);
        assert_eq!(
            WindowAlgorithm::counter_key(&global, &identity, now).subject,
            "user:42|global"
        );
        assert_eq!(
            WindowAlgorithm::counter_key(&user, &identity, now).subject,
            "user:42"
        );
    }

    #[tokio::test]
    async fn test_limit_reached_at_101() {
        let algorithm = algorithm();
        let rule = rule(RuleScope::Global, "global", 100, None);
        let identity = identity();
        let now = at_secs(15);

        for i in 1..=100 {
            let outcome = algorithm.evaluate(&rule, &identity, 1.0, now).await.unwrap();
            assert!(outcome.allowed, "request {} should be allowed", i);
            assert_eq!(outcome.remaining, 100 - i);
        }

        let outcome = algorithm.evaluate(&rule, &identity, 1.0, now).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.denied_by, Some(SubWindow::Main));
        assert_eq!(outcome.retry_after, Some(Duration::from_secs(45)));
    }

    #[tokio::test]
    async fn test_burst_denies_below_main_limit() {
        let algorithm = algorithm();
        let rule = rule(
            RuleScope::Endpoint,
            "endpoint:search",
            100,
            Some(BurstConfig {
                multiplier: 2.0,
                window_secs: 10,
            }),
        );
        let identity = identity();
        let now = at_secs(2);

        for i in 1..=34 {
            let outcome = algorithm.evaluate(&rule, &identity, 1.0, now).await.unwrap();
            assert!(outcome.allowed, "request {} should be allowed", i);
        }

        let outcome = algorithm.evaluate(&rule, &identity, 1.0, now).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.denied_by, Some(SubWindow::Burst));
        assert_eq!(outcome.retry_after, Some(Duration::from_secs(8)));

        // The next burst window opens with the main window still well below 100
        let later = algorithm
            .evaluate(&rule, &identity, 1.0, at_secs(10))
            .await
            .unwrap();
        assert!(later.allowed);
    }

    #[tokio::test]
    async fn test_window_boundary_resets_count() {
        let algorithm = algorithm();
        let rule = rule(RuleScope::Global, "global", 2, None);
        let identity = identity();
        let just_before = Utc.timestamp_millis_opt((WINDOW_START + 60) * 1000 - 1).unwrap();
        let just_after = Utc.timestamp_millis_opt((WINDOW_START + 60) * 1000 + 1).unwrap();

        for _ in 0..2 {
            algorithm.evaluate(&rule, &identity, 1.0, just_before).await.unwrap();
        }
        let denied = algorithm.evaluate(&rule, &identity, 1.0, just_before).await.unwrap();
        assert!(!denied.allowed);

        let fresh = algorithm.evaluate(&rule, &identity, 1.0, just_after).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 1);
    }

    #[tokio::test]
    async fn test_multiplier_shrinks_limit() {
        let algorithm = algorithm();
        let rule = rule(RuleScope::Global, "global", 100, None);
        let identity = identity();
        let now = at_secs(0);

        for _ in 0..12 {
            let outcome = algorithm.evaluate(&rule, &identity, 8.0, now).await.unwrap();
            assert!(outcome.allowed);
            assert_eq!(outcome.limit, 12);
        }
        let outcome = algorithm.evaluate(&rule, &identity, 8.0, now).await.unwrap();
        assert!(!outcome.allowed);
    }

    #[tokio::test]
    async fn test_block_rule_denies_without_counting() {
        let store = Arc::new(LocalStore::new());
        let algorithm = WindowAlgorithm::new(store.clone());
        let rule = rule(RuleScope::Ip, "ip:10.0.0.1", 0, None);

        let outcome = algorithm
            .evaluate(&rule, &identity(), 1.0, at_secs(30))
            .await
            .unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.retry_after, Some(Duration::from_secs(30)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_peek_does_not_count() {
        let algorithm = algorithm();
        let rule = rule(RuleScope::Global, "global", 2, None);
        let identity = identity();
        let now = at_secs(0);

        algorithm.evaluate(&rule, &identity, 1.0, now).await.unwrap();
        for _ in 0..3 {
            let outcome = algorithm.peek(&rule, &identity, 1.0, now).await.unwrap();
            assert!(outcome.allowed);
            assert_eq!(outcome.remaining, 1);
        }

        algorithm.evaluate(&rule, &identity, 1.0, now).await.unwrap();
        let outcome = algorithm.peek(&rule, &identity, 1.0, now).await.unwrap();
        assert!(!outcome.allowed);
    }

    fn outcome(rule: &str, allowed: bool, remaining: u64, retry_secs: Option<u64>) -> RuleOutcome {
        RuleOutcome {
            rule: rule.to_string(),
            allowed,
            limit: 10,
            remaining,
            reset_after: Duration::from_secs(60),
            retry_after: retry_secs.map(Duration::from_secs),
            denied_by: if allowed { None } else { Some(SubWindow::Main) },
        }
    }

    #[test]
    fn test_most_restrictive_prefers_denial() {
        let merged = most_restrictive(vec![
            outcome("global", true, 5, None),
            outcome("endpoint:search", false, 0, Some(10)),
            outcome("user:42", true, 1, None),
        ])
        .unwrap();
        assert_eq!(merged.rule, "endpoint:search");
    }

    #[test]
    fn test_most_restrictive_longest_retry() {
        let merged = most_restrictive(vec![
            outcome("global", false, 0, Some(40)),
            outcome("endpoint:search", false, 0, Some(5)),
        ])
        .unwrap();
        assert_eq!(merged.rule, "global");
    }

    #[test]
    fn test_most_restrictive_least_headroom() {
        let merged = most_restrictive(vec![
            outcome("global", true, 3, None),
            outcome("endpoint:search", true, 7, None),
            outcome("role:admin", true, 3, None),
        ])
        .unwrap();
        assert_eq!(merged.rule, "role:admin");
        assert!(most_restrictive(Vec::new()).is_none());
    }
}
