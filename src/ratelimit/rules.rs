//! Rate limit rule configuration and resolution.
//!
//! Rules are loaded from YAML into an immutable [`RuleTable`]. The
//! [`RuleResolver`] holds the active table and swaps it atomically on an
//! explicit reload, so a request always sees one complete table.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::identity::Identity;
use crate::error::{Result, TurnstileError};

/// Where a rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Global,
    Endpoint,
    Role,
    User,
    Ip,
}

impl RuleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleScope::Global => "global",
            RuleScope::Endpoint => "endpoint",
            RuleScope::Role => "role",
            RuleScope::User => "user",
            RuleScope::Ip => "ip",
        }
    }

    /// Overrides may use a zero limit to block outright.
    fn allows_block(&self) -> bool {
        matches!(self, RuleScope::User | RuleScope::Ip)
    }
}

/// The complete rule table as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Applies to every request
    pub global: RuleConfig,
    /// Applies to routes whose endpoint class has no rule of its own
    pub default_endpoint: RuleConfig,
    /// Per endpoint class
    #[serde(default)]
    pub endpoints: BTreeMap<String, RuleConfig>,
    /// Per role
    #[serde(default)]
    pub roles: BTreeMap<String, RuleConfig>,
    /// Per-user overrides
    #[serde(default)]
    pub users: BTreeMap<String, RuleConfig>,
    /// Per-address overrides; `limit: 0` blocks the address
    #[serde(default)]
    pub ips: BTreeMap<String, RuleConfig>,
}

impl RulesConfig {
    /// Parse a rule table document without validating it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse rule table: {}", e)))
    }
}

/// A single rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Optional short-window spike protection
    #[serde(default)]
    pub burst: Option<BurstConfig>,
}

/// Burst protection settings for a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurstConfig {
    /// How far above the pro-rated limit a burst may go
    pub multiplier: f64,
    /// Burst window length in seconds; must be shorter than the rule window
    pub window_secs: u64,
}

/// A validated rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSpec {
    /// Where the rule applies
    pub scope: RuleScope,
    /// Stable rule name, e.g. `endpoint:search` or `ip:10.0.0.1`
    pub name: String,
    /// Requests allowed per window; zero blocks
    pub limit: u64,
    /// Main window length
    pub window: Duration,
    /// Burst allowance relative to the pro-rated limit
    pub burst_multiplier: f64,
    /// Burst window length; `None` disables the burst check
    pub burst_window: Option<Duration>,
}

impl RuleSpec {
    /// Validate a configured rule.
    pub fn from_config(scope: RuleScope, name: String, config: &RuleConfig) -> Result<Self> {
        if config.window_secs == 0 {
            return Err(TurnstileError::invalid_rule(name, "window_secs must be positive"));
        }
        if config.limit == 0 && !scope.allows_block() {
            return Err(TurnstileError::invalid_rule(
                name,
                "limit must be positive (only user and ip overrides may block)",
            ));
        }

        let (burst_multiplier, burst_window) = match &config.burst {
            None => (1.0, None),
            Some(burst) => {
                if !burst.multiplier.is_finite() || burst.multiplier <= 0.0 {
                    return Err(TurnstileError::invalid_rule(
                        name,
                        "burst multiplier must be a positive number",
                    ));
                }
                if burst.window_secs == 0 || burst.window_secs >= config.window_secs {
                    return Err(TurnstileError::invalid_rule(
                        name,
                        "burst window must be positive and shorter than the rule window",
                    ));
                }
                (burst.multiplier, Some(Duration::from_secs(burst.window_secs)))
            }
        };

        Ok(Self {
            scope,
            name,
            limit: config.limit,
            window: Duration::from_secs(config.window_secs),
            burst_multiplier,
            burst_window,
        })
    }

    /// Whether this rule blocks every request.
    pub fn is_block(&self) -> bool {
        self.limit == 0
    }
}

/// An immutable, validated rule table.
#[derive(Debug, Clone)]
pub struct RuleTable {
    global: RuleSpec,
    default_endpoint: RuleSpec,
    endpoints: HashMap<String, RuleSpec>,
    roles: HashMap<String, RuleSpec>,
    users: HashMap<String, RuleSpec>,
    ips: HashMap<IpAddr, RuleSpec>,
    source: RulesConfig,
}

impl RuleTable {
    /// Load and validate a rule table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rule table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load and validate a rule table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_config(RulesConfig::from_yaml(yaml)?)
    }

    /// Validate a parsed rule table. Any invalid rule rejects the whole table.
    pub fn from_config(config: RulesConfig) -> Result<Self> {
        let global = RuleSpec::from_config(RuleScope::Global, "global".to_string(), &config.global)?;
        let default_endpoint = RuleSpec::from_config(
            RuleScope::Endpoint,
            "endpoint:default".to_string(),
            &config.default_endpoint,
        )?;

        let endpoints = Self::build_named(RuleScope::Endpoint, "endpoint", &config.endpoints)?;
        let roles = Self::build_named(RuleScope::Role, "role", &config.roles)?;
        let users = Self::build_named(RuleScope::User, "user", &config.users)?;

        let mut ips = HashMap::with_capacity(config.ips.len());
        for (raw, rule) in &config.ips {
            let name = format!("ip:{}", raw);
            let addr: IpAddr = raw
                .parse()
                .map_err(|_| TurnstileError::invalid_rule(&name, "not a valid IP address"))?;
            let spec = RuleSpec::from_config(RuleScope::Ip, format!("ip:{}", addr), rule)?;
            ips.insert(addr, spec);
        }

        Ok(Self {
            global,
            default_endpoint,
            endpoints,
            roles,
            users,
            ips,
            source: config,
        })
    }

    fn build_named(
        scope: RuleScope,
        prefix: &str,
        rules: &BTreeMap<String, RuleConfig>,
    ) -> Result<HashMap<String, RuleSpec>> {
        rules
            .iter()
            .map(|(key, rule)| {
                let name = format!("{}:{}", prefix, key);
                if key.trim().is_empty() {
                    return Err(TurnstileError::invalid_rule(name, "empty key"));
                }
                Ok((key.clone(), RuleSpec::from_config(scope, name, rule)?))
            })
            .collect()
    }

    /// Rules that apply to a request, least specific first:
    /// global, endpoint class, role, user, address.
    ///
    /// An unknown endpoint class resolves to the default endpoint rule.
    pub fn resolve(&self, identity: &Identity, endpoint_class: Option<&str>) -> Vec<&RuleSpec> {
        let mut rules = Vec::with_capacity(5);
        rules.push(&self.global);

        if let Some(class) = endpoint_class {
            match self.endpoints.get(class) {
                Some(rule) => rules.push(rule),
                None => {
                    warn!(
                        endpoint_class = %class,
                        fallback = %self.default_endpoint.name,
                        "Unknown endpoint class, applying default rule"
                    );
                    rules.push(&self.default_endpoint);
                }
            }
        }

        self.push_identity_rules(identity, &mut rules);
        rules
    }

    /// Every rule that could apply to an identity on any route.
    pub fn resolve_all(&self, identity: &Identity) -> Vec<&RuleSpec> {
        let mut rules = Vec::with_capacity(self.endpoints.len() + 5);
        rules.push(&self.global);
        rules.push(&self.default_endpoint);
        rules.extend(self.endpoints.values());
        self.push_identity_rules(identity, &mut rules);
        rules
    }

    fn push_identity_rules<'a>(&'a self, identity: &Identity, rules: &mut Vec<&'a RuleSpec>) {
        if let Some(rule) = identity.role.as_ref().and_then(|role| self.roles.get(role)) {
            rules.push(rule);
        }
        if let Some(rule) = identity.user_id.as_ref().and_then(|user| self.users.get(user)) {
            rules.push(rule);
        }
        if let Some(rule) = self.ips.get(&identity.ip) {
            rules.push(rule);
        }
    }

    /// Total number of rules in the table.
    pub fn rule_count(&self) -> usize {
        2 + self.endpoints.len() + self.roles.len() + self.users.len() + self.ips.len()
    }

    /// The configuration this table was built from.
    pub fn source(&self) -> &RulesConfig {
        &self.source
    }
}

/// Holds the active rule table.
pub struct RuleResolver {
    table: RwLock<Arc<RuleTable>>,
    generation: AtomicU64,
}

impl RuleResolver {
    /// Create a resolver over an initial table.
    pub fn new(table: RuleTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            generation: AtomicU64::new(1),
        }
    }

    /// The active table. Callers keep using the snapshot they took even if
    /// a reload happens meanwhile.
    pub fn snapshot(&self) -> Arc<RuleTable> {
        self.table.read().clone()
    }

    /// Replace the active table. Returns the new generation.
    pub fn reload(&self, table: RuleTable) -> u64 {
        let rule_count = table.rule_count();
        *self.table.write() = Arc::new(table);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation = generation, rules = rule_count, "Rule table reloaded");
        generation
    }

    /// Number of tables installed so far, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
global:
  limit: 1000
  window_secs: 60
default_endpoint:
  limit: 100
  window_secs: 60
endpoints:
  search:
    limit: 50
    window_secs: 60
    burst:
      multiplier: 2.0
      window_secs: 10
roles:
  admin:
    limit: 5000
    window_secs: 60
users:
  "42":
    limit: 20
    window_secs: 60
ips:
  "10.9.9.9":
    limit: 0
    window_secs: 3600
"#;

    fn names(rules: &[&RuleSpec]) -> Vec<String> {
        rules.iter().map(|r| r.name.clone()).collect()
    }

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn test_parse_rule_table() {
        let table = RuleTable::from_yaml(RULES).unwrap();
        assert_eq!(table.rule_count(), 6);

        let search = &table.endpoints["search"];
        assert_eq!(search.limit, 50);
        assert_eq!(search.window, Duration::from_secs(60));
        assert_eq!(search.burst_window, Some(Duration::from_secs(10)));
        assert_eq!(search.burst_multiplier, 2.0);
    }

    #[test]
    fn test_resolve_anonymous_without_endpoint() {
        let table = RuleTable::from_yaml(RULES).unwrap();
        let identity = Identity::anonymous(ip("10.0.0.1"));

        let rules = table.resolve(&identity, None);
        assert_eq!(names(&rules), vec!["global"]);
    }

    #[test]
    fn test_resolve_order_most_specific_last() {
        let table = RuleTable::from_yaml(RULES).unwrap();
        let identity = Identity::anonymous(ip("10.9.9.9"))
            .with_user("42")
            .with_role("admin");

        let rules = table.resolve(&identity, Some("search"));
        assert_eq!(
            names(&rules),
            vec!["global", "endpoint:search", "role:admin", "user:42", "ip:10.9.9.9"]
        );
        assert!(rules.last().unwrap().is_block());
    }

    #[test]
    fn test_unknown_endpoint_uses_default() {
        let table = RuleTable::from_yaml(RULES).unwrap();
        let identity = Identity::anonymous(ip("10.0.0.1"));

        let rules = table.resolve(&identity, Some("does-not-exist"));
        assert_eq!(names(&rules), vec!["global", "endpoint:default"]);
        assert_eq!(rules[1].limit, 100);
    }

    #[test]
    fn test_unmatched_role_and_user_are_skipped() {
        let table = RuleTable::from_yaml(RULES).unwrap();
        let identity = Identity::anonymous(ip("10.0.0.1"))
            .with_user("7")
            .with_role("viewer");

        let rules = table.resolve(&identity, Some("search"));
        assert_eq!(names(&rules), vec!["global", "endpoint:search"]);
    }

    #[test]
    fn test_resolve_all_covers_every_endpoint() {
        let table = RuleTable::from_yaml(RULES).unwrap();
        let identity = Identity::anonymous(ip("10.0.0.1")).with_user("42");

        let rules = table.resolve_all(&identity);
        assert_eq!(
            names(&rules),
            vec!["global", "endpoint:default", "endpoint:search", "user:42"]
        );
    }

    #[test]
    fn test_zero_window_is_invalid() {
        let yaml = r#"
global: { limit: 10, window_secs: 0 }
default_endpoint: { limit: 10, window_secs: 60 }
"#;
        let err = RuleTable::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidRule { ref rule, .. } if rule == "global"));
    }

    #[test]
    fn test_zero_limit_only_for_overrides() {
        let yaml = r#"
global: { limit: 10, window_secs: 60 }
default_endpoint: { limit: 10, window_secs: 60 }
roles:
  guest: { limit: 0, window_secs: 60 }
"#;
        let err = RuleTable::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidRule { ref rule, .. } if rule == "role:guest"));
    }

    #[test]
    fn test_burst_window_must_be_shorter() {
        let yaml = r#"
global:
  limit: 10
  window_secs: 60
  burst: { multiplier: 2.0, window_secs: 60 }
default_endpoint: { limit: 10, window_secs: 60 }
"#;
        assert!(matches!(
            RuleTable::from_yaml(yaml),
            Err(TurnstileError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_invalid_ip_override() {
        let yaml = r#"
global: { limit: 10, window_secs: 60 }
default_endpoint: { limit: 10, window_secs: 60 }
ips:
  "not-an-ip": { limit: 0, window_secs: 60 }
"#;
        let err = RuleTable::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidRule { ref rule, .. } if rule == "ip:not-an-ip"));
    }

    #[test]
    fn test_missing_global_rule_fails_to_parse() {
        let yaml = r#"
default_endpoint: { limit: 10, window_secs: 60 }
"#;
        assert!(matches!(
            RuleTable::from_yaml(yaml),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_resolver_reload_swaps_snapshot() {
        let resolver = RuleResolver::new(RuleTable::from_yaml(RULES).unwrap());
        let before = resolver.snapshot();
        assert_eq!(resolver.generation(), 1);

        let yaml = r#"
global: { limit: 5, window_secs: 1 }
default_endpoint: { limit: 5, window_secs: 1 }
"#;
        let generation = resolver.reload(RuleTable::from_yaml(yaml).unwrap());
        assert_eq!(generation, 2);
        assert_eq!(resolver.generation(), 2);

        // Old snapshot is untouched, new one is visible
        assert_eq!(before.rule_count(), 6);
        assert_eq!(resolver.snapshot().rule_count(), 2);
        assert_eq!(resolver.snapshot().global.limit, 5);
    }
}
