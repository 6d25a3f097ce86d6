//! Outbound address firewall.
//!
//! Every HTTP and WebSocket connection a computer opens is checked against an
//! ordered list of [`AddressRule`]s after its host has been resolved. Matching
//! rules contribute [`PartialOptions`]; the first matching rule with an action
//! decides whether the connection is allowed.

mod options;
mod rule;

pub use options::{
    Action, Options, PartialOptions, DEFAULT_MAX_DOWNLOAD, DEFAULT_MAX_UPLOAD,
    DEFAULT_MAX_WEBSOCKET_MESSAGE, DEFAULT_TIMEOUT_MS,
};
pub use rule::{is_private, AddressRule, PRIVATE_TOKEN};

use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::config::AddressRuleConfig;
use crate::Result;

/// An immutable, ordered list of address rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<AddressRule>,
}

impl RuleSet {
    /// Create a rule set from already parsed rules.
    pub fn new(rules: Vec<AddressRule>) -> Self {
        Self { rules }
    }

    /// Compile configured rules, failing on the first malformed one.
    pub fn from_config(configs: &[AddressRuleConfig]) -> Result<Self> {
        let rules = configs
            .iter()
            .map(|c| AddressRule::parse(&c.host, c.port, c.partial_options()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[AddressRule] {
        &self.rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules, in which case everything is denied.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Decide on a connection to `host`, resolved to `address`, on `port`.
    pub fn decide(&self, host: &str, address: IpAddr, port: u16) -> Options {
        let mut options = PartialOptions::default();
        for rule in self.rules.iter().filter(|r| r.matches(host, &address, port)) {
            options.merge(rule.options());
            if options.is_full() {
                break;
            }
        }
        options.to_options()
    }
}

/// Shared firewall holding the current rule snapshot.
///
/// Decisions take a snapshot, so a concurrent [`Firewall::reload`] never
/// affects a decision already in progress.
#[derive(Debug, Default)]
pub struct Firewall {
    rules: RwLock<Arc<RuleSet>>,
}

impl Firewall {
    /// Create a firewall with the given rules.
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Build a firewall from the configured rule list.
    pub fn from_config(configs: &[AddressRuleConfig]) -> Result<Self> {
        let rules = RuleSet::from_config(configs)?;
        info!(rules = rules.len(), "Address rules loaded");
        Ok(Self::new(rules))
    }

    /// The current rule snapshot.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Atomically replace the rule list.
    pub fn reload(&self, rules: RuleSet) {
        let count = rules.len();
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
        info!(rules = count, "Address rules reloaded");
    }

    /// Decide on a connection to `host`, resolved to `address`, on `port`.
    pub fn decide(&self, host: &str, address: IpAddr, port: u16) -> Options {
        let options = self.snapshot().decide(host, address, port);
        debug!(host, %address, port, action = ?options.action, "Address decision");
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn rule(host: &str, options: PartialOptions) -> AddressRule {
        AddressRule::parse(host, None, options).unwrap()
    }

    #[test]
    fn test_empty_rules_deny() {
        let rules = RuleSet::default();
        assert_eq!(
            rules.decide("example.com", ip("93.184.216.34"), 80).action,
            Action::Deny
        );
    }

    #[test]
    fn test_private_then_allow_all() {
        let rules = RuleSet::new(vec![
            rule("$private", PartialOptions::action(Action::Deny)),
            rule("*", PartialOptions::action(Action::Allow)),
        ]);

        assert_eq!(rules.decide("localhost", ip("127.0.0.1"), 80).action, Action::Deny);
        assert_eq!(
            rules.decide("example.com", ip("93.184.216.34"), 80).action,
            Action::Allow
        );
    }

    #[test]
    fn test_first_match_wins() {
        let rules = RuleSet::new(vec![
            rule("*", PartialOptions::action(Action::Allow)),
            rule("$private", PartialOptions::action(Action::Deny)),
        ]);
        assert_eq!(rules.decide("localhost", ip("127.0.0.1"), 80).action, Action::Allow);
    }

    #[test]
    fn test_partial_rule_merges_with_later_action() {
        let rules = RuleSet::new(vec![
            rule(
                "*.example.com",
                PartialOptions {
                    max_download: Some(1024),
                    ..PartialOptions::default()
                },
            ),
            rule(
                "*",
                PartialOptions {
                    action: Some(Action::Allow),
                    max_download: Some(99),
                    max_upload: Some(10),
                    ..PartialOptions::default()
                },
            ),
        ]);

        let options = rules.decide("api.example.com", ip("93.184.216.34"), 443);
        assert_eq!(options.action, Action::Allow);
        assert_eq!(options.max_download, 1024);
        assert_eq!(options.max_upload, 10);

        let other = rules.decide("example.org", ip("93.184.216.34"), 443);
        assert_eq!(other.max_download, 99);
    }

    #[test]
    fn test_partial_without_action_denies() {
        let rules = RuleSet::new(vec![rule(
            "*",
            PartialOptions {
                max_upload: Some(1),
                ..PartialOptions::default()
            },
        )]);
        assert!(!rules.decide("example.com", ip("93.184.216.34"), 80).is_allowed());
    }

    #[test]
    fn test_reload_swaps_rules() {
        let firewall = Firewall::new(RuleSet::new(vec![rule(
            "*",
            PartialOptions::action(Action::Deny),
        )]));
        let before = firewall.snapshot();

        firewall.reload(RuleSet::new(vec![rule("*", PartialOptions::action(Action::Allow))]));

        assert!(firewall.decide("example.com", ip("93.184.216.34"), 80).is_allowed());
        // An earlier snapshot is unaffected.
        assert!(!before.decide("example.com", ip("93.184.216.34"), 80).is_allowed());
    }

    #[test]
    fn test_from_config_defaults() {
        let config = crate::config::HttpConfig::default();
        let firewall = Firewall::from_config(&config.rules).unwrap();

        let local = firewall.decide("localhost", ip("::1"), 80);
        assert!(!local.is_allowed());

        let remote = firewall.decide("example.com", ip("93.184.216.34"), 443);
        assert!(remote.is_allowed());
        assert_eq!(remote.max_download, DEFAULT_MAX_DOWNLOAD);
    }
}
