//! Route Table
//!
//! Responsibilities:
//! - Compile routing configuration into an immutable ruleset
//! - Resolve a destination to an action (first match wins)
//! - Hot-reload the ruleset atomically
//!
//! ```text
//! Destination ──▶ rule 0 ──▶ rule 1 ──▶ ... ──▶ default action
//!                   │           │
//!                   ▼           ▼
//!                 Action      Action
//! ```
//!
//! Readers load the current ruleset through `ArcSwap`; a reload builds the
//! complete new ruleset first and only then publishes it, so a reader sees
//! either the whole old or the whole new ruleset.

pub mod dns;
pub mod rule;

pub use dns::DnsCache;
pub use rule::{Rule, RuleType};

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::common::IpProtocol;
use crate::config::RoutingConfig;
use crate::error::{Error, Result};

/// Tag reported when no rule matched
pub const DEFAULT_RULE_TAG: &str = "default";

/// Routing action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Forward to the destination directly, outside the tunnel
    Direct,
    /// Forward through the named upstream endpoint
    Proxy(Arc<str>),
    /// Drop
    Block,
}

impl Action {
    /// Parse an action name. `endpoint_for` resolves the endpoint of a proxy
    /// action.
    pub fn parse<F>(name: &str, endpoint: Option<&str>, endpoint_for: F) -> Result<Self>
    where
        F: Fn(Option<&str>) -> Result<Arc<str>>,
    {
        match name.to_lowercase().as_str() {
            "direct" | "freedom" => Ok(Action::Direct),
            "block" | "blackhole" | "reject" => Ok(Action::Block),
            "proxy" => Ok(Action::Proxy(endpoint_for(endpoint)?)),
            other => Err(Error::RouteValidation(format!("unknown action: {}", other))),
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Action::Block)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Direct => write!(f, "direct"),
            Action::Proxy(endpoint) => write!(f, "proxy:{}", endpoint),
            Action::Block => write!(f, "block"),
        }
    }
}

/// What a routing decision is made on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub protocol: IpProtocol,
    pub addr: SocketAddr,
    /// Name the address was resolved from, when known
    pub domain: Option<String>,
}

impl Destination {
    pub fn new(protocol: IpProtocol, addr: SocketAddr) -> Self {
        Self {
            protocol,
            addr,
            domain: None,
        }
    }

    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }
}

/// An immutable, compiled ruleset
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<Rule>,
    default_action: Action,
    version: u64,
}

impl RuleSet {
    /// Compile routing configuration against the set of known endpoint ids
    pub fn compile(config: &RoutingConfig, endpoints: &[String], version: u64) -> Result<Self> {
        let known: HashSet<&str> = endpoints.iter().map(String::as_str).collect();
        let default_endpoint = config.default_endpoint.as_deref();
        if let Some(id) = default_endpoint {
            if !known.contains(id) {
                return Err(Error::RouteValidation(format!(
                    "default endpoint {} is not configured",
                    id
                )));
            }
        }

        let endpoint_for = |requested: Option<&str>| -> Result<Arc<str>> {
            match requested.or(default_endpoint) {
                Some(id) if known.contains(id) => Ok(Arc::from(id)),
                Some(id) => Err(Error::RouteValidation(format!("unknown endpoint: {}", id))),
                None if endpoints.len() == 1 => Ok(Arc::from(endpoints[0].as_str())),
                None => Err(Error::RouteValidation(
                    "proxy action needs an endpoint".to_string(),
                )),
            }
        };

        let rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(i, rule)| Rule::compile(i, rule, endpoint_for))
            .collect::<Result<Vec<_>>>()?;
        let default_action = Action::parse(&config.default_action, None, endpoint_for)?;

        Ok(Self {
            rules,
            default_action,
            version,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve a destination; also returns the tag of the matching rule
    pub fn resolve_tagged(&self, dest: &Destination) -> (Action, Arc<str>) {
        for rule in &self.rules {
            if rule.matches(dest) {
                return (rule.action.clone(), rule.tag.clone());
            }
        }
        (self.default_action.clone(), Arc::from(DEFAULT_RULE_TAG))
    }
}

/// Route table with an atomically replaceable ruleset
pub struct RouteTable {
    rules: ArcSwap<RuleSet>,
    endpoints: Vec<String>,
    versions: AtomicU64,
}

impl RouteTable {
    /// Build the table from configuration; fails if any rule is invalid
    pub fn new(config: &RoutingConfig, endpoints: Vec<String>) -> Result<Self> {
        let ruleset = RuleSet::compile(config, &endpoints, 1)?;
        info!(
            "[Route] Loaded {} rules, default action {}",
            ruleset.len(),
            ruleset.default_action
        );
        Ok(Self {
            rules: ArcSwap::from_pointee(ruleset),
            endpoints,
            versions: AtomicU64::new(1),
        })
    }

    /// Resolve a destination against the current ruleset
    pub fn resolve(&self, dest: &Destination) -> Action {
        self.rules.load().resolve_tagged(dest).0
    }

    /// Resolve and report which rule matched
    pub fn resolve_tagged(&self, dest: &Destination) -> (Action, Arc<str>) {
        self.rules.load().resolve_tagged(dest)
    }

    /// Replace the ruleset.
    ///
    /// The new ruleset is compiled completely before it is published. On any
    /// error the previous ruleset stays active.
    pub fn reload(&self, config: &RoutingConfig) -> Result<u64> {
        let version = self.versions.load(Ordering::Relaxed) + 1;
        let ruleset = RuleSet::compile(config, &self.endpoints, version)?;
        self.versions.store(version, Ordering::Relaxed);
        info!(
            "[Route] Reloaded ruleset v{} ({} rules)",
            version,
            ruleset.len()
        );
        self.rules.store(Arc::new(ruleset));
        Ok(version)
    }

    /// Version of the active ruleset
    pub fn version(&self) -> u64 {
        self.rules.load().version()
    }

    /// Snapshot of the active ruleset
    pub fn load(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }
}
