//! FEP Router - rule-based destination selection
//!
//! Rules are checked in ascending priority order; the first active rule
//! whose matchers all intersect the request wins. A rule with no matcher
//! of a kind matches every value of that kind. No match falls through to
//! the configured default destination, or a routing error when none is
//! set.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fep_types::{Channel, FepError, Result, TransactionRequest, TransactionType};

/// Downstream destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Core banking system on the mainframe
    MainframeCbs,
    /// Open-systems API gateway
    OpenSystemApi,
    /// FISC interbank switch
    FiscInterbank,
    /// FISC bill-payment service
    FiscBillPayment,
    /// International card network
    CardNetwork,
    /// Handled inside the gateway
    Internal,
    /// Other external service
    ExternalService,
}

/// Custom predicate evaluated after the set matchers
pub type RoutePredicate = Arc<dyn Fn(&TransactionRequest) -> bool + Send + Sync>;

/// One routing rule
#[derive(Clone)]
pub struct RoutingRule {
    /// Rule name for logs and diagnostics
    pub name: String,
    /// Lower wins
    pub priority: i32,
    /// Matching transaction types; empty matches all
    pub transaction_types: HashSet<TransactionType>,
    /// Matching channels; empty matches all
    pub channels: HashSet<Channel>,
    /// Matching destination bank codes; empty matches all
    pub dest_banks: HashSet<String>,
    /// Custom predicate; None matches all
    pub predicate: Option<RoutePredicate>,
    /// Where matching traffic goes
    pub destination: Destination,
    /// Per-rule dispatch timeout
    pub timeout_ms: u64,
    /// Inactive rules are skipped
    pub active: bool,
}

impl std::fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingRule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("destination", &self.destination)
            .field("timeout_ms", &self.timeout_ms)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl RoutingRule {
    /// A rule matching everything, to be narrowed with the builder methods
    pub fn new(name: impl Into<String>, priority: i32, destination: Destination) -> Self {
        Self {
            name: name.into(),
            priority,
            transaction_types: HashSet::new(),
            channels: HashSet::new(),
            dest_banks: HashSet::new(),
            predicate: None,
            destination,
            timeout_ms: 10_000,
            active: true,
        }
    }

    pub fn for_types(mut self, types: impl IntoIterator<Item = TransactionType>) -> Self {
        self.transaction_types.extend(types);
        self
    }

    pub fn for_channels(mut self, channels: impl IntoIterator<Item = Channel>) -> Self {
        self.channels.extend(channels);
        self
    }

    pub fn for_dest_banks<S: Into<String>>(
        mut self,
        banks: impl IntoIterator<Item = S>,
    ) -> Self {
        self.dest_banks.extend(banks.into_iter().map(Into::into));
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&TransactionRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Whether this rule matches the request
    pub fn matches(&self, request: &TransactionRequest) -> bool {
        if !self.active {
            return false;
        }
        if !self.transaction_types.is_empty()
            && !self.transaction_types.contains(&request.transaction_type)
        {
            return false;
        }
        if !self.channels.is_empty() && !self.channels.contains(&request.channel) {
            return false;
        }
        if !self.dest_banks.is_empty() {
            match &request.dest_bank_code {
                Some(bank) if self.dest_banks.contains(bank) => {}
                _ => return false,
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(request) {
                return false;
            }
        }
        true
    }
}

/// The routing outcome attached to the pipeline context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub destination: Destination,
    pub rule_name: String,
    pub timeout_ms: u64,
}

/// Priority-ordered rule list with an optional default destination
pub struct Router {
    rules: Vec<RoutingRule>,
    default_destination: Option<(Destination, u64)>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_destination: None,
        }
    }

    /// Add a rule, keeping the list sorted by ascending priority
    pub fn add_rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| r.priority);
        self
    }

    /// Fallback when no rule matches
    pub fn with_default(mut self, destination: Destination, timeout_ms: u64) -> Self {
        self.default_destination = Some((destination, timeout_ms));
        self
    }

    /// First matching active rule wins; otherwise the default; otherwise a
    /// routing error.
    pub fn route(&self, request: &TransactionRequest) -> Result<RoutingDecision> {
        for rule in &self.rules {
            if rule.matches(request) {
                debug!(rule = %rule.name, destination = ?rule.destination, "route matched");
                return Ok(RoutingDecision {
                    destination: rule.destination,
                    rule_name: rule.name.clone(),
                    timeout_ms: rule.timeout_ms,
                });
            }
        }
        if let Some((destination, timeout_ms)) = self.default_destination {
            return Ok(RoutingDecision {
                destination,
                rule_name: "default".to_string(),
                timeout_ms,
            });
        }
        Err(FepError::Routing {
            reason: format!(
                "no rule for {:?} via {:?}",
                request.transaction_type, request.channel
            ),
        })
    }

    /// Number of registered rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are registered
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
