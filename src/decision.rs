//! Decision Engine
//!
//! Ordered rule list; the first rule returning a non-`Undecided` verdict
//! wins. Missing information never produces `Block`.
//!
//! ```text
//! IdentityListRule ──► KnownIdentityRule ──► FailOpenRule (optional)
//! ```

use std::collections::HashSet;

use crate::config::DecisionConfig;
use crate::flow::{Decision, FlowState};

/// One verdict rule
pub trait DecisionRule: Send + Sync {
    fn evaluate(&self, flow: &FlowState) -> Decision;
    fn name(&self) -> &'static str;
}

/// Ordered rule evaluator
pub struct DecisionEngine {
    rules: Vec<Box<dyn DecisionRule>>,
}

impl DecisionEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Build the rule chain described by `config`
    pub fn from_config(config: &DecisionConfig) -> Self {
        let mut engine = Self::new();
        if !config.allowed_identities.is_empty() || !config.blocked_identities.is_empty() {
            engine.add_rule(Box::new(IdentityListRule::new(
                config.allowed_identities.iter().copied(),
                config.blocked_identities.iter().copied(),
            )));
        }
        engine.add_rule(Box::new(KnownIdentityRule));
        if config.fail_open_unattributed {
            engine.add_rule(Box::new(FailOpenRule::new(config.fail_open_after_attempts)));
        }
        engine
    }

    pub fn add_rule(&mut self, rule: Box<dyn DecisionRule>) {
        self.rules.push(rule);
    }

    #[inline]
    pub fn evaluate(&self, flow: &FlowState) -> Decision {
        for rule in &self.rules {
            match rule.evaluate(flow) {
                Decision::Undecided => continue,
                verdict => {
                    tracing::trace!("{} decided {:?} for {}", rule.name(), verdict, flow.key());
                    return verdict;
                }
            }
        }
        Decision::Undecided
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::from_config(&DecisionConfig::default())
    }
}

/// Write `decision` to the flow. Compare-and-set from `Undecided`; a flow
/// that already carries a verdict is left untouched.
pub fn apply_decision(flow: &mut FlowState, decision: Decision) -> bool {
    flow.transition_decision(decision)
}

/// Explicit per-identity verdicts. Block wins when an identity is in both lists.
pub struct IdentityListRule {
    allowed: HashSet<u32>,
    blocked: HashSet<u32>,
}

impl IdentityListRule {
    pub fn new(
        allowed: impl IntoIterator<Item = u32>,
        blocked: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
            blocked: blocked.into_iter().collect(),
        }
    }
}

impl DecisionRule for IdentityListRule {
    fn evaluate(&self, flow: &FlowState) -> Decision {
        match flow.identity() {
            Some(id) if self.blocked.contains(&id) => Decision::Block,
            Some(id) if self.allowed.contains(&id) => Decision::Allow,
            _ => Decision::Undecided,
        }
    }

    fn name(&self) -> &'static str {
        "identity-list"
    }
}

/// Allow once the owner is known
pub struct KnownIdentityRule;

impl DecisionRule for KnownIdentityRule {
    fn evaluate(&self, flow: &FlowState) -> Decision {
        if flow.identity().is_some() {
            Decision::Allow
        } else {
            Decision::Undecided
        }
    }

    fn name(&self) -> &'static str {
        "known-identity"
    }
}

/// Allow flows whose owner lookups have missed `min_attempts` times.
/// Attempts are spaced by the attribution retry interval, so with two or
/// more the owner table has been re-read at least once.
pub struct FailOpenRule {
    min_attempts: u32,
}

impl FailOpenRule {
    pub fn new(min_attempts: u32) -> Self {
        Self {
            min_attempts: min_attempts.max(1),
        }
    }
}

impl DecisionRule for FailOpenRule {
    fn evaluate(&self, flow: &FlowState) -> Decision {
        if flow.identity().is_none() && flow.attribution_attempts() >= self.min_attempts {
            Decision::Allow
        } else {
            Decision::Undecided
        }
    }

    fn name(&self) -> &'static str {
        "fail-open"
    }
}
