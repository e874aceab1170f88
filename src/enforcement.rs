//! Enforcement Controller
//!
//! Turns a verdict into enforcement readiness. Allowing is immediate;
//! blocking waits for a confidence gate (minimum flow age and a known
//! owner). Transitions only ever leave `None`.

use std::time::{Duration, Instant};

use crate::config::EnforcementConfig;
use crate::flow::{Decision, EnforcementState, FlowState};

pub struct EnforcementController {
    block_min_age: Duration,
}

impl EnforcementController {
    pub fn new(config: &EnforcementConfig) -> Self {
        Self {
            block_min_age: config.block_min_age(),
        }
    }

    /// State the flow should move to at `now`; `None` when the gate holds
    pub fn target(&self, flow: &FlowState, now: Instant) -> EnforcementState {
        match flow.decision() {
            Decision::Undecided => EnforcementState::None,
            Decision::Allow => EnforcementState::AllowReady,
            Decision::Block if self.block_gate(flow, now) => EnforcementState::BlockReady,
            Decision::Block => EnforcementState::None,
        }
    }

    fn block_gate(&self, flow: &FlowState, now: Instant) -> bool {
        flow.age(now) >= self.block_min_age && flow.identity().is_some()
    }

    /// One evaluation pass over `flow`. Returns true when the state moved.
    pub fn evaluate(&self, flow: &mut FlowState, now: Instant) -> bool {
        if flow.enforcement() != EnforcementState::None {
            return false;
        }
        let target = self.target(flow, now);
        let moved = flow.transition_enforcement(target);
        if moved {
            tracing::debug!("{} enforcement {:?}", flow.key(), target);
        }
        moved
    }
}

impl Default for EnforcementController {
    fn default() -> Self {
        Self::new(&EnforcementConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::apply_decision;
    use crate::packet::{FlowKey, IPPROTO_UDP};
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn flow(start: Instant, decision: Decision, identity: Option<u32>) -> FlowState {
        let key = FlowKey::new(
            Ipv4Addr::new(10, 0, 0, 2),
            40000,
            Ipv4Addr::new(8, 8, 8, 8),
            53,
            IPPROTO_UDP,
        );
        let mut state = FlowState::new(key, start);
        if let Some(id) = identity {
            state.set_identity(id);
        }
        apply_decision(&mut state, decision);
        state
    }

    #[test]
    fn test_allow_is_immediate() {
        let ctl = EnforcementController::default();
        let start = Instant::now();
        let mut state = flow(start, Decision::Allow, None);
        assert!(ctl.evaluate(&mut state, start));
        assert_eq!(state.enforcement(), EnforcementState::AllowReady);
    }

    #[test]
    fn test_undecided_stays_none() {
        let ctl = EnforcementController::default();
        let start = Instant::now();
        let mut state = flow(start, Decision::Undecided, Some(1));
        assert!(!ctl.evaluate(&mut state, start + Duration::from_secs(60)));
        assert_eq!(state.enforcement(), EnforcementState::None);
    }

    #[test]
    fn test_block_confidence_gate() {
        let ctl = EnforcementController::default();
        let start = Instant::now();
        let cases = [
            (0, None, EnforcementState::None),
            (0, Some(10_001), EnforcementState::None),
            (4_999, None, EnforcementState::None),
            (4_999, Some(10_001), EnforcementState::None),
            (5_000, None, EnforcementState::None),
            (5_000, Some(10_001), EnforcementState::BlockReady),
        ];

        for (age_ms, identity, expected) in cases {
            let mut state = flow(start, Decision::Block, identity);
            ctl.evaluate(&mut state, start + Duration::from_millis(age_ms));
            assert_eq!(
                state.enforcement(),
                expected,
                "age {}ms identity {:?}",
                age_ms,
                identity
            );
        }
    }

    #[test]
    fn test_gated_block_retried_next_pass() {
        let ctl = EnforcementController::default();
        let start = Instant::now();
        let mut state = flow(start, Decision::Block, Some(3));

        assert!(!ctl.evaluate(&mut state, start + Duration::from_secs(1)));
        assert!(ctl.evaluate(&mut state, start + Duration::from_secs(20)));
        assert_eq!(state.enforcement(), EnforcementState::BlockReady);
    }

    proptest! {
        #[test]
        fn enforcement_never_reverts(
            block in any::<bool>(),
            identity in proptest::option::of(any::<u32>()),
            ages in proptest::collection::vec(0u64..20_000, 1..16),
        ) {
            let ctl = EnforcementController::default();
            let start = Instant::now();
            let decision = if block { Decision::Block } else { Decision::Allow };
            let mut state = flow(start, decision, identity);

            let mut settled = EnforcementState::None;
            for age in ages {
                ctl.evaluate(&mut state, start + Duration::from_millis(age));
                if settled != EnforcementState::None {
                    prop_assert_eq!(state.enforcement(), settled);
                }
                settled = state.enforcement();
            }
        }
    }
}
