//! Capability gate: decides whether a test may run on a target

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::capability::{Capability, CapabilitySet};
use crate::target::Target;

/// Outcome of evaluating a [`CapabilityGate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateDecision {
    Run,
    /// The target lacks `missing`; the test is skipped, not failed
    Skip { missing: Vec<Capability> },
}

impl GateDecision {
    pub fn should_run(&self) -> bool {
        matches!(self, GateDecision::Run)
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateDecision::Run => write!(f, "run"),
            GateDecision::Skip { missing } => {
                let names: Vec<&str> = missing.iter().map(Capability::as_str).collect();
                write!(f, "target lacks required capabilities: {}", names.join(", "))
            }
        }
    }
}

/// Required-capability predicate attached to a test
///
/// Holds no state across evaluations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGate {
    required: CapabilitySet,
}

impl CapabilityGate {
    pub fn new<C: Into<Capability>>(required: impl IntoIterator<Item = C>) -> Self {
        Self {
            required: required.into_iter().collect(),
        }
    }

    /// Gate that lets every test through
    pub fn none() -> Self {
        Self::default()
    }

    pub fn required(&self) -> &CapabilitySet {
        &self.required
    }

    pub fn evaluate(&self, target: &Target) -> GateDecision {
        self.evaluate_set(target.capabilities())
    }

    pub fn evaluate_set(&self, available: &CapabilitySet) -> GateDecision {
        if self.required.is_subset(available) {
            GateDecision::Run
        } else {
            let decision = GateDecision::Skip {
                missing: self.required.missing_from(available),
            };
            info!("Skipping: {}", decision);
            decision
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(&[], &[], true ; "nothing required")]
    #[test_case(&["exec"], &["exec", "restart"], true ; "subset")]
    #[test_case(&["exec", "restart"], &["exec", "restart"], true ; "equal sets")]
    #[test_case(&["ssh"], &["exec"], false ; "disjoint")]
    #[test_case(&["exec", "ssh"], &["exec"], false ; "partial overlap")]
    #[test_case(&["exec"], &[], false ; "empty target")]
    fn test_runs_iff_subset(required: &[&str], available: &[&str], runs: bool) {
        let gate = CapabilityGate::new(required.iter().copied());
        let available: CapabilitySet = available.iter().copied().collect();
        assert_eq!(gate.evaluate_set(&available).should_run(), runs);
    }

    #[test]
    fn test_skip_names_missing_capabilities() {
        let gate = CapabilityGate::new(["non-existing-capability", "exec"]);
        let available: CapabilitySet = ["exec"].into_iter().collect();

        let decision = gate.evaluate_set(&available);
        assert_eq!(
            decision,
            GateDecision::Skip {
                missing: vec![Capability::new("non-existing-capability")]
            }
        );
        assert!(decision.to_string().contains("non-existing-capability"));
    }
}
