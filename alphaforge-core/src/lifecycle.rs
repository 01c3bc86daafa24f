//! Candidate lifecycle state machine.
//!
//! States carry a severity ordinal that only ever grows along the happy path:
//!
//! ```text
//! INIT(0) → PENDING(1) → SIMULATING(5) → SIMULATED_FAIL(8) → SIMULATED(10)
//!        → SELF_CHECKED(12) → CHECKED(15) → ACTIVE(20)
//! ```
//!
//! Two kinds of movement exist:
//! - **Local transitions** (`transition`): driven by the pipeline itself and
//!   checked against the legal edge set. The single backwards edge is the
//!   operator requeue `SIMULATING → PENDING`.
//! - **External merges** (`merge_external`): a status reported by the
//!   simulation service is applied only when its ordinal is strictly
//!   greater, so re-syncing old records can never regress a candidate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle state of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum CandidateState {
    Init = 0,
    Pending = 1,
    Simulating = 5,
    SimulatedFail = 8,
    Simulated = 10,
    SelfChecked = 12,
    Checked = 15,
    Active = 20,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: CandidateState,
        to: CandidateState,
    },
    #[error("unknown state ordinal {0}")]
    UnknownOrdinal(u8),
}

impl CandidateState {
    pub const ALL: [CandidateState; 8] = [
        CandidateState::Init,
        CandidateState::Pending,
        CandidateState::Simulating,
        CandidateState::SimulatedFail,
        CandidateState::Simulated,
        CandidateState::SelfChecked,
        CandidateState::Checked,
        CandidateState::Active,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Result<Self, LifecycleError> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.ordinal() == ordinal)
            .ok_or(LifecycleError::UnknownOrdinal(ordinal))
    }

    pub fn name(self) -> &'static str {
        match self {
            CandidateState::Init => "INIT",
            CandidateState::Pending => "PENDING",
            CandidateState::Simulating => "SIMULATING",
            CandidateState::SimulatedFail => "SIMULATED_FAIL",
            CandidateState::Simulated => "SIMULATED",
            CandidateState::SelfChecked => "SELF_CHECKED",
            CandidateState::Checked => "CHECKED",
            CandidateState::Active => "ACTIVE",
        }
    }

    /// Map a status string reported by the simulation service.
    ///
    /// Unknown statuses map to `None` and leave the local state untouched.
    pub fn from_external_status(status: &str) -> Option<Self> {
        match status.trim().to_ascii_uppercase().as_str() {
            "UNSUBMITTED" => Some(CandidateState::Simulated),
            "FAILED" | "ERROR" => Some(CandidateState::SimulatedFail),
            "SELF_CHECKED" => Some(CandidateState::SelfChecked),
            "CHECKED" | "SUBMITTED" => Some(CandidateState::Checked),
            "ACTIVE" => Some(CandidateState::Active),
            _ => None,
        }
    }

    /// Whether the pipeline may move a candidate from `self` to `to`.
    pub fn can_transition_to(self, to: CandidateState) -> bool {
        use CandidateState::*;
        match (self, to) {
            (Init, Pending) => true,
            (Pending, Simulating) => true,
            (Simulating, Simulated) | (Simulating, SimulatedFail) => true,
            // operator requeue of a sub-batch that never got a verdict
            (Simulating, Pending) => true,
            // post-simulation checks only raise
            (from, to) if from >= SimulatedFail => to > from,
            _ => false,
        }
    }

    /// Checked local transition.
    pub fn transition(self, to: CandidateState) -> Result<CandidateState, LifecycleError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(LifecycleError::IllegalTransition { from: self, to })
        }
    }

    /// Whether a stored candidate may be written with state `to`: unchanged,
    /// a legal local transition, or an external verdict that advances it.
    pub fn admits(self, to: CandidateState) -> bool {
        self == to || self.can_transition_to(to) || (to.is_simulated() && to > self)
    }

    pub fn admit(self, to: CandidateState) -> Result<CandidateState, LifecycleError> {
        if self.admits(to) {
            Ok(to)
        } else {
            Err(LifecycleError::IllegalTransition { from: self, to })
        }
    }

    /// State after merging a state reported externally: advances only.
    pub fn merge_external(self, reported: CandidateState) -> CandidateState {
        if reported > self {
            reported
        } else {
            self
        }
    }

    /// Whether the simulation service has produced a verdict.
    pub fn is_simulated(self) -> bool {
        self >= CandidateState::SimulatedFail
    }
}

impl From<CandidateState> for u8 {
    fn from(state: CandidateState) -> u8 {
        state.ordinal()
    }
}

impl TryFrom<u8> for CandidateState {
    type Error = LifecycleError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_ordinal(value)
    }
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CandidateState::*;

    #[test]
    fn ordinals_match_severity_table() {
        let ordinals: Vec<u8> = CandidateState::ALL.iter().map(|s| s.ordinal()).collect();
        assert_eq!(ordinals, vec![0, 1, 5, 8, 10, 12, 15, 20]);
    }

    #[test]
    fn derive_order_follows_ordinals() {
        for pair in CandidateState::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].ordinal() < pair[1].ordinal());
        }
    }

    #[test]
    fn happy_path_is_legal() {
        let mut s = Init;
        for next in [Pending, Simulating, Simulated, SelfChecked, Checked, Active] {
            s = s.transition(next).unwrap();
        }
        assert_eq!(s, Active);
    }

    #[test]
    fn cannot_skip_simulation() {
        assert!(Pending.transition(Simulated).is_err());
        assert!(Init.transition(Simulating).is_err());
    }

    #[test]
    fn requeue_is_the_only_backwards_edge() {
        assert!(Simulating.can_transition_to(Pending));
        assert!(!Simulated.can_transition_to(Pending));
        assert!(!Active.can_transition_to(Checked));
        assert!(!SimulatedFail.can_transition_to(Simulating));
    }

    #[test]
    fn failed_simulation_can_be_superseded() {
        assert!(SimulatedFail.can_transition_to(Simulated));
    }

    #[test]
    fn merge_external_never_regresses() {
        // Active record re-synced with a stale UNSUBMITTED status
        let reported = CandidateState::from_external_status("UNSUBMITTED").unwrap();
        assert_eq!(reported, Simulated);
        assert_eq!(Active.merge_external(reported), Active);

        assert_eq!(Simulating.merge_external(Simulated), Simulated);
        assert_eq!(Simulated.merge_external(Simulated), Simulated);
    }

    #[test]
    fn admits_external_verdicts_but_not_regressions() {
        assert!(Simulating.admits(Checked));
        assert!(Pending.admits(Simulated));
        assert!(Checked.admits(Checked));
        assert!(Simulating.admits(Pending));
        assert!(!Checked.admits(Simulated));
        assert!(!Pending.admits(Init));
        assert!(Active.admit(SimulatedFail).is_err());
    }

    #[test]
    fn external_status_mapping() {
        assert_eq!(CandidateState::from_external_status("active"), Some(Active));
        assert_eq!(CandidateState::from_external_status("ERROR"), Some(SimulatedFail));
        assert_eq!(CandidateState::from_external_status("SUBMITTED"), Some(Checked));
        assert_eq!(CandidateState::from_external_status("DECOMMISSIONED"), None);
    }

    #[test]
    fn serde_uses_ordinals() {
        assert_eq!(serde_json::to_string(&Simulating).unwrap(), "5");
        let s: CandidateState = serde_json::from_str("12").unwrap();
        assert_eq!(s, SelfChecked);
        assert!(serde_json::from_str::<CandidateState>("3").is_err());
    }
}
