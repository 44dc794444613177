//! Canonical Run State
//!
//! The backend-agnostic lifecycle every adapter maps onto, and the rule
//! that folds per-environment states into one state for a whole test.
//!
//! Variants are declared in order of terminality, so the derived `Ord`
//! ranks `UNKNOWN` lowest and `CANCELED` highest. The order says nothing
//! about time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PortabilityError;

/// Lifecycle state of a run, as reported to callers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalState {
    Unknown,
    Queued,
    Initializing,
    Running,
    Paused,
    Complete,
    ExecutorError,
    SystemError,
    Canceled,
}

impl CanonicalState {
    /// Every state, lowest terminality first.
    pub const ALL: [CanonicalState; 9] = [
        Self::Unknown,
        Self::Queued,
        Self::Initializing,
        Self::Running,
        Self::Paused,
        Self::Complete,
        Self::ExecutorError,
        Self::SystemError,
        Self::Canceled,
    ];

    /// Returns true if no transition may leave this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::ExecutorError | Self::SystemError | Self::Canceled
        )
    }

    /// Returns true for the two failure states.
    pub fn is_error(self) -> bool {
        matches!(self, Self::ExecutorError | Self::SystemError)
    }

    /// Wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Queued => "QUEUED",
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Complete => "COMPLETE",
            Self::ExecutorError => "EXECUTOR_ERROR",
            Self::SystemError => "SYSTEM_ERROR",
            Self::Canceled => "CANCELED",
        }
    }

    /// Applies a freshly observed state on top of a previously known one.
    ///
    /// Terminal states are sticky: once a run is known to be finished, a
    /// later observation cannot move it anywhere else.
    pub fn advance_to(self, observed: CanonicalState) -> CanonicalState {
        if self.is_terminal() {
            self
        } else {
            observed
        }
    }
}

impl fmt::Display for CanonicalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalState {
    type Err = PortabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| PortabilityError::Invalid(format!("unknown state '{}'", s)))
    }
}

/// Folds the states of every environment of a test into one state.
///
/// - no environments: `UNKNOWN`
/// - every environment `COMPLETE`: `COMPLETE`
/// - any environment failed: `EXECUTOR_ERROR`, even while others run
/// - any environment outstanding: the most advanced outstanding state
///   (`RUNNING` dominates `QUEUED`)
/// - otherwise every environment finished without failing but not all
///   completed, which leaves `CANCELED`
pub fn aggregate_state(states: &[CanonicalState]) -> CanonicalState {
    if states.is_empty() {
        return CanonicalState::Unknown;
    }

    if states.iter().all(|s| *s == CanonicalState::Complete) {
        return CanonicalState::Complete;
    }

    if states.iter().any(|s| s.is_error()) {
        return CanonicalState::ExecutorError;
    }

    if let Some(outstanding) = states.iter().copied().filter(|s| !s.is_terminal()).max() {
        return outstanding;
    }

    CanonicalState::Canceled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combinations(len: usize) -> Vec<Vec<CanonicalState>> {
        let mut out: Vec<Vec<CanonicalState>> = vec![Vec::new()];
        for _ in 0..len {
            out = out
                .into_iter()
                .flat_map(|prefix| {
                    CanonicalState::ALL.iter().map(move |s| {
                        let mut next = prefix.clone();
                        next.push(*s);
                        next
                    })
                })
                .collect();
        }
        out
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = CanonicalState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 4);
        assert!(!CanonicalState::Paused.is_terminal());
        assert!(CanonicalState::Canceled.is_terminal());
    }

    #[test]
    fn test_terminality_order() {
        assert!(CanonicalState::Unknown < CanonicalState::Queued);
        assert!(CanonicalState::Queued < CanonicalState::Running);
        assert!(CanonicalState::Running < CanonicalState::Complete);
        for s in CanonicalState::ALL {
            if s.is_terminal() {
                assert!(s > CanonicalState::Paused);
            }
        }
    }

    #[test]
    fn test_parse_and_display() {
        for s in CanonicalState::ALL {
            assert_eq!(s.as_str().parse::<CanonicalState>().unwrap(), s);
            assert_eq!(s.to_string(), s.as_str());
        }
        assert!("Complete".parse::<CanonicalState>().is_err());
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&CanonicalState::ExecutorError).unwrap();
        assert_eq!(json, "\"EXECUTOR_ERROR\"");
        let back: CanonicalState = serde_json::from_str("\"INITIALIZING\"").unwrap();
        assert_eq!(back, CanonicalState::Initializing);
    }

    #[test]
    fn test_advance_keeps_terminal() {
        assert_eq!(
            CanonicalState::Complete.advance_to(CanonicalState::Running),
            CanonicalState::Complete
        );
        assert_eq!(
            CanonicalState::Queued.advance_to(CanonicalState::Running),
            CanonicalState::Running
        );
    }

    #[test]
    fn test_aggregate_complete_iff_all_complete() {
        for len in 1..=3 {
            for states in combinations(len) {
                let all_complete = states.iter().all(|s| *s == CanonicalState::Complete);
                assert_eq!(
                    aggregate_state(&states) == CanonicalState::Complete,
                    all_complete,
                    "states: {:?}",
                    states
                );
            }
        }
    }

    #[test]
    fn test_aggregate_error_wins() {
        for len in 1..=3 {
            for states in combinations(len) {
                if states.iter().any(|s| s.is_error()) {
                    assert_eq!(aggregate_state(&states), CanonicalState::ExecutorError);
                }
            }
        }
    }

    #[test]
    fn test_aggregate_outstanding_dominance() {
        let states = [CanonicalState::Queued, CanonicalState::Running];
        assert_eq!(aggregate_state(&states), CanonicalState::Running);

        let states = [CanonicalState::Complete, CanonicalState::Queued];
        assert_eq!(aggregate_state(&states), CanonicalState::Queued);
    }

    #[test]
    fn test_aggregate_submission_failure_scenario() {
        let states = [CanonicalState::Queued, CanonicalState::ExecutorError];
        assert_eq!(aggregate_state(&states), CanonicalState::ExecutorError);
    }

    #[test]
    fn test_aggregate_edge_cases() {
        assert_eq!(aggregate_state(&[]), CanonicalState::Unknown);
        assert_eq!(
            aggregate_state(&[CanonicalState::Complete, CanonicalState::Canceled]),
            CanonicalState::Canceled
        );
        assert_eq!(
            aggregate_state(&[CanonicalState::Unknown]),
            CanonicalState::Unknown
        );
    }
}
