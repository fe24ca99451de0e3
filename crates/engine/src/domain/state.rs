//! The execution state machine shared by workflow and task executions.
//!
//! Both `WorkflowExecution` and `TaskExecution` move through the same six
//! states under the same transition table; only what triggers a transition
//! differs between the two.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A state in the execution lifecycle.
///
/// `SUCCESS` and `ERROR` are terminal: no transition out of them is valid,
/// including to themselves via a distinct event (self-transitions are
/// no-ops, not re-entries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionState {
    Idle,
    Running,
    Stopped,
    Delayed,
    Success,
    Error,
}

impl ExecutionState {
    /// All states reachable from `self` in one valid transition, excluding
    /// the self-transition (which is always valid and always a no-op).
    fn valid_targets(self) -> &'static [ExecutionState] {
        use ExecutionState::*;
        match self {
            Idle => &[Running, Error],
            Running => &[Stopped, Delayed, Success, Error],
            Stopped => &[Running, Error],
            Delayed => &[Running, Error],
            Success => &[],
            Error => &[],
        }
    }

    /// `SUCCESS` or `ERROR`: no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Success | ExecutionState::Error)
    }

    /// `STOPPED` or terminal.
    pub fn is_stopped_or_terminal(self) -> bool {
        self == ExecutionState::Stopped || self.is_terminal()
    }

    /// Whether transitioning from `self` to `target` is permitted.
    ///
    /// Self-transitions are always permitted (and are a no-op); any other
    /// transition is checked against the table above. Terminal states admit
    /// no transition at all.
    pub fn can_transition_to(self, target: ExecutionState) -> bool {
        if self == target {
            return true;
        }
        self.valid_targets().contains(&target)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Idle => "IDLE",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Stopped => "STOPPED",
            ExecutionState::Delayed => "DELAYED",
            ExecutionState::Success => "SUCCESS",
            ExecutionState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Checked transition: returns the target state if the move is valid.
///
/// Call sites that need to reject an invalid transition as a programming
/// error (§3's global invariant) should use this rather than mutating state
/// directly, so `InvalidStateTransition` (§7) has a single origin.
pub fn is_valid_transition(from: ExecutionState, to: ExecutionState) -> bool {
    from.can_transition_to(to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    #[test]
    fn self_transitions_always_valid() {
        for s in [Idle, Running, Stopped, Delayed, Success, Error] {
            assert!(is_valid_transition(s, s), "{s} -> {s} should be valid");
        }
    }

    #[test]
    fn terminal_states_reject_all_other_transitions() {
        for target in [Idle, Running, Stopped, Delayed] {
            assert!(!is_valid_transition(Success, target));
            assert!(!is_valid_transition(Error, target));
        }
    }

    #[test]
    fn idle_transitions() {
        assert!(is_valid_transition(Idle, Running));
        assert!(is_valid_transition(Idle, Error));
        assert!(!is_valid_transition(Idle, Stopped));
        assert!(!is_valid_transition(Idle, Delayed));
        assert!(!is_valid_transition(Idle, Success));
    }

    #[test]
    fn running_transitions() {
        for target in [Stopped, Delayed, Success, Error] {
            assert!(is_valid_transition(Running, target));
        }
        assert!(!is_valid_transition(Running, Idle));
    }

    #[test]
    fn stopped_and_delayed_transitions() {
        for from in [Stopped, Delayed] {
            assert!(is_valid_transition(from, Running));
            assert!(is_valid_transition(from, Error));
            assert!(!is_valid_transition(from, Success));
            assert!(!is_valid_transition(from, Idle));
        }
    }

    #[test]
    fn is_terminal() {
        assert!(Success.is_terminal());
        assert!(Error.is_terminal());
        for s in [Idle, Running, Stopped, Delayed] {
            assert!(!s.is_terminal());
        }
    }

    #[test]
    fn is_stopped_or_terminal() {
        assert!(Stopped.is_stopped_or_terminal());
        assert!(Success.is_stopped_or_terminal());
        assert!(Error.is_stopped_or_terminal());
        assert!(!Idle.is_stopped_or_terminal());
        assert!(!Running.is_stopped_or_terminal());
        assert!(!Delayed.is_stopped_or_terminal());
    }
}
