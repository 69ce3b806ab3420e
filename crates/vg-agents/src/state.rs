use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// OrchestratorState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Starting,
    Registered,
    Working,
    Sleeping,
    Blocked,
    Completed,
    Error,
    Cancelled,
    Idle,
}

impl OrchestratorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorState::Completed
                | OrchestratorState::Error
                | OrchestratorState::Cancelled
                | OrchestratorState::Idle
        )
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OrchestratorState::Starting => "starting",
            OrchestratorState::Registered => "registered",
            OrchestratorState::Working => "working",
            OrchestratorState::Sleeping => "sleeping",
            OrchestratorState::Blocked => "blocked",
            OrchestratorState::Completed => "completed",
            OrchestratorState::Error => "error",
            OrchestratorState::Cancelled => "cancelled",
            OrchestratorState::Idle => "idle",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// An invalid state transition was attempted. Indicates a logic bug in
    /// the orchestration loop, not bad external input.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: OrchestratorState,
        to: OrchestratorState,
    },
}

// ---------------------------------------------------------------------------
// TaskStateMachine
// ---------------------------------------------------------------------------

/// Enforces the orchestrator lifecycle:
/// `starting -> registered -> working -> {sleeping, blocked, completed,
/// error, cancelled}`, with sleeping resolving to working or idle and
/// blocked resolving back to working. Cancellation and failure are legal
/// from every non-terminal state.
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    current: OrchestratorState,
}

impl TaskStateMachine {
    /// Create a new state machine starting in `Starting`.
    pub fn new() -> Self {
        Self {
            current: OrchestratorState::Starting,
        }
    }

    /// Return the current state.
    pub fn state(&self) -> OrchestratorState {
        self.current
    }

    /// Returns `true` if moving to `to` is valid from the current state.
    pub fn can_advance(&self, to: OrchestratorState) -> bool {
        use OrchestratorState::*;
        if !self.current.is_terminal() && matches!(to, Cancelled | Error) {
            return true;
        }
        matches!(
            (self.current, to),
            (Starting, Registered)
                | (Registered, Working)
                | (Working, Sleeping)
                | (Working, Blocked)
                | (Working, Completed)
                | (Sleeping, Working)
                | (Sleeping, Idle)
                | (Blocked, Working)
        )
    }

    /// Attempt a transition to `to`.
    pub fn advance(&mut self, to: OrchestratorState) -> Result<OrchestratorState, StateError> {
        if !self.can_advance(to) {
            return Err(StateError::InvalidTransition {
                from: self.current,
                to,
            });
        }
        let from = self.current;
        self.current = to;
        tracing::debug!(from = %from, to = %to, "orchestrator state transition");
        Ok(to)
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use OrchestratorState::*;

    #[test]
    fn happy_path_transitions() {
        let mut sm = TaskStateMachine::new();
        sm.advance(Registered).unwrap();
        sm.advance(Working).unwrap();
        sm.advance(Blocked).unwrap();
        sm.advance(Working).unwrap();
        sm.advance(Completed).unwrap();
        assert!(sm.state().is_terminal());
    }

    #[test]
    fn sleep_cycle() {
        let mut sm = TaskStateMachine::new();
        sm.advance(Registered).unwrap();
        sm.advance(Working).unwrap();
        sm.advance(Sleeping).unwrap();
        sm.advance(Working).unwrap();
        sm.advance(Sleeping).unwrap();
        sm.advance(Idle).unwrap();
        assert!(sm.state().is_terminal());
    }

    #[test]
    fn cancel_is_legal_from_any_non_terminal_state() {
        for path in [vec![], vec![Registered], vec![Registered, Working]] {
            let mut sm = TaskStateMachine::new();
            for s in path {
                sm.advance(s).unwrap();
            }
            assert!(sm.can_advance(Cancelled));
        }
    }

    #[test]
    fn terminal_states_are_final() {
        let mut sm = TaskStateMachine::new();
        sm.advance(Registered).unwrap();
        sm.advance(Working).unwrap();
        sm.advance(Completed).unwrap();

        assert!(!sm.can_advance(Working));
        assert!(!sm.can_advance(Cancelled));
        let err = sm.advance(Working).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn skipping_registration_is_invalid() {
        let mut sm = TaskStateMachine::new();
        assert!(sm.advance(Working).is_err());
        assert!(sm.advance(Blocked).is_err());
    }
}
