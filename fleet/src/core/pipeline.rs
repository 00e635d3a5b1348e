//! Plan pipeline states and the legal transition table.

use serde::{Deserialize, Serialize};

/// Lifecycle of one repository through the plan pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Initialized,
    Planning,
    Planned,
    Validating,
    Validated,
    Executing,
    Completed,
    Failed,
    Interrupted,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Failed | PipelineState::Interrupted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Initialized => "initialized",
            PipelineState::Planning => "planning",
            PipelineState::Planned => "planned",
            PipelineState::Validating => "validating",
            PipelineState::Validated => "validated",
            PipelineState::Executing => "executing",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
            PipelineState::Interrupted => "interrupted",
        }
    }
}

/// Attempted transition that the table does not permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: PipelineState,
    pub to: PipelineState,
}

/// Whether `from → to` is a legal pipeline transition.
///
/// `Interrupted` and `Failed` are reachable from every non-terminal state.
/// `Initialized → Planned` covers `apply` mode, where the plan is loaded
/// from disk instead of produced by an agent; `Validated → Completed`
/// covers `plan` mode, which stops before execution.
pub fn can_transition(from: PipelineState, to: PipelineState) -> bool {
    use PipelineState as S;
    if from.is_terminal() {
        return false;
    }
    if matches!(to, S::Interrupted | S::Failed) {
        return true;
    }
    matches!(
        (from, to),
        (S::Initialized, S::Planning)
            | (S::Initialized, S::Planned)
            | (S::Planning, S::Planned)
            | (S::Planned, S::Validating)
            | (S::Validating, S::Validated)
            | (S::Validated, S::Executing)
            | (S::Validated, S::Completed)
            | (S::Executing, S::Completed)
    )
}

/// Tracks the current state and rejects illegal transitions.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: PipelineState::Initialized,
            history: vec![PipelineState::Initialized],
        }
    }
}

impl StateMachine {
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn advance(&mut self, to: PipelineState) -> Result<(), IllegalTransition> {
        if !can_transition(self.state, to) {
            return Err(IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.history.push(to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState as S;

    #[test]
    fn full_happy_path_is_legal() {
        let mut sm = StateMachine::default();
        for to in [
            S::Planning,
            S::Planned,
            S::Validating,
            S::Validated,
            S::Executing,
            S::Completed,
        ] {
            sm.advance(to).expect("legal transition");
        }
        assert_eq!(sm.state(), S::Completed);
        assert_eq!(sm.history().len(), 7);
    }

    #[test]
    fn executing_requires_validated() {
        let mut sm = StateMachine::default();
        sm.advance(S::Planning).expect("planning");
        sm.advance(S::Planned).expect("planned");
        let err = sm.advance(S::Executing).unwrap_err();
        assert_eq!(
            err,
            IllegalTransition {
                from: S::Planned,
                to: S::Executing
            }
        );
        assert_eq!(sm.state(), S::Planned);
    }

    #[test]
    fn interrupted_reachable_from_any_non_terminal_state() {
        for from in [
            S::Initialized,
            S::Planning,
            S::Planned,
            S::Validating,
            S::Validated,
            S::Executing,
        ] {
            assert!(can_transition(from, S::Interrupted), "{from:?}");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for from in [S::Completed, S::Failed, S::Interrupted] {
            assert!(!can_transition(from, S::Failed));
            assert!(!can_transition(from, S::Planning));
        }
    }
}
