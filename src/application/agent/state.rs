use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Thinking,
    Planning,
    Executing,
    Reflecting,
    Completed,
    Error,
    Paused,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Completed | AgentState::Error)
    }

    pub fn is_active(self) -> bool {
        !matches!(self, AgentState::Idle) && !self.is_terminal()
    }
}

/// Inputs that drive the state machine. Budget exhaustion, aborts, and
/// unhandled failures all arrive as [`Signal::Fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Start,
    PlanRequested,
    PlanReady,
    GoalSatisfied,
    Pause,
    Resume,
    ReflectionDone,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    StateChanged { from: AgentState, to: AgentState },
    StepRecorded { step_id: u64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("signal {signal:?} is not valid in state {state:?}")]
    InvalidTransition { state: AgentState, signal: Signal },
}

/// The only way the agent changes state. Returns the successor state and
/// the events the change emits; callers forward events to subscribers.
pub fn transition(
    state: AgentState,
    signal: Signal,
) -> Result<(AgentState, Vec<AgentEvent>), StateError> {
    use AgentState::*;
    use Signal::*;

    let next = match (state, signal) {
        (Idle, Start) => Thinking,
        (Thinking, PlanRequested) => Planning,
        (Planning, PlanReady) => Executing,
        (Executing, GoalSatisfied) => Reflecting,
        (Executing, Pause) => Paused,
        (Paused, Resume) => Executing,
        (Reflecting, ReflectionDone) => Completed,
        (state, Fail) if state.is_active() => Error,
        (state, signal) => return Err(StateError::InvalidTransition { state, signal }),
    };
    Ok((
        next,
        vec![AgentEvent::StateChanged {
            from: state,
            to: next,
        }],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_traverses_every_phase() {
        let mut state = AgentState::Idle;
        for signal in [
            Signal::Start,
            Signal::PlanRequested,
            Signal::PlanReady,
            Signal::GoalSatisfied,
            Signal::ReflectionDone,
        ] {
            let (next, events) = transition(state, signal).expect("valid edge");
            assert_eq!(
                events,
                vec![AgentEvent::StateChanged {
                    from: state,
                    to: next
                }]
            );
            state = next;
        }
        assert_eq!(state, AgentState::Completed);
    }

    #[test]
    fn pause_and_resume_round_trip() {
        let (paused, _) = transition(AgentState::Executing, Signal::Pause).expect("pause");
        assert_eq!(paused, AgentState::Paused);
        let (resumed, _) = transition(paused, Signal::Resume).expect("resume");
        assert_eq!(resumed, AgentState::Executing);
    }

    #[test]
    fn any_active_state_can_fail() {
        for state in [
            AgentState::Thinking,
            AgentState::Planning,
            AgentState::Executing,
            AgentState::Reflecting,
            AgentState::Paused,
        ] {
            let (next, _) = transition(state, Signal::Fail).expect("fail edge");
            assert_eq!(next, AgentState::Error);
        }
    }

    #[test]
    fn terminal_states_reject_everything() {
        for state in [AgentState::Completed, AgentState::Error] {
            for signal in [Signal::Start, Signal::Fail, Signal::GoalSatisfied] {
                assert!(transition(state, signal).is_err());
            }
        }
    }

    #[test]
    fn idle_only_accepts_start() {
        assert!(transition(AgentState::Idle, Signal::PlanReady).is_err());
        assert!(transition(AgentState::Idle, Signal::Fail).is_err());
        assert!(transition(AgentState::Idle, Signal::Start).is_ok());
    }
}
