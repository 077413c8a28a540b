//! Lifecycle states of a supervised server process.

use serde::Serialize;
use thiserror::Error;

use crate::utils::current_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Stopped,
    Starting,
    Ready,
    /// Failed while Ready; not offered invocations while restarts run.
    Degraded,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(State, State),
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    pub state: State,
    /// Unix seconds when `state` was entered.
    pub entered_at: u64,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: State::Stopped,
            entered_at: current_timestamp(),
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: State) -> bool {
        matches!(
            (self.state, to),
            (State::Stopped, State::Starting)
                | (State::Starting, State::Ready)
                | (State::Starting, State::Stopped)
                | (State::Ready, State::Degraded)
                | (State::Ready, State::Stopped)
                | (State::Degraded, State::Ready)
                | (State::Degraded, State::Stopped)
        )
    }

    pub fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            self.entered_at = current_timestamp();
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
