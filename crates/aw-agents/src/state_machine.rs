use aw_core::types::AgentStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// BuildAgentState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildAgentState {
    Initializing,
    Running,
    /// Waiting on a file lock held elsewhere.
    Idle,
    Completed,
    Failed,
    Stuck,
}

impl BuildAgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildAgentState::Completed | BuildAgentState::Failed | BuildAgentState::Stuck
        )
    }

    /// The persisted form.
    pub fn status(&self) -> AgentStatus {
        match self {
            BuildAgentState::Initializing => AgentStatus::Initializing,
            BuildAgentState::Running => AgentStatus::Running,
            BuildAgentState::Idle => AgentStatus::Idle,
            BuildAgentState::Completed => AgentStatus::Completed,
            BuildAgentState::Failed => AgentStatus::Failed,
            BuildAgentState::Stuck => AgentStatus::Stuck,
        }
    }
}

impl fmt::Display for BuildAgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.status().fmt(f)
    }
}

// ---------------------------------------------------------------------------
// BuildAgentEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildAgentEvent {
    Start,
    Defer,
    Retry,
    Succeed,
    Fail,
    Escalate,
    HeartbeatLost,
}

impl fmt::Display for BuildAgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BuildAgentEvent::Start => "start",
            BuildAgentEvent::Defer => "defer",
            BuildAgentEvent::Retry => "retry",
            BuildAgentEvent::Succeed => "succeed",
            BuildAgentEvent::Fail => "fail",
            BuildAgentEvent::Escalate => "escalate",
            BuildAgentEvent::HeartbeatLost => "heartbeat_lost",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: BuildAgentState,
        event: BuildAgentEvent,
    },
}

// ---------------------------------------------------------------------------
// BuildAgentStateMachine
// ---------------------------------------------------------------------------

/// Lifecycle of a single build agent instance.
///
/// Valid transitions:
/// - Initializing + Start -> Running
/// - Running + Defer -> Idle
/// - Idle + Start -> Running
/// - Running + Retry -> Running
/// - Running + Succeed -> Completed
/// - Running + Fail -> Failed
/// - Running + Escalate -> Stuck
/// - Initializing | Running | Idle + HeartbeatLost -> Stuck
#[derive(Debug, Clone)]
pub struct BuildAgentStateMachine {
    current: BuildAgentState,
    history: Vec<(BuildAgentState, BuildAgentEvent, BuildAgentState)>,
}

impl BuildAgentStateMachine {
    pub fn new() -> Self {
        Self {
            current: BuildAgentState::Initializing,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> BuildAgentState {
        self.current
    }

    pub fn history(&self) -> &[(BuildAgentState, BuildAgentEvent, BuildAgentState)] {
        &self.history
    }

    fn next(state: BuildAgentState, event: BuildAgentEvent) -> Option<BuildAgentState> {
        use BuildAgentEvent as E;
        use BuildAgentState as S;
        match (state, event) {
            (S::Initializing, E::Start) | (S::Idle, E::Start) => Some(S::Running),
            (S::Running, E::Defer) => Some(S::Idle),
            (S::Running, E::Retry) => Some(S::Running),
            (S::Running, E::Succeed) => Some(S::Completed),
            (S::Running, E::Fail) => Some(S::Failed),
            (S::Running, E::Escalate) => Some(S::Stuck),
            (S::Initializing | S::Running | S::Idle, E::HeartbeatLost) => Some(S::Stuck),
            _ => None,
        }
    }

    pub fn transition(
        &mut self,
        event: BuildAgentEvent,
    ) -> Result<BuildAgentState, StateMachineError> {
        let next = Self::next(self.current, event).ok_or(StateMachineError::InvalidTransition {
            state: self.current,
            event,
        })?;
        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "build agent transition");
        Ok(next)
    }
}

impl Default for BuildAgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
