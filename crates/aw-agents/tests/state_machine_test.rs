use aw_agents::state_machine::{
    BuildAgentEvent, BuildAgentState, BuildAgentStateMachine, StateMachineError,
};
use aw_core::types::AgentStatus;

#[test]
fn starts_initializing_and_runs() {
    let mut sm = BuildAgentStateMachine::new();
    assert_eq!(sm.state(), BuildAgentState::Initializing);
    assert_eq!(
        sm.transition(BuildAgentEvent::Start).unwrap(),
        BuildAgentState::Running
    );
}

#[test]
fn retry_stays_running_and_is_recorded() {
    let mut sm = BuildAgentStateMachine::new();
    sm.transition(BuildAgentEvent::Start).unwrap();
    sm.transition(BuildAgentEvent::Retry).unwrap();
    sm.transition(BuildAgentEvent::Retry).unwrap();
    assert_eq!(sm.state(), BuildAgentState::Running);
    assert_eq!(sm.history().len(), 3);
    assert_eq!(
        sm.history()[1],
        (
            BuildAgentState::Running,
            BuildAgentEvent::Retry,
            BuildAgentState::Running
        )
    );
}

#[test]
fn deferral_parks_in_idle_until_restarted() {
    let mut sm = BuildAgentStateMachine::new();
    sm.transition(BuildAgentEvent::Start).unwrap();
    assert_eq!(
        sm.transition(BuildAgentEvent::Defer).unwrap(),
        BuildAgentState::Idle
    );
    assert!(sm.transition(BuildAgentEvent::Succeed).is_err());
    sm.transition(BuildAgentEvent::Start).unwrap();
    assert_eq!(
        sm.transition(BuildAgentEvent::Succeed).unwrap(),
        BuildAgentState::Completed
    );
}

#[test]
fn escalate_and_fail_are_terminal() {
    for (event, expected) in [
        (BuildAgentEvent::Escalate, BuildAgentState::Stuck),
        (BuildAgentEvent::Fail, BuildAgentState::Failed),
    ] {
        let mut sm = BuildAgentStateMachine::new();
        sm.transition(BuildAgentEvent::Start).unwrap();
        assert_eq!(sm.transition(event).unwrap(), expected);
        assert!(sm.state().is_terminal());
        assert!(sm.transition(BuildAgentEvent::Start).is_err());
    }
}

#[test]
fn heartbeat_loss_from_any_live_state() {
    let mut init = BuildAgentStateMachine::new();
    assert_eq!(
        init.transition(BuildAgentEvent::HeartbeatLost).unwrap(),
        BuildAgentState::Stuck
    );

    let mut idle = BuildAgentStateMachine::new();
    idle.transition(BuildAgentEvent::Start).unwrap();
    idle.transition(BuildAgentEvent::Defer).unwrap();
    assert_eq!(
        idle.transition(BuildAgentEvent::HeartbeatLost).unwrap(),
        BuildAgentState::Stuck
    );
}

#[test]
fn invalid_transition_leaves_state_untouched() {
    let mut sm = BuildAgentStateMachine::new();
    let err = sm.transition(BuildAgentEvent::Succeed).unwrap_err();
    assert_eq!(
        err,
        StateMachineError::InvalidTransition {
            state: BuildAgentState::Initializing,
            event: BuildAgentEvent::Succeed,
        }
    );
    assert_eq!(sm.state(), BuildAgentState::Initializing);
    assert!(sm.history().is_empty());

    sm.transition(BuildAgentEvent::Start).unwrap();
    sm.transition(BuildAgentEvent::Succeed).unwrap();
    assert!(sm.transition(BuildAgentEvent::HeartbeatLost).is_err());
}

#[test]
fn states_map_onto_persisted_status() {
    assert_eq!(BuildAgentState::Idle.status(), AgentStatus::Idle);
    assert_eq!(BuildAgentState::Stuck.status(), AgentStatus::Stuck);
    assert_eq!(BuildAgentState::Running.to_string(), "running");
}
