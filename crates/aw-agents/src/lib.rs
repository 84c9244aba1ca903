//! Build agents: one per in-flight task, driving it through lock,
//! checkpoint, execute and validate with retries and escalation.

pub mod build_agent;
pub mod heartbeat;
pub mod policy;
pub mod state_machine;
