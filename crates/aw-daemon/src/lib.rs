//! Run supervision: wave scheduling, the run loop, heartbeat monitoring and
//! crash recovery for build agents.

pub mod heartbeat;
pub mod orchestrator;
pub mod patrol;
pub mod scheduler;
