//! In-process event transport between the orchestrator, build agents and
//! the QA engine.

pub mod event_bus;
pub mod protocol;
