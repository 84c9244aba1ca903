//! QA validation: runs a level's checks against a completed task, maps its
//! pass criteria onto them and turns failures into fix tasks.

pub mod criteria;
pub mod engine;
pub mod levels;
pub mod remediation;
