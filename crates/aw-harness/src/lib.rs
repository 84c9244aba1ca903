//! Harness: the execution boundary between build agents and the outside
//! world.
//!
//! - [`provider`]: the `Executor` and `Validator` contracts plus their
//!   process-backed and scripted implementations
//! - [`retry`]: exponential backoff for transient failures
//! - [`shutdown`]: the run-level stop signal

pub mod provider;
pub mod retry;
pub mod shutdown;
