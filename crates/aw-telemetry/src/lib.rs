//! Logging and metrics for the auto-wave orchestrator.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   filtered by `RUST_LOG` or the configured default level.
//! - **Metrics**: process-wide counters, gauges and histograms for waves,
//!   agent attempts and QA checks, exportable as Prometheus text.

pub mod logging;
pub mod metrics;
