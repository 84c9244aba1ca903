use aw_core::config::TelemetryConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
///
/// Safe to call more than once; later calls are no-ops, which keeps tests
/// that each initialise logging from fighting over the subscriber.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let installed = match format {
        LogFormat::Human => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_level(true)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .with_level(true)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::debug!(service = service_name, format = ?format, "logging initialised");
    }
}

/// Initialise from the `[telemetry]` config section. `force_json` is the
/// CLI's `--json-logs` flag.
pub fn init_from_config(service_name: &str, config: &TelemetryConfig, force_json: bool) {
    let format = if force_json || config.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Human
    };
    init(service_name, &config.log_level, format);
}
