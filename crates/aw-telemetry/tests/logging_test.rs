use aw_core::config::TelemetryConfig;
use aw_telemetry::logging::{self, LogFormat};

#[test]
fn repeated_initialisation_is_a_no_op() {
    logging::init("aw-test", "debug", LogFormat::Human);
    logging::init("aw-test", "info", LogFormat::Human);
    logging::init("aw-test-json", "info", LogFormat::Json);

    tracing::info!(task = "T-1", "human-readable log line");
}

#[test]
fn init_from_config_accepts_json_override() {
    let cfg = TelemetryConfig {
        log_level: "warn".into(),
        json_logs: false,
    };
    logging::init_from_config("aw-test", &cfg, true);
    tracing::warn!(wave = 0, "json log line");
}

#[tokio::test]
async fn logging_from_async_tasks() {
    logging::init("aw-test-async", "info", LogFormat::Human);
    let handle = tokio::spawn(async {
        tracing::info!(agent = "a-1", "heartbeat");
        7
    });
    assert_eq!(handle.await.unwrap(), 7);
}
