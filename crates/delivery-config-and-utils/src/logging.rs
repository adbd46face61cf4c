//! Logging initialization for SDK hosts.

use crate::{DeliveryConfig, Paths};

/// Service name stamped on every log line.
pub const SERVICE_NAME: &str = "telemetry-delivery";

/// Initialize logging for the delivery layer.
///
/// Writes structured JSONL to `<base>/logs/delivery.jsonl`, filtered by
/// `RUST_LOG` or the configured level. Does nothing if the host already
/// installed a subscriber.
pub fn init_logging(config: &DeliveryConfig, paths: &Paths) {
    init_logging_for_service(SERVICE_NAME, config, paths, false);
}

/// Same as [`init_logging`], optionally mirroring logs to stderr.
pub fn init_logging_for_service(
    service_name: &str,
    config: &DeliveryConfig,
    paths: &Paths,
    also_stderr: bool,
) {
    observability::init_with_config(observability::LogConfig {
        service_name: service_name.into(),
        default_level: config.log_level.clone(),
        log_path: Some(paths.log_file()),
        also_stderr,
    });
}
