//! # Observability
//!
//! Structured logging for the telemetry delivery layer.
//!
//! The delivery crates are **log producers** only. They use standard
//! `tracing` macros and never decide where output goes. The host calls
//! [`init_with_config`] once at startup, which installs:
//!
//! - a JSONL layer appending one JSON object per event to an on-device
//!   log file (when `log_path` is set), and
//! - an optional compact stderr layer for foreground debugging.
//!
//! Without a log path a plain compact `fmt` subscriber is installed.
//!
//! ## Usage
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "delivery".into(),
//!     default_level: "debug".into(),
//!     log_path: Some(paths.log_file()),
//!     ..Default::default()
//! });
//! tracing::info!("delivery layer ready");
//! ```

mod json_layer;
mod writer;

pub use json_layer::{JsonLayer, LogEntry};
pub use writer::{LogFileWriter, WriterFactory};

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the emitting component, included in every JSONL line.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Optional JSONL log file path.
    pub log_path: Option<PathBuf>,

    /// Also emit logs to stderr for immediate feedback.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Initialize logging with default settings for the given service.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize logging with custom configuration.
///
/// Uses `try_init`, so a host application that already installed a global
/// subscriber keeps its own. If the log file cannot be opened the stderr
/// fallback is used instead.
pub fn init_with_config(config: LogConfig) {
    let Some(log_path) = config.log_path.clone() else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter(&config.default_level))
            .with_target(true)
            .compact()
            .try_init();
        return;
    };

    let writer = match LogFileWriter::new(&log_path) {
        Ok(writer) => writer,
        Err(e) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter(&config.default_level))
                .with_target(true)
                .compact()
                .with_writer(io::stderr)
                .try_init();
            tracing::warn!(
                log_path = %log_path.display(),
                error = %e,
                "failed to open log file, logging to stderr"
            );
            return;
        }
    };

    let json_layer = JsonLayer::new(config.service_name.clone(), WriterFactory::new(writer));

    let stderr_layer = if config.also_stderr {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_writer(io::stderr)
                .with_ansi(true),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(json_layer.with_filter(env_filter(&config.default_level)))
        .with(stderr_layer.map(|l| l.with_filter(env_filter(&config.default_level))))
        .try_init();

    if installed.is_ok() {
        tracing::info!(log_path = %log_path.display(), "observability initialized");
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

pub use tracing::{debug, error, info, instrument, trace, warn};
pub use tracing::Level;
