//! Core types, configuration, and utilities for the telemetry delivery layer.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{DeliveryConfig, QueueDepths, DEFAULT_LOG_LEVEL, LOG_LEVEL_ENV};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, init_logging_for_service, SERVICE_NAME};
pub use paths::Paths;
