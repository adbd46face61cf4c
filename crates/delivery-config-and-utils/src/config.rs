//! Delivery layer configuration.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable overriding the configured log level.
pub const LOG_LEVEL_ENV: &str = "TELEMETRY_LOG_LEVEL";

/// Maximum number of calls waiting per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDepths {
    pub sessions: usize,
    pub events: usize,
    pub logging: usize,
    pub network: usize,
    pub blobs: usize,
    pub unknown: usize,
}

impl Default for QueueDepths {
    fn default() -> Self {
        Self {
            sessions: 100,
            events: 100,
            logging: 100,
            network: 50,
            blobs: 50,
            unknown: 50,
        }
    }
}

impl QueueDepths {
    /// Total number of calls that can be waiting across all endpoints.
    pub fn total(&self) -> usize {
        self.sessions + self.events + self.logging + self.network + self.blobs + self.unknown
    }
}

/// Tunables of the delivery layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Capacity of the session snapshot cache.
    #[serde(default = "default_max_cached_entries")]
    pub max_cached_entries: usize,
    /// Capacity of the payload cache. Defaults to the total queue depth.
    #[serde(default = "default_max_cached_payloads")]
    pub max_cached_payloads: usize,
    /// First delay after a pass with transient failures.
    #[serde(default = "default_base_retry_period_secs")]
    pub base_retry_period_secs: u64,
    /// Retrying stops for the process life once the delay would exceed this.
    #[serde(default = "default_max_retry_period_secs")]
    pub max_retry_period_secs: u64,
    /// Base of the per-endpoint rate-limit cooldown without a Retry-After.
    #[serde(default = "default_rate_limit_backoff_base")]
    pub rate_limit_backoff_base: u32,
    #[serde(default)]
    pub queue_depths: QueueDepths,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_max_cached_entries() -> usize {
    64
}

fn default_max_cached_payloads() -> usize {
    QueueDepths::default().total()
}

fn default_base_retry_period_secs() -> u64 {
    120
}

fn default_max_retry_period_secs() -> u64 {
    3600
}

fn default_rate_limit_backoff_base() -> u32 {
    3
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            max_cached_entries: default_max_cached_entries(),
            max_cached_payloads: default_max_cached_payloads(),
            base_retry_period_secs: default_base_retry_period_secs(),
            max_retry_period_secs: default_max_retry_period_secs(),
            rate_limit_backoff_base: default_rate_limit_backoff_base(),
            queue_depths: QueueDepths::default(),
        }
    }
}

impl DeliveryConfig {
    /// Create a new config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from `<base>/config.json`, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            let config = Self::load_from_file(&config_path)?;
            info!(path = %config_path.display(), "Loaded delivery config");
            config
        } else {
            debug!(path = %config_path.display(), "No delivery config file, using defaults");
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    /// Load and validate configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(CoreError::io(path))?;
        let config: DeliveryConfig =
            serde_json::from_str(&content).map_err(CoreError::json(path))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `<base>/config.json`.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let config_path = paths.config_file();
        let content = serde_json::to_string_pretty(self).map_err(CoreError::json(&config_path))?;
        std::fs::write(&config_path, content).map_err(CoreError::io(&config_path))?;
        Ok(())
    }

    /// Reject tunables that would stall delivery or retry without end.
    pub fn validate(&self) -> CoreResult<()> {
        if self.base_retry_period_secs == 0 {
            return Err(CoreError::Config {
                field: "base_retry_period_secs",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.max_retry_period_secs < self.base_retry_period_secs {
            return Err(CoreError::Config {
                field: "max_retry_period_secs",
                reason: format!(
                    "{} is below base_retry_period_secs ({})",
                    self.max_retry_period_secs, self.base_retry_period_secs
                ),
            });
        }
        if self.rate_limit_backoff_base < 2 {
            return Err(CoreError::Config {
                field: "rate_limit_backoff_base",
                reason: "cooldowns must grow, use 2 or more".to_string(),
            });
        }
        Ok(())
    }

    pub fn base_retry_period(&self) -> Duration {
        Duration::from_secs(self.base_retry_period_secs)
    }

    pub fn max_retry_period(&self) -> Duration {
        Duration::from_secs(self.max_retry_period_secs)
    }

    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var(LOG_LEVEL_ENV) {
            if !log_level.trim().is_empty() {
                self.log_level = log_level.trim().to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = DeliveryConfig::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.max_cached_entries, 64);
        assert_eq!(config.max_cached_payloads, 450);
        assert_eq!(config.base_retry_period(), Duration::from_secs(120));
        assert_eq!(config.max_retry_period(), Duration::from_secs(3600));
        assert_eq!(config.rate_limit_backoff_base, 3);
    }

    #[test]
    fn test_default_queue_depths() {
        let depths = QueueDepths::default();
        assert_eq!(depths.sessions, 100);
        assert_eq!(depths.events, 100);
        assert_eq!(depths.logging, 100);
        assert_eq!(depths.network, 50);
        assert_eq!(depths.blobs, 50);
        assert_eq!(depths.unknown, 50);
    }

    #[test]
    fn test_config_load_from_file_fills_missing_fields() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{
                "max_cached_entries": 8,
                "queue_depths": { "events": 5 }
            }"#,
        )
        .unwrap();

        let config = DeliveryConfig::load_from_file(&config_path).unwrap();
        assert_eq!(config.max_cached_entries, 8);
        assert_eq!(config.queue_depths.events, 5);
        assert_eq!(config.queue_depths.sessions, 100);
        assert_eq!(config.base_retry_period_secs, 120);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = DeliveryConfig::default();
        config.max_retry_period_secs = 600;
        config.save(&paths).unwrap();

        let loaded = DeliveryConfig::load(&paths).unwrap();
        assert_eq!(loaded.max_retry_period_secs, 600);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = DeliveryConfig::load(&paths).unwrap();
        assert_eq!(config.max_cached_payloads, 450);
    }

    #[test]
    fn test_config_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, "{ not json").unwrap();

        assert!(DeliveryConfig::load_from_file(&config_path).is_err());
    }

    #[test]
    fn test_zero_base_retry_period_is_rejected() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, r#"{ "base_retry_period_secs": 0 }"#).unwrap();

        let err = DeliveryConfig::load_from_file(&config_path).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Config { field: "base_retry_period_secs", .. }
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_and_flat_backoff() {
        let mut config = DeliveryConfig::default();
        config.max_retry_period_secs = 60;
        assert!(matches!(
            config.validate(),
            Err(CoreError::Config { field: "max_retry_period_secs", .. })
        ));

        let mut config = DeliveryConfig::default();
        config.rate_limit_backoff_base = 1;
        assert!(matches!(
            config.validate(),
            Err(CoreError::Config { field: "rate_limit_backoff_base", .. })
        ));

        assert!(DeliveryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_malformed_file_error_names_the_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, "42").unwrap();

        let err = DeliveryConfig::load_from_file(&config_path).unwrap_err();
        assert!(matches!(err, CoreError::Json { .. }));
        assert!(err.to_string().contains("config.json"));
    }
}
