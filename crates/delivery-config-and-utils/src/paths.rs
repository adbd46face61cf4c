//! File system paths for the delivery layer.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;
use tracing::debug;

/// Directory name under the platform data directory.
const APP_DIR_NAME: &str = "telemetry-sdk";

/// Manages file system paths for the delivery layer.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory (<data-local-dir>/telemetry-sdk)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance under the platform's local data directory.
    pub fn new() -> CoreResult<Self> {
        let data_dir = dirs::data_local_dir().ok_or(CoreError::Path)?;

        Ok(Self {
            base_dir: data_dir.join(APP_DIR_NAME),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory.
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (<base>/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the cache directory holding payloads, snapshots and the pending-call record.
    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join("cache")
    }

    /// Get the logs directory (<base>/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Get the JSONL log file path (<base>/logs/delivery.jsonl).
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("delivery.jsonl")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        for dir in [self.base_dir.clone(), self.cache_dir(), self.logs_dir()] {
            std::fs::create_dir_all(&dir).map_err(CoreError::io(&dir))?;
        }
        debug!(base_dir = %self.base_dir.display(), "Delivery directories ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_with_base_dir() {
        let base = PathBuf::from("/tmp/test-telemetry");
        let paths = Paths::with_base_dir(base.clone());

        assert_eq!(paths.base_dir(), &base);
        assert_eq!(paths.config_file(), base.join("config.json"));
        assert_eq!(paths.cache_dir(), base.join("cache"));
        assert_eq!(paths.logs_dir(), base.join("logs"));
        assert_eq!(paths.log_file(), base.join("logs/delivery.jsonl"));
    }

    #[test]
    fn test_ensure_dirs_creates_layout() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().join("sdk"));

        paths.ensure_dirs().unwrap();
        assert!(paths.cache_dir().is_dir());
        assert!(paths.logs_dir().is_dir());
    }

    #[test]
    fn test_default_paths_end_with_app_dir() {
        if let Ok(paths) = Paths::new() {
            assert!(paths.base_dir().ends_with(APP_DIR_NAME));
        }
    }
}
