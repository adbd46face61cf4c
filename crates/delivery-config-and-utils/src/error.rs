use std::path::PathBuf;
use thiserror::Error;

/// Failure to resolve paths or load the delivery configuration.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A tunable holds a value the delivery layer cannot run with.
    #[error("invalid config value for `{field}`: {reason}")]
    Config { field: &'static str, reason: String },

    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The platform reports no local data directory to put the cache under.
    #[error("no local data directory available")]
    Path,
}

impl CoreError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| CoreError::Io { path, source }
    }

    pub(crate) fn json(path: impl Into<PathBuf>) -> impl FnOnce(serde_json::Error) -> Self {
        let path = path.into();
        move |source| CoreError::Json { path, source }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
