//! Worker error types.

use thiserror::Error;

/// Worker error type.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The worker runtime could not be started
    #[error("Failed to start worker {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using WorkerError.
pub type WorkerResult<T> = Result<T, WorkerError>;
