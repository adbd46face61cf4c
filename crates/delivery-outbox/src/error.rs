//! Outbox error types.

use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Cache registry error
    #[error("Cache error: {0}")]
    Cache(#[from] payload_cache_registry::CacheError),

    /// File store error
    #[error("Store error: {0}")]
    Store(#[from] atomic_file_store::StoreError),

    /// JSON error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Delivery config rejected at open
    #[error("Config error: {0}")]
    Config(#[from] delivery_config_and_utils::CoreError),

    /// Background worker could not be started
    #[error("Worker error: {0}")]
    Worker(#[from] background_workers::WorkerError),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
