//! Cache registry error types.

use thiserror::Error;

/// Cache registry error type.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Underlying file store error
    #[error("Store error: {0}")]
    Store(#[from] atomic_file_store::StoreError),

    /// Key cannot be encoded into a cache file name
    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),

    /// Stored content could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using CacheError.
pub type CacheResult<T> = Result<T, CacheError>;
