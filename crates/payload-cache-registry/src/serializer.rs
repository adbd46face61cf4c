//! Payload serialization.

use crate::CacheResult;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes domain objects into the bytes stored by the registry.
pub trait PayloadSerializer: Send + Sync {
    fn encode<T: Serialize>(&self, value: &T) -> CacheResult<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T>;
}

/// `serde_json` serializer. Compact output unless `pretty` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer {
    pub pretty: bool,
}

impl PayloadSerializer for JsonSerializer {
    fn encode<T: Serialize>(&self, value: &T) -> CacheResult<Vec<u8>> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(value)?
        } else {
            serde_json::to_vec(value)?
        };
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
