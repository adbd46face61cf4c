//! Cache registry for sessions, payloads and other delivery state.
//!
//! This crate provides:
//! - CacheRegistry: bounded, timestamp-ordered index of cached files with
//!   oldest-first eviction
//! - CachedEntry: the `<prefix>.<timestamp>.<key>[.<version>].<ext>` file name codec
//! - WritePriority / SnapshotType: how urgently a save must reach disk
//! - PayloadSerializer / JsonSerializer: typed save/load helpers

mod entry;
mod error;
mod priority;
mod registry;
mod serializer;

pub use entry::CachedEntry;
pub use error::{CacheError, CacheResult};
pub use priority::{SnapshotType, WritePriority};
pub use registry::{generate_payload_key, CacheRegistry, RegistryConfig, DEFAULT_MAX_ENTRIES};
pub use serializer::{JsonSerializer, PayloadSerializer};
