//! Bounded cache registry.
//!
//! The registry keeps an in-memory `key -> CachedEntry` index that mirrors
//! the files of one prefix in an [`AtomicFileStore`]. On first use the index
//! is rebuilt from file names alone, after the store has been normalized.
//! Saving beyond `max_entries` evicts the oldest entries by timestamp.
//!
//! Asynchronous writes re-check the index right before touching disk: a
//! write whose entry was deleted, evicted or superseded in the meantime is
//! skipped. The I/O worker is serial, so a delete queued after a write that
//! already passed that check still runs after it.

use crate::entry::{is_valid_segment, LEGACY_KEY};
use crate::{CacheError, CacheResult, CachedEntry, PayloadSerializer, WritePriority};
use atomic_file_store::AtomicFileStore;
use background_workers::{TaskPriority, Worker};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default capacity of a registry.
pub const DEFAULT_MAX_ENTRIES: usize = 64;

/// Naming and capacity of one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub prefix: String,
    pub extension: String,
    pub max_entries: usize,
    pub schema_version: Option<u32>,
}

impl RegistryConfig {
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into(),
            max_entries: DEFAULT_MAX_ENTRIES,
            schema_version: None,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = Some(version);
        self
    }

    /// Name used before per-key files existed: a single `<prefix>.<ext>`.
    pub fn legacy_filename(&self) -> String {
        format!("{}.{}", self.prefix, self.extension)
    }

    /// Current name for a legacy file, keyed by its modification time.
    pub fn legacy_rename(&self, filename: &str, modified_ms: i64) -> Option<String> {
        (filename == self.legacy_filename()).then(|| {
            CachedEntry::filename_for(
                &self.prefix,
                &self.extension,
                LEGACY_KEY,
                modified_ms,
                self.schema_version,
            )
        })
    }
}

#[derive(Default)]
struct Index {
    entries: HashMap<String, CachedEntry>,
    loaded: bool,
}

impl Index {
    fn is_current(&self, entry: &CachedEntry) -> bool {
        self.entries
            .get(&entry.key)
            .map(|current| current.filename == entry.filename)
            .unwrap_or(false)
    }
}

/// Bounded, timestamp-ordered cache of files sharing one prefix.
pub struct CacheRegistry {
    store: Arc<AtomicFileStore>,
    io: Arc<dyn Worker>,
    config: RegistryConfig,
    index: Arc<Mutex<Index>>,
}

impl CacheRegistry {
    pub fn new(
        store: Arc<AtomicFileStore>,
        io: Arc<dyn Worker>,
        config: RegistryConfig,
    ) -> CacheResult<Self> {
        if !is_valid_segment(&config.prefix) {
            return Err(CacheError::InvalidKey(config.prefix));
        }
        if !is_valid_segment(&config.extension) {
            return Err(CacheError::InvalidKey(config.extension));
        }

        Ok(Self {
            store,
            io,
            config,
            index: Arc::new(Mutex::new(Index::default())),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<AtomicFileStore> {
        &self.store
    }

    /// Save `key` with content produced by `writer`.
    ///
    /// Evicts the oldest entries first if the registry is full. Saving an
    /// existing key replaces its entry, and the superseded file is deleted
    /// once the new one is on disk. Only synchronous saves report write
    /// failures; asynchronous ones log them.
    pub fn save<F>(
        &self,
        key: &str,
        timestamp_ms: i64,
        priority: WritePriority,
        writer: F,
    ) -> CacheResult<()>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()> + Send + 'static,
    {
        if !is_valid_segment(key) {
            return Err(CacheError::InvalidKey(key.to_string()));
        }

        let entry = CachedEntry::new(
            &self.config.prefix,
            &self.config.extension,
            key,
            timestamp_ms,
            self.config.schema_version,
        );

        let (previous, stale) = {
            let mut index = self.index.lock();
            let mut stale = self.ensure_loaded(&mut index)?;
            let previous = index.entries.get(key).cloned();
            if previous.is_none() {
                stale.extend(self.evict_for_insert(&mut index));
            }
            index.entries.insert(key.to_string(), entry.clone());
            (previous, stale)
        };
        self.delete_files_async(stale);

        match priority.task_priority() {
            None => write_entry(&self.store, &self.index, &entry, previous, writer),
            Some(task_priority) => {
                let store = self.store.clone();
                let index = self.index.clone();
                self.io.submit(
                    task_priority,
                    Box::new(move || {
                        if let Err(e) = write_entry(&store, &index, &entry, previous, writer) {
                            warn!(file = %entry.filename, error = %e, "Cache write failed");
                        }
                    }),
                );
                Ok(())
            }
        }
    }

    /// Run `reader` over the content cached under `key`.
    pub fn load<R, F>(&self, key: &str, reader: F) -> CacheResult<Option<R>>
    where
        F: FnOnce(&mut dyn Read) -> io::Result<R>,
    {
        let filename = {
            let mut index = self.index.lock();
            let stale = self.ensure_loaded(&mut index)?;
            let filename = index.entries.get(key).map(|entry| entry.filename.clone());
            drop(index);
            self.delete_files_async(stale);
            filename
        };

        match filename {
            Some(filename) => Ok(self.store.read_stream(&filename, reader)?),
            None => Ok(None),
        }
    }

    pub fn load_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.load(key, |reader| {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            Ok(bytes)
        })
    }

    /// Forget `key` and delete its file in the background.
    ///
    /// Returns false if the key was not cached.
    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed = {
            let mut index = self.index.lock();
            let stale = self.ensure_loaded(&mut index)?;
            let removed = index.entries.remove(key);
            drop(index);
            self.delete_files_async(stale);
            removed
        };

        match removed {
            Some(entry) => {
                self.delete_files_async(vec![entry.filename]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All cached entries, oldest first.
    ///
    /// The first call normalizes the store and rebuilds the index from disk.
    pub fn list_all(&self) -> CacheResult<Vec<CachedEntry>> {
        let mut index = self.index.lock();
        let stale = self.ensure_loaded(&mut index)?;
        let mut entries: Vec<CachedEntry> = index.entries.values().cloned().collect();
        drop(index);
        self.delete_files_async(stale);

        entries.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(entries)
    }

    pub fn len(&self) -> CacheResult<usize> {
        let mut index = self.index.lock();
        let stale = self.ensure_loaded(&mut index)?;
        let len = index.entries.len();
        drop(index);
        self.delete_files_async(stale);
        Ok(len)
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Save `value` under `key` using `serializer`.
    ///
    /// Encoding happens on the caller's thread so errors surface here.
    pub fn save_value<S, T>(
        &self,
        serializer: &S,
        key: &str,
        timestamp_ms: i64,
        priority: WritePriority,
        value: &T,
    ) -> CacheResult<()>
    where
        S: PayloadSerializer,
        T: Serialize,
    {
        let bytes = serializer.encode(value)?;
        self.save(key, timestamp_ms, priority, move |w| w.write_all(&bytes))
    }

    pub fn load_value<S, T>(&self, serializer: &S, key: &str) -> CacheResult<Option<T>>
    where
        S: PayloadSerializer,
        T: DeserializeOwned,
    {
        match self.load_bytes(key)? {
            Some(bytes) => Ok(Some(serializer.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Save a file outside the bounded index, such as the pending-call record.
    pub fn save_named<F>(&self, name: &str, priority: WritePriority, writer: F) -> CacheResult<()>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()> + Send + 'static,
    {
        self.check_named(name)?;

        match priority.task_priority() {
            None => Ok(self.store.write(name, writer)?),
            Some(task_priority) => {
                let store = self.store.clone();
                let name = name.to_string();
                self.io.submit(
                    task_priority,
                    Box::new(move || {
                        if let Err(e) = store.write(&name, writer) {
                            warn!(file = %name, error = %e, "Named cache write failed");
                        }
                    }),
                );
                Ok(())
            }
        }
    }

    pub fn load_named<R, F>(&self, name: &str, reader: F) -> CacheResult<Option<R>>
    where
        F: FnOnce(&mut dyn Read) -> io::Result<R>,
    {
        self.check_named(name)?;
        Ok(self.store.read_stream(name, reader)?)
    }

    /// Delete a named file on the caller's thread.
    ///
    /// Asynchronous saves of the same name that are still queued are not cancelled.
    pub fn delete_named(&self, name: &str) -> CacheResult<bool> {
        self.check_named(name)?;
        Ok(self.store.delete(name))
    }

    fn check_named(&self, name: &str) -> CacheResult<()> {
        let collides = CachedEntry::from_filename(&self.config.prefix, &self.config.extension, name)
            .is_some()
            || name == self.config.legacy_filename();
        if collides {
            Err(CacheError::InvalidKey(name.to_string()))
        } else {
            Ok(())
        }
    }

    /// Rebuild the index from disk on first use.
    ///
    /// Returns files left behind by a save that superseded them but died
    /// before deleting them.
    fn ensure_loaded(&self, index: &mut Index) -> CacheResult<Vec<String>> {
        if index.loaded {
            return Ok(Vec::new());
        }

        let config = &self.config;
        self.store
            .normalize(|name, modified_ms| config.legacy_rename(name, modified_ms))?;

        let prefix = format!("{}.", config.prefix);
        let names = self.store.list_keys(|name| name.starts_with(&prefix))?;

        let mut stale = Vec::new();
        for name in names {
            let Some(entry) = CachedEntry::from_filename(&config.prefix, &config.extension, &name)
            else {
                continue;
            };
            let newer_exists = index
                .entries
                .get(&entry.key)
                .map(|existing| existing.timestamp_ms >= entry.timestamp_ms)
                .unwrap_or(false);
            if newer_exists {
                stale.push(entry.filename);
            } else if let Some(older) = index.entries.insert(entry.key.clone(), entry) {
                stale.push(older.filename);
            }
        }

        index.loaded = true;
        info!(
            prefix = %config.prefix,
            entries = index.entries.len(),
            stale = stale.len(),
            "Cache index rebuilt from disk"
        );
        Ok(stale)
    }

    /// Evict the oldest entries until one more fits.
    fn evict_for_insert(&self, index: &mut Index) -> Vec<String> {
        let max_entries = self.config.max_entries.max(1);
        let mut evicted = Vec::new();

        while index.entries.len() >= max_entries {
            let oldest = index
                .entries
                .values()
                .min_by(|a, b| {
                    a.timestamp_ms
                        .cmp(&b.timestamp_ms)
                        .then_with(|| a.key.cmp(&b.key))
                })
                .map(|entry| entry.key.clone());
            let Some(key) = oldest else {
                break;
            };
            if let Some(entry) = index.entries.remove(&key) {
                debug!(prefix = %self.config.prefix, key = %entry.key, "Evicting oldest cache entry");
                evicted.push(entry.filename);
            }
        }

        evicted
    }

    fn delete_files_async(&self, filenames: Vec<String>) {
        if filenames.is_empty() {
            return;
        }
        let store = self.store.clone();
        self.io.submit(
            TaskPriority::High,
            Box::new(move || {
                for filename in filenames {
                    store.delete(&filename);
                }
            }),
        );
    }
}

/// Write one entry unless the index moved on while the write was queued.
fn write_entry<F>(
    store: &AtomicFileStore,
    index: &Mutex<Index>,
    entry: &CachedEntry,
    previous: Option<CachedEntry>,
    writer: F,
) -> CacheResult<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let superseded = previous
        .as_ref()
        .filter(|prev| prev.filename != entry.filename)
        .map(|prev| prev.filename.clone());

    if !index.lock().is_current(entry) {
        debug!(file = %entry.filename, "Skipping cache write for a replaced entry");
        if let Some(old) = superseded {
            store.delete(&old);
        }
        return Ok(());
    }

    match store.write(&entry.filename, writer) {
        Ok(()) => {
            if let Some(old) = superseded {
                store.delete(&old);
            }
            Ok(())
        }
        Err(e) => {
            let mut index = index.lock();
            if index.is_current(entry) {
                match previous {
                    Some(prev) => {
                        index.entries.insert(prev.key.clone(), prev);
                    }
                    None => {
                        index.entries.remove(&entry.key);
                    }
                }
            }
            Err(e.into())
        }
    }
}

/// New random key for a payload file.
pub fn generate_payload_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
