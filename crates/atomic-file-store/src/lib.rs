//! AtomicFileStore: crash-safe key/byte-stream storage.
//!
//! Every key maps to one file in the store directory. Writes never touch the
//! canonical file in place:
//!
//! 1. new content goes to `<key>-tmp`
//! 2. if `<key>` already exists, `<key>-tmp` is renamed to `<key>-new`
//! 3. `<key>` is renamed to `<key>-old`, the candidate is renamed to `<key>`,
//!    and `<key>-old` is deleted
//!
//! Readers therefore only ever see complete files under the canonical name.
//! [`AtomicFileStore::normalize`] cleans up whatever a killed process left
//! behind: `-tmp` and `-old` files are discarded, `-new` swaps are completed.
//!
//! Each key is guarded by its own read/write lock: readers share, writers
//! and deletes are exclusive.

mod lock_table;

use lock_table::LockTable;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

/// Suffix of the file a write streams into.
pub const TMP_SUFFIX: &str = "-tmp";
/// Suffix of a complete replacement waiting to be swapped in.
pub const NEW_SUFFIX: &str = "-new";
/// Suffix of the previous content while a swap is in progress.
pub const OLD_SUFFIX: &str = "-old";

const PROTOCOL_SUFFIXES: [&str; 3] = [TMP_SUFFIX, NEW_SUFFIX, OLD_SUFFIX];

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("invalid store key: {0:?}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What [`AtomicFileStore::normalize`] had to repair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub discarded_tmp: usize,
    pub discarded_old: usize,
    pub completed_swaps: usize,
    pub migrated_legacy: usize,
}

impl NormalizeReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

pub struct AtomicFileStore {
    dir: PathBuf,
    locks: LockTable,
    normalized: Mutex<bool>,
}

impl AtomicFileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: LockTable::default(),
            normalized: Mutex::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Replace the content stored under `key` with whatever `writer` produces.
    ///
    /// On failure the partially written temp file is removed and the
    /// previous content (if any) stays untouched.
    pub fn write<F>(&self, key: &str, writer: F) -> StoreResult<()>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        validate_key(key)?;
        let lock = self.locks.lock_for(key);
        let result = {
            let _guard = lock.write();
            self.write_locked(key, writer)
        };
        drop(lock);

        if let Err(e) = &result {
            warn!(key = %key, error = %e, "Atomic write failed");
        }
        result
    }

    fn write_locked<F>(&self, key: &str, writer: F) -> StoreResult<()>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        let canonical = self.dir.join(key);
        let tmp = self.suffixed(key, TMP_SUFFIX);

        if let Err(e) = write_temp(&tmp, writer) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        let candidate = if canonical.exists() {
            let new = self.suffixed(key, NEW_SUFFIX);
            if let Err(e) = fs::rename(&tmp, &new) {
                let _ = fs::remove_file(&tmp);
                return Err(e.into());
            }
            new
        } else {
            tmp
        };

        swap_into_place(&canonical, &candidate)?;
        sync_dir(&self.dir);
        Ok(())
    }

    /// Run `reader` over the content stored under `key`.
    ///
    /// Returns `Ok(None)` if nothing is stored under the key.
    pub fn read_stream<R, F>(&self, key: &str, reader: F) -> StoreResult<Option<R>>
    where
        F: FnOnce(&mut dyn Read) -> io::Result<R>,
    {
        validate_key(key)?;
        let lock = self.locks.lock_for(key);
        let result = {
            let _guard = lock.read();
            match fs::File::open(self.dir.join(key)) {
                Ok(file) => {
                    let mut buffered = BufReader::new(file);
                    reader(&mut buffered).map(Some).map_err(StoreError::from)
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        };
        drop(lock);
        result
    }

    /// Read the whole content stored under `key`.
    pub fn read_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.read_stream(key, |reader| {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            Ok(bytes)
        })
    }

    pub fn exists(&self, key: &str) -> bool {
        validate_key(key).is_ok() && self.dir.join(key).is_file()
    }

    /// Delete the content stored under `key`. Returns true if a file was removed.
    pub fn delete(&self, key: &str) -> bool {
        if validate_key(key).is_err() {
            return false;
        }

        let lock = self.locks.lock_for(key);
        let removed = {
            let _guard = lock.write();
            match fs::remove_file(self.dir.join(key)) {
                Ok(()) => true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to delete stored file");
                    false
                }
            }
        };
        self.locks.release(key, lock);

        if removed {
            debug!(key = %key, "Deleted stored file");
        }
        removed
    }

    /// List canonical keys accepted by `predicate`, sorted by name.
    ///
    /// Files carrying a write-protocol suffix are never listed.
    pub fn list_keys<P>(&self, predicate: P) -> StoreResult<Vec<String>>
    where
        P: Fn(&str) -> bool,
    {
        let mut keys: Vec<String> = self
            .file_names()?
            .into_iter()
            .filter(|name| !has_protocol_suffix(name))
            .filter(|name| predicate(name))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Last modification time of the file under `key`, in epoch milliseconds.
    pub fn modified_ms(&self, key: &str) -> StoreResult<Option<i64>> {
        validate_key(key)?;
        match fs::metadata(self.dir.join(key)) {
            Ok(metadata) => Ok(Some(modified_ms(&metadata))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Repair the store after an unclean shutdown.
    ///
    /// Must run once, before any reads, while no other thread uses the store.
    /// Later calls are no-ops returning an empty report. `legacy_rename` maps
    /// a legacy file name and its modification time to its current name.
    pub fn normalize<M>(&self, legacy_rename: M) -> StoreResult<NormalizeReport>
    where
        M: Fn(&str, i64) -> Option<String>,
    {
        let mut normalized = self.normalized.lock();
        if *normalized {
            return Ok(NormalizeReport::default());
        }

        let mut report = NormalizeReport::default();
        let names = self.file_names()?;

        for key in names.iter().filter_map(|n| n.strip_suffix(NEW_SUFFIX)) {
            let canonical = self.dir.join(key);
            let candidate = self.suffixed(key, NEW_SUFFIX);
            match swap_into_place(&canonical, &candidate) {
                Ok(()) => report.completed_swaps += 1,
                Err(e) => warn!(key = %key, error = %e, "Failed to complete interrupted swap"),
            }
        }

        for name in &names {
            let counter = if name.ends_with(OLD_SUFFIX) {
                &mut report.discarded_old
            } else if name.ends_with(TMP_SUFFIX) {
                &mut report.discarded_tmp
            } else {
                continue;
            };
            match fs::remove_file(self.dir.join(name)) {
                Ok(()) => *counter += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %name, error = %e, "Failed to discard leftover file"),
            }
        }

        for name in self.file_names()? {
            if has_protocol_suffix(&name) {
                continue;
            }
            let path = self.dir.join(&name);
            let modified = match fs::metadata(&path) {
                Ok(metadata) => modified_ms(&metadata),
                Err(_) => continue,
            };
            let Some(current) = legacy_rename(&name, modified) else {
                continue;
            };
            if current == name || validate_key(&current).is_err() {
                continue;
            }
            let target = self.dir.join(&current);
            if target.exists() {
                warn!(legacy = %name, current = %current, "Legacy file shadowed by current file");
                continue;
            }
            match fs::rename(&path, &target) {
                Ok(()) => report.migrated_legacy += 1,
                Err(e) => warn!(legacy = %name, error = %e, "Failed to migrate legacy file"),
            }
        }

        sync_dir(&self.dir);
        *normalized = true;

        if report.is_clean() {
            debug!(dir = %self.dir.display(), "Store normalized, nothing to repair");
        } else {
            info!(
                dir = %self.dir.display(),
                discarded_tmp = report.discarded_tmp,
                discarded_old = report.discarded_old,
                completed_swaps = report.completed_swaps,
                migrated_legacy = report.migrated_legacy,
                "Store normalized"
            );
        }
        Ok(report)
    }

    fn suffixed(&self, key: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", key, suffix))
    }

    fn file_names(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

fn write_temp<F>(path: &Path, writer: F) -> io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let mut buffered = BufWriter::new(file);
    writer(&mut buffered)?;
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// Step 3 of the write protocol: move `candidate` to `canonical`.
fn swap_into_place(canonical: &Path, candidate: &Path) -> io::Result<()> {
    if !canonical.exists() {
        return fs::rename(candidate, canonical);
    }

    let old = with_suffix(canonical, OLD_SUFFIX);
    fs::rename(canonical, &old)?;
    if let Err(e) = fs::rename(candidate, canonical) {
        // Put the previous content back so readers keep a canonical file.
        let _ = fs::rename(&old, canonical);
        let _ = fs::remove_file(candidate);
        return Err(e);
    }

    match fs::remove_file(&old) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(file = %old.display(), error = %e, "Failed to remove replaced file");
            Ok(())
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

fn modified_ms(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn has_protocol_suffix(name: &str) -> bool {
    PROTOCOL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn validate_key(key: &str) -> StoreResult<()> {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\', '\0'])
        || has_protocol_suffix(key);
    if invalid {
        Err(StoreError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn open_store() -> (tempfile::TempDir, AtomicFileStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = AtomicFileStore::open(temp.path().join("cache")).expect("open store");
        (temp, store)
    }

    fn write_bytes(store: &AtomicFileStore, key: &str, bytes: &[u8]) {
        store
            .write(key, |w| w.write_all(bytes))
            .expect("write");
    }

    fn no_legacy(_: &str, _: i64) -> Option<String> {
        None
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_temp, store) = open_store();
        write_bytes(&store, "payload.1.abc.json", b"{\"hello\":1}");

        let bytes = store.read_bytes("payload.1.abc.json").expect("read");
        assert_eq!(bytes.as_deref(), Some(&b"{\"hello\":1}"[..]));
    }

    #[test]
    fn overwrite_replaces_content_and_leaves_no_artifacts() {
        let (_temp, store) = open_store();
        write_bytes(&store, "snapshot.json", b"first");
        write_bytes(&store, "snapshot.json", b"second");

        assert_eq!(
            store.read_bytes("snapshot.json").expect("read").as_deref(),
            Some(&b"second"[..])
        );
        let all = store.file_names().expect("names");
        assert_eq!(all, vec!["snapshot.json".to_string()]);
    }

    #[test]
    fn missing_key_reads_as_none() {
        let (_temp, store) = open_store();
        assert!(store.read_bytes("absent.json").expect("read").is_none());
        assert!(store.modified_ms("absent.json").expect("mtime").is_none());
    }

    #[test]
    fn failed_writer_keeps_previous_content_and_removes_tmp() {
        let (_temp, store) = open_store();
        write_bytes(&store, "snapshot.json", b"good");

        let err = store
            .write("snapshot.json", |w| {
                w.write_all(b"partial")?;
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            })
            .expect_err("writer failure must surface");
        assert!(matches!(err, StoreError::Io(_)));

        assert_eq!(
            store.read_bytes("snapshot.json").expect("read").as_deref(),
            Some(&b"good"[..])
        );
        assert!(!store.dir().join("snapshot.json-tmp").exists());
    }

    #[test]
    fn rejects_invalid_keys() {
        let (_temp, store) = open_store();
        for key in ["", "..", "a/b", "x.json-tmp", "x.json-new", "x.json-old"] {
            let err = store
                .write(key, |w| w.write_all(b"x"))
                .expect_err("invalid key must fail");
            assert!(matches!(err, StoreError::InvalidKey(_)), "key {key:?}");
        }
        assert!(!store.delete("../outside"));
    }

    #[test]
    fn delete_removes_file_and_forgets_lock() {
        let (_temp, store) = open_store();
        write_bytes(&store, "payload.json", b"data");

        assert!(store.delete("payload.json"));
        assert!(!store.exists("payload.json"));
        assert!(!store.delete("payload.json"));
        assert_eq!(store.lock_count(), 0);
    }

    #[test]
    fn list_keys_skips_protocol_artifacts() {
        let (_temp, store) = open_store();
        write_bytes(&store, "last_session.1.a.json", b"a");
        write_bytes(&store, "last_session.2.b.json", b"b");
        write_bytes(&store, "payload.3.c.json", b"c");
        fs::write(store.dir().join("last_session.4.d.json-tmp"), b"partial").expect("tmp");

        let keys = store
            .list_keys(|name| name.starts_with("last_session."))
            .expect("list");
        assert_eq!(keys, vec!["last_session.1.a.json", "last_session.2.b.json"]);
    }

    #[test]
    fn normalize_discards_tmp_left_by_crash_before_rename() {
        let (_temp, store) = open_store();
        write_bytes(&store, "snapshot.json", b"committed");
        // Process died after streaming the temp file, before any rename.
        fs::write(store.dir().join("snapshot.json-tmp"), b"uncommitted").expect("tmp");

        assert_eq!(
            store.read_bytes("snapshot.json").expect("read").as_deref(),
            Some(&b"committed"[..])
        );

        let report = store.normalize(no_legacy).expect("normalize");
        assert_eq!(report.discarded_tmp, 1);
        assert!(!store.dir().join("snapshot.json-tmp").exists());
        assert_eq!(
            store.read_bytes("snapshot.json").expect("read").as_deref(),
            Some(&b"committed"[..])
        );
    }

    #[test]
    fn normalize_completes_swap_left_by_crash_after_new() {
        let (_temp, store) = open_store();
        write_bytes(&store, "snapshot.json", b"previous");
        // Process died after renaming -tmp to -new, before the swap.
        fs::write(store.dir().join("snapshot.json-new"), b"replacement").expect("new");

        let report = store.normalize(no_legacy).expect("normalize");
        assert_eq!(report.completed_swaps, 1);
        assert_eq!(
            store.read_bytes("snapshot.json").expect("read").as_deref(),
            Some(&b"replacement"[..])
        );
        assert_eq!(store.file_names().expect("names"), vec!["snapshot.json"]);
    }

    #[test]
    fn normalize_completes_swap_interrupted_mid_rename() {
        let (_temp, store) = open_store();
        // Canonical already moved to -old, candidate not yet moved in.
        fs::write(store.dir().join("snapshot.json-old"), b"previous").expect("old");
        fs::write(store.dir().join("snapshot.json-new"), b"replacement").expect("new");

        let report = store.normalize(no_legacy).expect("normalize");
        assert_eq!(report.completed_swaps, 1);
        assert_eq!(report.discarded_old, 1);
        assert_eq!(
            store.read_bytes("snapshot.json").expect("read").as_deref(),
            Some(&b"replacement"[..])
        );
    }

    #[test]
    fn normalize_migrates_legacy_names_once() {
        let (_temp, store) = open_store();
        fs::write(store.dir().join("last_session.json"), b"legacy").expect("legacy");

        let report = store
            .normalize(|name, mtime| {
                (name == "last_session.json").then(|| format!("last_session.{}.legacy.json", mtime))
            })
            .expect("normalize");
        assert_eq!(report.migrated_legacy, 1);

        let keys = store.list_keys(|_| true).expect("list");
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("last_session.") && keys[0].ends_with(".legacy.json"));

        fs::write(store.dir().join("x.json-tmp"), b"late").expect("tmp");
        assert!(store.normalize(no_legacy).expect("second normalize").is_clean());
        assert!(store.dir().join("x.json-tmp").exists());
    }

    #[test]
    fn concurrent_writes_to_different_keys_round_trip() {
        let (_temp, store) = open_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let key = format!("payload.{}.k{}.json", i, i);
                    let body = vec![i as u8; 4096 * (i + 1)];
                    for _ in 0..10 {
                        store.write(&key, |w| w.write_all(&body)).expect("write");
                        let read = store.read_bytes(&key).expect("read").expect("present");
                        assert_eq!(read, body);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread");
        }
    }

    #[test]
    fn readers_never_observe_partial_content() {
        let (_temp, store) = open_store();
        let store = Arc::new(store);
        write_bytes(&store, "snapshot.json", &[b'a'; 64 * 1024]);

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for round in 0..20 {
                    let fill = if round % 2 == 0 { b'b' } else { b'a' };
                    store
                        .write("snapshot.json", |w| w.write_all(&[fill; 64 * 1024]))
                        .expect("write");
                }
            })
        };

        for _ in 0..50 {
            let bytes = store
                .read_bytes("snapshot.json")
                .expect("read")
                .expect("canonical always present");
            assert_eq!(bytes.len(), 64 * 1024);
            assert!(bytes.iter().all(|b| *b == bytes[0]));
        }
        writer.join().expect("writer");
    }
}
