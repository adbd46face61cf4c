//! Per-key read/write locks, created on demand.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Map of key -> lock. Entries are created on first access and dropped
/// again once a delete finishes and nobody else holds the lock.
#[derive(Default)]
pub(crate) struct LockTable {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockTable {
    pub(crate) fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(key) {
            return existing.clone();
        }
        let lock = Arc::new(RwLock::new(()));
        locks.insert(key.to_string(), lock.clone());
        lock
    }

    /// Drop the caller's handle and forget the entry if the table holds the last reference.
    ///
    /// Clones are only handed out under the table mutex, so a strong count of
    /// one observed under that mutex means no thread can be waiting on it.
    pub(crate) fn release(&self, key: &str, lock: Arc<RwLock<()>>) {
        drop(lock);
        let mut locks = self.locks.lock();
        let unused = locks
            .get(key)
            .map(|existing| Arc::strong_count(existing) == 1)
            .unwrap_or(false);
        if unused {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }
}
