//! In-memory `LocalStorage` with quota enforcement and failure injection.

use super::{check_quota, LocalStorage, StorageError, StorageResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
pub struct MemoryLocalStorage {
    entries: Mutex<BTreeMap<String, String>>,
    quota_bytes: usize,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl Default for MemoryLocalStorage {
    fn default() -> Self {
        Self::with_quota(usize::MAX)
    }
}

impl MemoryLocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota_bytes,
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Makes every following `set` fail as if the quota were exhausted.
    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    /// Number of successful `set` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl LocalStorage for MemoryLocalStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Quota {
                key: key.to_string(),
                bytes: value.len(),
                limit: 0,
            });
        }
        check_quota(key, value, self.quota_bytes)?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned"))?;
        Ok(entries.keys().cloned().collect())
    }
}
