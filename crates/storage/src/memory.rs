//! Volatile in-process store.
//!
//! Plays the role of a per-tab store: contents live as long as the value
//! does. Also the store used by tests, so it can simulate write failures.

use crate::{validate_key, BackendKind, StorageBackend, StorageError, StorageResult, StorageStats};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    quota: Option<u64>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(mut self, quota: Option<u64>) -> Self {
        self.quota = quota;
        self
    }

    /// Make every mutating call fail until switched off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every read fail until switched off again
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("simulated write failure".into()));
        }
        Ok(())
    }

    fn check_readable(&self) -> StorageResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("simulated read failure".into()));
        }
        Ok(())
    }
}

fn used_bytes(entries: &BTreeMap<String, Vec<u8>>) -> u64 {
    entries.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum()
}

impl StorageBackend for MemoryStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn save(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        self.check_writable()?;

        let mut entries = self.entries();
        if let Some(limit) = self.quota {
            let replaced = entries.get(key).map(|v| (key.len() + v.len()) as u64).unwrap_or(0);
            let needed = used_bytes(&entries) - replaced + (key.len() + data.len()) as u64;
            if needed > limit {
                return Err(StorageError::QuotaExceeded { needed, limit });
            }
        }
        entries.insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        self.check_readable()?;
        Ok(self.entries().get(key).cloned())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.check_writable()?;
        self.entries().remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        self.check_readable()?;
        Ok(self.entries().contains_key(key))
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        self.check_readable()?;
        Ok(self.entries().keys().cloned().collect())
    }

    fn clear(&self) -> StorageResult<()> {
        self.check_writable()?;
        self.entries().clear();
        Ok(())
    }

    fn stats(&self) -> StorageResult<StorageStats> {
        Ok(StorageStats { used: used_bytes(&self.entries()), limit: self.quota })
    }
}
