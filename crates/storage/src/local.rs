//! Durable per-user store: one file per key inside a data directory.
//!
//! Writes are atomic (temporary file + rename) so a crash never leaves a
//! half-written value behind.

use crate::{validate_key, BackendKind, StorageBackend, StorageError, StorageResult, StorageStats};
use directories::ProjectDirs;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const ENTRY_EXTENSION: &str = "entry";

#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
    quota: Option<u64>,
    /// Serializes writers so quota accounting and temp files never race
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub fn from_default_project() -> StorageResult<Self> {
        let dirs = ProjectDirs::from("dev", "Markup", "MarkupEngine")
            .ok_or(StorageError::NoDataDirectory)?;

        Ok(Self::with_root(dirs.data_local_dir().join("store")))
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), quota: None, write_lock: Mutex::new(()) }
    }

    pub fn with_quota(mut self, quota: Option<u64>) -> Self {
        self.quota = quota;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{ENTRY_EXTENSION}"))
    }

    fn entry_paths(&self) -> StorageResult<Vec<(String, PathBuf)>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Some(key) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_key(key).is_ok() {
                    entries.push((key.to_owned(), path.clone()));
                }
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn used_bytes(&self) -> StorageResult<u64> {
        let mut total = 0;
        for (_, path) in self.entry_paths()? {
            total += fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        }
        Ok(total)
    }
}

impl StorageBackend for LocalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn save(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let path = self.entry_path(key);
        if let Some(limit) = self.quota {
            let replaced = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let needed = self.used_bytes()? - replaced + data.len() as u64;
            if needed > limit {
                return Err(StorageError::QuotaExceeded { needed, limit });
            }
        }

        fs::create_dir_all(&self.root)?;
        let temp_path = self.root.join(format!(".{key}.tmp"));
        fs::write(&temp_path, data)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        match fs::read(self.entry_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.entry_path(key).is_file())
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        Ok(self.entry_paths()?.into_iter().map(|(key, _)| key).collect())
    }

    fn clear(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, path) in self.entry_paths()? {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn stats(&self) -> StorageResult<StorageStats> {
        Ok(StorageStats { used: self.used_bytes()?, limit: self.quota })
    }
}
