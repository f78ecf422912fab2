//! Single-file transactional store with a write-ahead journal.
//!
//! The whole table lives in one database file. Every mutation is a commit:
//! 1. The new table is written to the journal and synced
//! 2. The database file is replaced atomically (temp file + rename)
//! 3. The journal is removed
//!
//! Opening a store with a leftover journal completes the interrupted commit,
//! so a crash at any step leaves either the old or the new table, never a mix.

use crate::{validate_key, BackendKind, StorageBackend, StorageError, StorageResult, StorageStats};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

const TABLE_FORMAT_VERSION: u32 = 1;

/// On-disk table. Values are base64 so binary payloads survive JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Table {
    format: u32,
    /// Number of commits applied to this table
    commit: u64,
    entries: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct JournalStore {
    path: PathBuf,
    table: Mutex<Table>,
}

impl JournalStore {
    /// Open (or create) the database at `path`, replaying any pending journal
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let store = Self { path, table: Mutex::new(Table::default()) };
        let table = store.recover()?;
        *store.table() = table;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal_path(&self) -> PathBuf {
        sibling(&self.path, "journal")
    }

    /// Check if a commit was interrupted and not yet replayed
    pub fn has_pending_journal(&self) -> bool {
        self.journal_path().exists()
    }

    /// Number of commits applied since the database was created
    pub fn commit_count(&self) -> u64 {
        self.table().commit
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recover(&self) -> StorageResult<Table> {
        let journal = self.journal_path();
        if journal.exists() {
            let json = fs::read_to_string(&journal)?;
            match serde_json::from_str::<Table>(&json) {
                Ok(table) => {
                    log::info!("replaying journal for {}", self.path.display());
                    self.replace_database(&json)?;
                    fs::remove_file(&journal)?;
                    return Ok(table);
                }
                Err(err) => {
                    // A torn journal means the commit never reached step 2
                    log::warn!("discarding unreadable journal {}: {err}", journal.display());
                    fs::remove_file(&journal)?;
                }
            }
        }

        if !self.path.exists() {
            return Ok(Table { format: TABLE_FORMAT_VERSION, ..Table::default() });
        }
        let json = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Apply `mutate` to a copy of the table and commit it. The in-memory
    /// table is only replaced once the commit is durable.
    fn commit<F>(&self, mutate: F) -> StorageResult<()>
    where
        F: FnOnce(&mut Table) -> StorageResult<()>,
    {
        let mut table = self.table();
        let mut next = table.clone();
        mutate(&mut next)?;
        next.format = TABLE_FORMAT_VERSION;
        next.commit += 1;

        let json = serde_json::to_string(&next)?;
        self.write_journal(&json)?;
        self.replace_database(&json)?;
        fs::remove_file(self.journal_path())?;

        *table = next;
        Ok(())
    }

    fn write_journal(&self, json: &str) -> StorageResult<()> {
        let mut file = fs::File::create(self.journal_path())?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn replace_database(&self, json: &str) -> StorageResult<()> {
        let temp_path = sibling(&self.path, "tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

impl StorageBackend for JournalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Journal
    }

    fn save(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        let encoded = STANDARD.encode(data);
        self.commit(|table| {
            table.entries.insert(key.to_owned(), encoded);
            Ok(())
        })
    }

    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let table = self.table();
        match table.entries.get(key) {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|e| StorageError::InvalidResponse(format!("corrupt value for {key}: {e}"))),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        if !self.table().entries.contains_key(key) {
            return Ok(());
        }
        self.commit(|table| {
            table.entries.remove(key);
            Ok(())
        })
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.table().entries.contains_key(key))
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        Ok(self.table().entries.keys().cloned().collect())
    }

    fn clear(&self) -> StorageResult<()> {
        self.commit(|table| {
            table.entries.clear();
            Ok(())
        })
    }

    fn stats(&self) -> StorageResult<StorageStats> {
        let used = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(StorageStats { used, limit: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commits_are_durable_across_reopen() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let db = temp.path().join("annotations.db");

        let store = JournalStore::open(&db).unwrap();
        store.save("session-1", &[0, 159, 146, 150]).unwrap();
        store.save("session-2", b"two").unwrap();
        store.delete("session-2").unwrap();
        assert_eq!(store.commit_count(), 3);
        assert!(!store.has_pending_journal());
        drop(store);

        let reopened = JournalStore::open(&db).unwrap();
        assert_eq!(reopened.load("session-1").unwrap(), Some(vec![0, 159, 146, 150]));
        assert_eq!(reopened.list().unwrap(), vec!["session-1"]);
        assert_eq!(reopened.commit_count(), 3);
    }

    #[test]
    fn interrupted_commit_is_replayed_on_open() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let db = temp.path().join("annotations.db");

        let store = JournalStore::open(&db).unwrap();
        store.save("session-1", b"old").unwrap();

        // Simulate a crash after the journal was synced but before the
        // database file was replaced
        let mut pending = store.table().clone();
        pending.commit += 1;
        pending.entries.insert("session-1".into(), STANDARD.encode(b"new"));
        fs::write(store.journal_path(), serde_json::to_string(&pending).unwrap()).unwrap();
        drop(store);

        let recovered = JournalStore::open(&db).unwrap();
        assert!(!recovered.has_pending_journal());
        assert_eq!(recovered.load("session-1").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn torn_journal_is_discarded() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let db = temp.path().join("annotations.db");

        let store = JournalStore::open(&db).unwrap();
        store.save("session-1", b"kept").unwrap();
        fs::write(store.journal_path(), "{\"format\":1,\"comm").unwrap();
        drop(store);

        let recovered = JournalStore::open(&db).unwrap();
        assert!(!recovered.has_pending_journal());
        assert_eq!(recovered.load("session-1").unwrap(), Some(b"kept".to_vec()));
    }

    #[test]
    fn clear_removes_everything() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let store = JournalStore::open(temp.path().join("db.json")).unwrap();
        store.save("a", b"1").unwrap();
        store.save("b", b"2").unwrap();
        store.clear().unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(store.stats().unwrap().used > 0);
    }

    #[test]
    fn deleting_missing_key_does_not_commit() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let store = JournalStore::open(temp.path().join("db.json")).unwrap();
        store.delete("session-none").unwrap();
        assert_eq!(store.commit_count(), 0);
    }
}
