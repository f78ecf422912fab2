//! Point-in-time backups of every known session
//!
//! A backup id starts with the zero-padded creation time in milliseconds,
//! so lexical order is chronological order and the creation time can be
//! read back from the id alone. Retention keeps the newest `max_backups`
//! backups and drops anything older than `max_backup_age`.

use crate::codec::CodecStore;
use crate::config::BackupConfig;
use crate::session::PersistenceSession;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type BackupId = String;

const BACKUP_PREFIX: &str = "backup-";

/// Why a backup was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    Periodic,
    Manual,
    PreDelete,
    PreClear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: BackupId,
    pub created_at: DateTime<Utc>,
    pub reason: BackupReason,
    pub sessions: Vec<PersistenceSession>,
}

/// Listing entry without the session payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub id: BackupId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct BackupManager {
    store: Arc<CodecStore>,
    config: Mutex<BackupConfig>,
    sequence: AtomicU64,
}

fn backup_key(id: &str) -> String {
    format!("{BACKUP_PREFIX}{id}")
}

/// Creation time encoded in a backup id
pub fn backup_time(id: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = id.split('-').next()?.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

impl BackupManager {
    pub fn new(store: Arc<CodecStore>, config: BackupConfig) -> Self {
        Self { store, config: Mutex::new(config), sequence: AtomicU64::new(0) }
    }

    fn config(&self) -> MutexGuard<'_, BackupConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> BackupConfig {
        self.config().clone()
    }

    pub fn set_config(&self, config: BackupConfig) {
        *self.config() = config;
    }

    fn next_id(&self, now: DateTime<Utc>) -> BackupId {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        format!("{:013}-{:06}-{}", now.timestamp_millis().max(0), sequence % 1_000_000, &nonce[..8])
    }

    /// Snapshot `sessions`; returns the new id, or `None` if the write failed
    pub fn create(&self, reason: BackupReason, sessions: Vec<PersistenceSession>) -> Option<BackupId> {
        self.create_at(reason, sessions, Utc::now())
    }

    pub fn create_at(
        &self,
        reason: BackupReason,
        sessions: Vec<PersistenceSession>,
        now: DateTime<Utc>,
    ) -> Option<BackupId> {
        let id = self.next_id(now);
        let backup = Backup { id: id.clone(), created_at: now, reason, sessions };
        if let Err(err) = self.store.put(&backup_key(&id), &backup) {
            log::warn!("failed to write {reason:?} backup: {err}");
            return None;
        }
        log::debug!("created {reason:?} backup {id} with {} sessions", backup.sessions.len());

        let pruned = self.enforce_retention(now);
        if pruned > 0 {
            log::debug!("pruned {pruned} old backups");
        }
        Some(id)
    }

    /// Backup ids, newest first
    pub fn list(&self) -> Vec<BackupId> {
        let keys = match self.store.keys_with_prefix(BACKUP_PREFIX) {
            Ok(keys) => keys,
            Err(err) => {
                log::warn!("failed to list backups: {err}");
                return Vec::new();
            }
        };
        let mut ids: Vec<BackupId> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(BACKUP_PREFIX))
            .map(str::to_owned)
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids
    }

    pub fn list_info(&self) -> Vec<BackupInfo> {
        self.list()
            .into_iter()
            .filter_map(|id| backup_time(&id).map(|created_at| BackupInfo { id, created_at }))
            .collect()
    }

    pub fn load(&self, id: &str) -> Option<Backup> {
        match self.store.get::<Backup>(&backup_key(id)) {
            Ok(backup) => backup,
            Err(err) => {
                log::warn!("failed to load backup {id}: {err}");
                None
            }
        }
    }

    pub fn delete(&self, id: &str) -> bool {
        match self.store.remove(&backup_key(id)) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("failed to delete backup {id}: {err}");
                false
            }
        }
    }

    /// Prune past the count cap and the age limit; returns how many were removed
    pub fn enforce_retention(&self, now: DateTime<Utc>) -> usize {
        let config = self.settings();
        let cutoff = chrono::Duration::from_std(config.max_backup_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age));

        self.list()
            .into_iter()
            .enumerate()
            .filter(|(rank, id)| {
                let too_many = *rank >= config.max_backups;
                let too_old = match (backup_time(id), cutoff) {
                    (Some(created), Some(cutoff)) => created < cutoff,
                    _ => false,
                };
                too_many || too_old
            })
            .filter(|(_, id)| self.delete(id))
            .count()
    }
}
