//! Annotation persistence facade
//!
//! Single entry point for session lifecycle, batched annotation saves,
//! backups, retention and import/export. Annotation saves go through the
//! change queue and are applied to the *current* session by a flush, either
//! on the auto-save timer or synchronously when auto-save is off.
//!
//! Backend failures never panic or propagate: they are logged, and the
//! affected data stays dirty or queued until a later flush succeeds.

use crate::annotation::{AnnotationId, AnnotationRecord, RecordError};
use crate::backup::{Backup, BackupId, BackupInfo, BackupManager, BackupReason};
use crate::change_queue::{Change, ChangeQueue};
use crate::codec::CodecStore;
use crate::config::PersistenceConfig;
use crate::events::MeasurementEvent;
use crate::export::{self, ExportError, ExportFormat, ExportResult};
use crate::session::{PersistenceSession, SessionId, SessionMetadata, SessionSummary};
use crate::session_store::SessionStore;
use crate::write_coordinator::{PeriodicTask, TaskControl, WriteCoordinator};
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use markup_storage::{open_backend, BackendKind, StorageBackend, StorageStats};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

/// Poll interval while waiting out an in-flight flush
const BUSY_WAIT: Duration = Duration::from_millis(5);

/// A newly created session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: SessionId,
    /// False when the first write failed; the session is retried on the next flush
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub session_id: SessionId,
    /// Session version after the flush
    pub version: u64,
    pub appended: usize,
    pub replaced: usize,
    pub removed: usize,
    /// Upserts refused because the session was full
    pub rejected: Vec<AnnotationId>,
    /// Whether the updated session reached the backend
    pub saved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued
    Idle,
    /// Another flush is in flight; queued changes wait for the next one
    Busy,
    /// Changes are queued but there is no current session to apply them to
    NoSession { pending: usize },
    Flushed(FlushReport),
}

impl FlushOutcome {
    /// True when the flush wrote the session
    pub fn is_saved(&self) -> bool {
        matches!(self, FlushOutcome::Flushed(report) if report.saved)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// Accepted; the auto-save timer will flush it
    Queued { pending: usize },
    /// Auto-save is off, so the queue was flushed before returning
    Flushed(FlushOutcome),
    /// The record failed validation and was not queued
    Rejected(RecordError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub session_id: SessionId,
    pub imported: usize,
    pub skipped: usize,
    pub durable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<SessionId>,
    /// Expired sessions that could not be deleted
    pub failed: Vec<SessionId>,
}

/// State shared with the timer thread
struct Shared {
    config: RwLock<PersistenceConfig>,
    store: Arc<CodecStore>,
    sessions: SessionStore,
    queue: ChangeQueue,
    backups: BackupManager,
    current: Mutex<Option<SessionId>>,
}

impl Shared {
    fn config(&self) -> PersistenceConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn current(&self) -> MutexGuard<'_, Option<SessionId>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process_change_queue(&self) -> FlushOutcome {
        let Some(flush) = self.queue.begin_flush() else {
            log::debug!("flush already in flight; skipping");
            return FlushOutcome::Busy;
        };

        let retried = self.sessions.retry_dirty();
        if retried > 0 {
            log::debug!("persisted {retried} previously unsaved sessions");
        }

        let changes = flush.take_all();
        if changes.is_empty() {
            return FlushOutcome::Idle;
        }

        let current = *self.current();
        let Some(session) = current.and_then(|id| self.sessions.get(id)) else {
            let pending = changes.len();
            log::debug!("{pending} changes queued without a current session");
            flush.requeue_front(changes);
            return FlushOutcome::NoSession { pending };
        };

        let config = self.config();
        let mut next = session.clone();
        let applied = next.apply(&changes, config.max_annotations_per_session);
        for id in &applied.rejected {
            log::warn!("session {} is full; rejected annotation {id}", session.id);
        }

        let saved = if applied.changed() {
            if config.versioning {
                next.version += 1;
            }
            next.updated_at = Utc::now();
            self.sessions.persist(&next)
        } else {
            true
        };

        if !saved {
            let retry: Vec<Change> = changes
                .into_iter()
                .filter(|c| !matches!(c, Change::Upsert(r) if applied.rejected.contains(&r.id())))
                .collect();
            log::warn!("flush of session {} failed; {} changes requeued", session.id, retry.len());
            flush.requeue_front(retry);
        }

        let report = FlushReport {
            session_id: session.id,
            version: if saved { next.version } else { session.version },
            appended: applied.appended,
            replaced: applied.replaced,
            removed: applied.removed,
            rejected: applied.rejected,
            saved,
        };
        log::debug!(
            "flushed session {} v{}: +{} ~{} -{} rejected {}",
            report.session_id,
            report.version,
            report.appended,
            report.replaced,
            report.removed,
            report.rejected.len()
        );
        FlushOutcome::Flushed(report)
    }

    fn create_backup(&self, reason: BackupReason) -> Option<BackupId> {
        self.backups.create(reason, self.sessions.all())
    }

    /// Delete a session already covered by a backup. Callers hold the flush guard.
    fn remove_session(&self, id: SessionId) -> bool {
        if !self.sessions.delete(id) {
            return false;
        }
        let mut current = self.current();
        if *current == Some(id) {
            *current = None;
            let dropped = self.queue.clear();
            if dropped > 0 {
                log::info!("dropped {dropped} queued changes for deleted session {id}");
            }
        }
        true
    }

    fn periodic_backup(&self) {
        let sessions = self.sessions.all();
        if sessions.is_empty() {
            return;
        }
        self.backups.create(BackupReason::Periodic, sessions);
    }
}

/// Persistence engine for annotation sessions
pub struct AnnotationPersistence {
    shared: Arc<Shared>,
    timers: Mutex<WriteCoordinator>,
    backend_kind: BackendKind,
    fallback_reason: Option<String>,
}

impl std::fmt::Debug for AnnotationPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnotationPersistence")
            .field("backend", &self.backend_kind)
            .field("fallback_reason", &self.fallback_reason)
            .field("pending_changes", &self.pending_changes())
            .finish()
    }
}

impl AnnotationPersistence {
    /// Build the engine on the configured backend and arm its timers.
    ///
    /// A backend that cannot be built is replaced by the local store; see
    /// [`fallback_reason`](Self::fallback_reason).
    pub fn new(config: PersistenceConfig) -> Self {
        let opened = open_backend(&config.backend);
        let mut engine = Self::build(config, opened.backend);
        engine.fallback_reason = opened.fallback_reason;
        engine.start();
        engine
    }

    /// Build the engine on an explicit backend and arm its timers
    pub fn with_backend(config: PersistenceConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let engine = Self::build(config, backend);
        engine.start();
        engine
    }

    fn build(config: PersistenceConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let backend_kind = backend.kind();
        let store = Arc::new(CodecStore::new(backend, config.compression));
        let shared = Arc::new(Shared {
            sessions: SessionStore::new(store.clone()),
            backups: BackupManager::new(store.clone(), config.backup.clone()),
            queue: ChangeQueue::new(),
            current: Mutex::new(None),
            config: RwLock::new(config),
            store,
        });
        Self {
            shared,
            timers: Mutex::new(WriteCoordinator::new()),
            backend_kind,
            fallback_reason: None,
        }
    }

    pub fn config(&self) -> PersistenceConfig {
        self.shared.config()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    /// Why the configured backend was replaced, if it was
    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }

    fn timers(&self) -> MutexGuard<'_, WriteCoordinator> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- lifecycle ----

    fn timer_tasks(&self) -> Vec<PeriodicTask> {
        let config = self.shared.config();
        let mut tasks = Vec::new();

        if config.auto_save {
            let shared = Arc::downgrade(&self.shared);
            tasks.push(PeriodicTask::new("auto-save", config.auto_save_interval, move || {
                match shared.upgrade() {
                    Some(shared) => {
                        shared.process_change_queue();
                        TaskControl::Continue
                    }
                    None => TaskControl::Shutdown,
                }
            }));
        }

        if config.backup.enabled {
            let shared = Arc::downgrade(&self.shared);
            tasks.push(PeriodicTask::new("periodic-backup", config.backup.interval, move || {
                match shared.upgrade() {
                    Some(shared) => {
                        shared.periodic_backup();
                        TaskControl::Continue
                    }
                    None => TaskControl::Shutdown,
                }
            }));
        }

        tasks
    }

    /// Arm the auto-save and periodic-backup timers (re-arming if running)
    pub fn start(&self) -> bool {
        let tasks = self.timer_tasks();
        self.timers().start(tasks)
    }

    /// Cancel the timers and flush whatever is still queued
    pub fn stop(&self) -> FlushOutcome {
        self.timers().stop();
        self.force_save()
    }

    pub fn timers_running(&self) -> bool {
        self.timers().is_running()
    }

    /// Apply a new configuration: timers are cleared, then re-armed.
    ///
    /// The backend is fixed for the life of the engine; a changed
    /// `backend` section is ignored.
    pub fn reconfigure(&self, config: PersistenceConfig) {
        self.timers().stop();

        let previous = self.shared.config();
        if previous.backend != config.backend {
            log::warn!("backend changes take effect only when the engine is rebuilt");
        }
        self.shared.store.set_codec(config.compression);
        self.shared.backups.set_config(config.backup.clone());
        *self.shared.config.write().unwrap_or_else(PoisonError::into_inner) =
            PersistenceConfig { backend: previous.backend, ..config };

        self.start();
    }

    // ---- sessions ----

    /// Create a session and make it current
    pub fn create_session(&self, metadata: SessionMetadata, user_id: Option<String>) -> SessionHandle {
        let session = PersistenceSession::new(metadata, user_id);
        let id = session.id;
        let durable = self.shared.sessions.insert_new(session);
        if !durable {
            log::warn!("session {id} created in memory only; will retry on next flush");
        }
        *self.shared.current() = Some(id);
        SessionHandle { id, durable }
    }

    /// Load a session and make it current
    pub fn load_session(&self, id: SessionId) -> Option<PersistenceSession> {
        let session = self.shared.sessions.get(id)?;
        *self.shared.current() = Some(id);
        Some(session)
    }

    /// Look a session up without changing the current session
    pub fn get_session(&self, id: SessionId) -> Option<PersistenceSession> {
        self.shared.sessions.get(id)
    }

    /// Point the flush path at another session; false if it does not exist
    pub fn set_current_session(&self, id: SessionId) -> bool {
        if self.shared.sessions.get(id).is_none() {
            return false;
        }
        *self.shared.current() = Some(id);
        true
    }

    pub fn current_session(&self) -> Option<SessionId> {
        *self.shared.current()
    }

    /// Write a whole session directly; the cache is only updated on success.
    ///
    /// The stored version never goes backwards: a stale copy is written one
    /// past the newest version known for its id (or at that version when
    /// versioning is off). `updated_at` is kept as given.
    pub fn save_session(&self, session: &PersistenceSession) -> bool {
        if let Err(err) = session.validate() {
            log::warn!("refusing to save invalid session {}: {err}", session.id);
            return false;
        }
        let _flush = self.shared.queue.wait_for_flush(BUSY_WAIT);

        let known = self.shared.sessions.high_water(session.id);
        let mut session = session.clone();
        session.version = if self.shared.config().versioning {
            session.version.max(known) + 1
        } else {
            session.version.max(known)
        };
        session.refresh_summary();
        self.shared.sessions.persist(&session)
    }

    /// Delete a session after writing a pre-delete backup of every session.
    ///
    /// If the backup cannot be written the session is kept. An in-flight
    /// flush finishes first, so it cannot write the session back.
    pub fn delete_session(&self, id: SessionId) -> bool {
        let _flush = self.shared.queue.wait_for_flush(BUSY_WAIT);
        if self.shared.sessions.get(id).is_none() {
            return false;
        }
        if self.shared.create_backup(BackupReason::PreDelete).is_none() {
            log::warn!("pre-delete backup failed; keeping session {id}");
            return false;
        }
        self.shared.remove_session(id)
    }

    /// Summaries of every known session, most recently updated first
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> =
            self.shared.sessions.all().iter().map(PersistenceSession::summary).collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Remove every session after writing a pre-clear backup. Backups are kept.
    pub fn clear_all_sessions(&self) -> bool {
        let _flush = self.shared.queue.wait_for_flush(BUSY_WAIT);
        if self.shared.create_backup(BackupReason::PreClear).is_none() {
            log::warn!("pre-clear backup failed; keeping all sessions");
            return false;
        }

        let mut all_deleted = true;
        for id in self.shared.sessions.ids() {
            all_deleted &= self.shared.sessions.delete(id);
        }
        *self.shared.current() = None;
        self.shared.queue.clear();
        all_deleted
    }

    // ---- annotations ----

    pub fn save_annotation(&self, record: AnnotationRecord) -> SaveOutcome {
        self.save_annotations(vec![record])
    }

    /// Queue records for the current session. The batch is refused as a
    /// whole if any record is invalid.
    pub fn save_annotations(&self, records: Vec<AnnotationRecord>) -> SaveOutcome {
        if let Some(err) = records.iter().find_map(|r| r.validate().err()) {
            log::warn!("rejected annotation batch: {err}");
            return SaveOutcome::Rejected(err);
        }
        self.enqueue(records.into_iter().map(Change::Upsert).collect())
    }

    pub fn remove_annotation(&self, id: AnnotationId) -> SaveOutcome {
        self.enqueue(vec![Change::Remove(id)])
    }

    /// Queue the change a coordinator event describes
    pub fn apply_event(&self, event: &MeasurementEvent) -> SaveOutcome {
        match event {
            MeasurementEvent::Added(record) | MeasurementEvent::Modified(record) => {
                self.save_annotation(record.clone())
            }
            MeasurementEvent::Removed { id, .. } => self.remove_annotation(*id),
        }
    }

    /// Queue every event waiting on `events`; returns how many were taken
    pub fn drain_events(&self, events: &Receiver<MeasurementEvent>) -> usize {
        let changes: Vec<Change> = events
            .try_iter()
            .filter_map(|event| match event {
                MeasurementEvent::Added(record) | MeasurementEvent::Modified(record) => {
                    record.validate().ok().map(|_| Change::Upsert(record))
                }
                MeasurementEvent::Removed { id, .. } => Some(Change::Remove(id)),
            })
            .collect();
        let taken = changes.len();
        if taken > 0 {
            self.enqueue(changes);
        }
        taken
    }

    fn enqueue(&self, changes: Vec<Change>) -> SaveOutcome {
        let pending = self.shared.queue.extend(changes);
        if self.shared.config().auto_save {
            SaveOutcome::Queued { pending }
        } else {
            SaveOutcome::Flushed(self.force_save())
        }
    }

    /// Flush once; a concurrent flush makes this a no-op returning `Busy`
    pub fn process_change_queue(&self) -> FlushOutcome {
        self.shared.process_change_queue()
    }

    /// Flush now, waiting out any flush already in flight
    pub fn force_save(&self) -> FlushOutcome {
        loop {
            match self.shared.process_change_queue() {
                FlushOutcome::Busy => thread::sleep(BUSY_WAIT),
                outcome => return outcome,
            }
        }
    }

    pub fn pending_changes(&self) -> usize {
        self.shared.queue.len()
    }

    /// Sessions that exist in memory but have not reached the backend
    pub fn dirty_sessions(&self) -> Vec<SessionId> {
        self.shared.sessions.dirty_ids()
    }

    // ---- backups ----

    pub fn create_backup(&self) -> Option<BackupId> {
        self.shared.create_backup(BackupReason::Manual)
    }

    /// Backup ids, newest first
    pub fn list_backups(&self) -> Vec<BackupId> {
        self.shared.backups.list()
    }

    /// Backup ids with their creation times, newest first
    pub fn list_backup_info(&self) -> Vec<BackupInfo> {
        self.shared.backups.list_info()
    }

    pub fn load_backup(&self, id: &str) -> Option<Backup> {
        self.shared.backups.load(id)
    }

    /// Replace the in-memory session set with a backup and persist it.
    ///
    /// Restored versions never go backwards: each becomes one past the
    /// larger of its backed-up version and the highest version its id has
    /// reached, even if it was deleted since. Sessions in
    /// the backend that the backup does not contain are left alone.
    pub fn restore_backup(&self, id: &str) -> bool {
        let Some(backup) = self.shared.backups.load(id) else {
            log::warn!("backup {id} not found");
            return false;
        };

        let _flush = self.shared.queue.wait_for_flush(BUSY_WAIT);
        let restored: Vec<PersistenceSession> = backup
            .sessions
            .into_iter()
            .map(|mut session| {
                let known = self.shared.sessions.high_water(session.id);
                session.version = session.version.max(known) + 1;
                session.refresh_summary();
                session
            })
            .collect();

        let mut current = self.shared.current();
        if current.is_some_and(|id| !restored.iter().any(|s| s.id == id)) {
            *current = None;
        }
        drop(current);

        let count = restored.len();
        let all_durable = self.shared.sessions.replace_cache(restored);
        log::info!("restored {count} sessions from backup {id}");
        all_durable
    }

    // ---- retention ----

    pub fn sweep_expired_sessions(&self) -> SweepReport {
        self.sweep_expired_sessions_at(Utc::now())
    }

    /// Delete every session last updated before `now - retention_period`.
    ///
    /// One pre-delete backup covers the whole sweep, so backup retention
    /// cannot prune a swept session's only copy partway through.
    pub fn sweep_expired_sessions_at(&self, now: DateTime<Utc>) -> SweepReport {
        let retention = self.shared.config().retention_period;
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|period| now.checked_sub_signed(period))
        else {
            return SweepReport::default();
        };

        let _flush = self.shared.queue.wait_for_flush(BUSY_WAIT);
        let expired: Vec<SessionId> = self
            .shared
            .sessions
            .all()
            .into_iter()
            .filter(|session| session.updated_at < cutoff)
            .map(|session| session.id)
            .collect();
        if expired.is_empty() {
            return SweepReport::default();
        }

        let mut report = SweepReport::default();
        if self.shared.create_backup(BackupReason::PreDelete).is_none() {
            log::warn!("pre-delete backup failed; keeping {} expired sessions", expired.len());
            report.failed = expired;
            return report;
        }
        for id in expired {
            if self.shared.remove_session(id) {
                report.deleted.push(id);
            } else {
                report.failed.push(id);
            }
        }
        if !report.deleted.is_empty() {
            log::info!("swept {} expired sessions", report.deleted.len());
        }
        report
    }

    // ---- import / export ----

    pub fn export_session(&self, id: SessionId, format: ExportFormat) -> ExportResult<String> {
        let session = self.shared.sessions.get(id).ok_or(ExportError::SessionNotFound(id))?;
        export::export_session(&session, format)
    }

    /// Import into a brand-new session; the document's own id is ignored
    pub fn import_session(&self, data: &str, format: ExportFormat) -> ExportResult<ImportReport> {
        let imported = export::parse_import(data, format)?;
        let capacity = self.shared.config().max_annotations_per_session;

        let mut skipped = imported.skipped;
        let mut records = imported.records;
        if records.len() > capacity {
            skipped += records.len() - capacity;
            records.truncate(capacity);
        }

        let mut session = PersistenceSession::new(imported.metadata, imported.user_id);
        session.records = records;
        session.refresh_summary();

        let session_id = session.id;
        let imported_count = session.records.len();
        let durable = self.shared.sessions.insert_new(session);
        Ok(ImportReport { session_id, imported: imported_count, skipped, durable })
    }

    pub fn storage_stats(&self) -> Option<StorageStats> {
        match self.shared.store.backend().stats() {
            Ok(stats) => Some(stats),
            Err(err) => {
                log::warn!("failed to read storage stats: {err}");
                None
            }
        }
    }
}

impl Drop for AnnotationPersistence {
    fn drop(&mut self) {
        self.timers().stop();
        if !self.shared.queue.is_empty() {
            self.force_save();
        }
    }
}
