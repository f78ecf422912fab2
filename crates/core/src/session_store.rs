//! Session cache backed by a storage backend
//!
//! The cache only ever holds the last durable version of a session, except
//! for freshly created sessions whose first write failed: those stay cached
//! and are flagged dirty until a later write succeeds. Backend I/O happens
//! without holding the cache lock; the cache is updated afterwards in one
//! step so readers never see a half-applied session.

use crate::codec::CodecStore;
use crate::session::{PersistenceSession, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) const SESSION_PREFIX: &str = "session-";
const RETIRED_PREFIX: &str = "retired-";

pub fn session_key(id: SessionId) -> String {
    format!("{SESSION_PREFIX}{id}")
}

fn retired_key(id: SessionId) -> String {
    format!("{RETIRED_PREFIX}{id}")
}

/// Last version a deleted session reached; outlives the session itself
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RetiredSession {
    version: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    sessions: HashMap<SessionId, PersistenceSession>,
    dirty: HashSet<SessionId>,
}

#[derive(Debug)]
pub struct SessionStore {
    store: Arc<CodecStore>,
    state: Mutex<CacheState>,
}

impl SessionStore {
    pub fn new(store: Arc<CodecStore>) -> Self {
        Self { store, state: Mutex::new(CacheState::default()) }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cache a new session and try to make it durable.
    ///
    /// The session stays cached either way; on failure it is marked dirty.
    pub fn insert_new(&self, session: PersistenceSession) -> bool {
        let id = session.id;
        let durable = self.write(&session);
        let mut state = self.state();
        state.sessions.insert(id, session);
        if durable {
            state.dirty.remove(&id);
        } else {
            state.dirty.insert(id);
        }
        durable
    }

    /// Write a session; the cache is only updated when the write succeeds
    pub fn persist(&self, session: &PersistenceSession) -> bool {
        if !self.write(session) {
            return false;
        }
        let mut state = self.state();
        state.sessions.insert(session.id, session.clone());
        state.dirty.remove(&session.id);
        true
    }

    fn write(&self, session: &PersistenceSession) -> bool {
        match self.store.put(&session_key(session.id), session) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("failed to persist session {}: {err}", session.id);
                false
            }
        }
    }

    /// Retry every dirty session; returns how many became durable
    pub fn retry_dirty(&self) -> usize {
        let pending: Vec<PersistenceSession> = {
            let state = self.state();
            state.dirty.iter().filter_map(|id| state.sessions.get(id).cloned()).collect()
        };
        pending.iter().filter(|session| self.persist(session)).count()
    }

    /// Cached copy, falling back to the backend
    pub fn get(&self, id: SessionId) -> Option<PersistenceSession> {
        if let Some(session) = self.state().sessions.get(&id) {
            return Some(session.clone());
        }

        let session: PersistenceSession = match self.store.get(&session_key(id)) {
            Ok(Some(session)) => session,
            Ok(None) => return None,
            Err(err) => {
                log::warn!("failed to load session {id}: {err}");
                return None;
            }
        };
        if let Err(err) = session.validate() {
            log::warn!("stored session {id} is invalid: {err}");
            return None;
        }

        let mut state = self.state();
        // A concurrent write may have cached a newer copy meanwhile
        let cached = state.sessions.entry(id).or_insert(session);
        Some(cached.clone())
    }

    /// Highest version this id has ever reached, including before a delete
    pub fn high_water(&self, id: SessionId) -> u64 {
        let live = self.get(id).map_or(0, |session| session.version);
        let retired = match self.store.get::<RetiredSession>(&retired_key(id)) {
            Ok(retired) => retired.map_or(0, |r| r.version),
            Err(err) => {
                log::warn!("failed to read retired version of session {id}: {err}");
                0
            }
        };
        live.max(retired)
    }

    /// Remove from backend and cache.
    ///
    /// The session's version is recorded first so a later restore of the
    /// same id never goes backwards; if that write fails nothing is removed.
    pub fn delete(&self, id: SessionId) -> bool {
        let retired = RetiredSession { version: self.high_water(id) };
        if let Err(err) = self.store.put(&retired_key(id), &retired) {
            log::warn!("failed to record version of session {id}: {err}");
            return false;
        }
        if let Err(err) = self.store.remove(&session_key(id)) {
            log::warn!("failed to delete session {id}: {err}");
            return false;
        }
        let mut state = self.state();
        state.sessions.remove(&id);
        state.dirty.remove(&id);
        true
    }

    /// Every known session id: cached ones plus those in the backend
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: BTreeSet<SessionId> = self.state().sessions.keys().copied().collect();
        match self.store.keys_with_prefix(SESSION_PREFIX) {
            Ok(keys) => ids.extend(
                keys.iter()
                    .filter_map(|key| key.strip_prefix(SESSION_PREFIX))
                    .filter_map(|id| id.parse::<SessionId>().ok()),
            ),
            Err(err) => log::warn!("failed to list stored sessions: {err}"),
        }
        ids.into_iter().collect()
    }

    /// Every known session that can be loaded
    pub fn all(&self) -> Vec<PersistenceSession> {
        self.ids().into_iter().filter_map(|id| self.get(id)).collect()
    }

    /// Replace the in-memory set wholesale and persist each session.
    ///
    /// Sessions that fail to persist stay cached and dirty.
    pub fn replace_cache(&self, sessions: Vec<PersistenceSession>) -> bool {
        {
            let mut state = self.state();
            state.sessions = sessions.iter().map(|s| (s.id, s.clone())).collect();
            state.dirty = sessions.iter().map(|s| s.id).collect();
        }
        let mut all_durable = true;
        for session in &sessions {
            if self.write(session) {
                self.state().dirty.remove(&session.id);
            } else {
                all_durable = false;
            }
        }
        all_durable
    }

    /// Forget cached sessions without touching the backend
    pub fn clear_cache(&self) {
        let mut state = self.state();
        state.sessions.clear();
        state.dirty.clear();
    }

    pub fn is_dirty(&self, id: SessionId) -> bool {
        self.state().dirty.contains(&id)
    }

    pub fn dirty_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.state().dirty.iter().copied().collect();
        ids.sort();
        ids
    }
}
