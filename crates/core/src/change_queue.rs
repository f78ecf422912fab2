//! Pending-change queue with a single-flight flush guard
//!
//! Producers append changes at any time. A flush drains the queue under a
//! [`FlushGuard`]; while one guard is alive no second flush can begin, so
//! the same change is never written twice. Changes whose write failed are
//! put back at the front, ahead of anything that arrived meanwhile.

use crate::annotation::{AnnotationId, AnnotationRecord};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// A pending mutation of the current session
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Insert the record, or replace the one with the same id
    Upsert(AnnotationRecord),
    /// Remove the record with this id
    Remove(AnnotationId),
}

impl Change {
    pub fn annotation_id(&self) -> AnnotationId {
        match self {
            Change::Upsert(record) => record.id(),
            Change::Remove(id) => *id,
        }
    }
}

#[derive(Debug, Default)]
pub struct ChangeQueue {
    pending: Mutex<VecDeque<Change>>,
    flushing: AtomicBool,
}

/// Proof that the holder is the only flush in flight.
///
/// Dropping the guard ends the flush.
#[derive(Debug)]
pub struct FlushGuard<'a> {
    queue: &'a ChangeQueue,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.queue.flushing.store(false, Ordering::Release);
    }
}

impl FlushGuard<'_> {
    /// Drain every pending change in enqueue order
    pub fn take_all(&self) -> Vec<Change> {
        self.queue.pending().drain(..).collect()
    }

    /// Put changes back at the front, preserving their order
    pub fn requeue_front(&self, changes: Vec<Change>) {
        let mut pending = self.queue.pending();
        for change in changes.into_iter().rev() {
            pending.push_front(change);
        }
    }
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Change>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a change; returns the new queue length
    pub fn push(&self, change: Change) -> usize {
        let mut pending = self.pending();
        pending.push_back(change);
        pending.len()
    }

    pub fn extend(&self, changes: impl IntoIterator<Item = Change>) -> usize {
        let mut pending = self.pending();
        pending.extend(changes);
        pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Copy of the pending changes, oldest first
    pub fn snapshot(&self) -> Vec<Change> {
        self.pending().iter().cloned().collect()
    }

    /// Drop every pending change
    pub fn clear(&self) -> usize {
        let mut pending = self.pending();
        let dropped = pending.len();
        pending.clear();
        dropped
    }

    /// Begin a flush, or `None` when another flush is already in flight
    pub fn begin_flush(&self) -> Option<FlushGuard<'_>> {
        self.flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushGuard { queue: self })
    }

    /// Block until no flush is in flight, then hold the guard.
    ///
    /// Whole-session writes outside the flush path take this so a flush
    /// cannot interleave with them.
    pub fn wait_for_flush(&self, poll: Duration) -> FlushGuard<'_> {
        loop {
            if let Some(guard) = self.begin_flush() {
                return guard;
            }
            thread::sleep(poll);
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }
}
