//! Tool adapters
//!
//! A [`ToolAdapter`] is the coordinator's view of one drawing tool. The
//! coordinator owns activation; the tool reports finished shapes by sending
//! [`ToolSignal`]s on the sender it was attached to.

use crate::annotation::{AnnotationId, ToolKind};
use crate::events::{RawCapture, ToolSignal};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("tool is not active")]
    NotActive,

    #[error("tool is not attached to a coordinator")]
    Detached,

    #[error("coordinator is gone")]
    Disconnected,

    #[error("tool refused: {0}")]
    Rejected(String),
}

pub type ToolResult<T> = Result<T, ToolError>;

pub trait ToolAdapter: Send {
    fn kind(&self) -> ToolKind;

    /// Hand the tool the sender it reports signals on
    fn attach(&mut self, signals: Sender<ToolSignal>);

    fn activate(&mut self) -> ToolResult<()>;

    fn deactivate(&mut self) -> ToolResult<()>;

    fn is_active(&self) -> bool;

    /// Forget any drawing state the tool keeps for `id`
    fn discard(&mut self, _id: AnnotationId) {}
}

#[derive(Debug, Default)]
struct ToolShared {
    active: AtomicBool,
    signals: Mutex<Option<Sender<ToolSignal>>>,
}

impl ToolShared {
    fn signals(&self) -> MutexGuard<'_, Option<Sender<ToolSignal>>> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, signal: ToolSignal) -> ToolResult<()> {
        let signals = self.signals();
        let sender = signals.as_ref().ok_or(ToolError::Detached)?;
        sender.send(signal).map_err(|_| ToolError::Disconnected)
    }
}

/// Adapter for a tool driven by an input surface.
///
/// The surface keeps a [`ToolHandle`] and calls it as the user draws; the
/// coordinator keeps the adapter.
#[derive(Debug)]
pub struct SurfaceTool {
    kind: ToolKind,
    shared: Arc<ToolShared>,
}

impl SurfaceTool {
    pub fn new(kind: ToolKind) -> Self {
        Self { kind, shared: Arc::new(ToolShared::default()) }
    }

    pub fn handle(&self) -> ToolHandle {
        ToolHandle { kind: self.kind, shared: self.shared.clone() }
    }
}

impl ToolAdapter for SurfaceTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn attach(&mut self, signals: Sender<ToolSignal>) {
        *self.shared.signals() = Some(signals);
    }

    fn activate(&mut self) -> ToolResult<()> {
        if self.shared.signals().is_none() {
            return Err(ToolError::Detached);
        }
        self.shared.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn deactivate(&mut self) -> ToolResult<()> {
        self.shared.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }
}

/// Input-side handle of a [`SurfaceTool`]
#[derive(Debug, Clone)]
pub struct ToolHandle {
    kind: ToolKind,
    shared: Arc<ToolShared>,
}

impl ToolHandle {
    pub fn kind(&self) -> ToolKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Report a finished shape; returns the id assigned to it
    pub fn complete(&self, capture: RawCapture) -> ToolResult<AnnotationId> {
        if !self.is_active() {
            return Err(ToolError::NotActive);
        }
        let id = AnnotationId::new_v4();
        self.shared.send(ToolSignal::Completed { tool: self.kind, id, capture })?;
        Ok(id)
    }

    /// Report an edit of a shape this tool completed earlier
    pub fn modify(&self, id: AnnotationId, capture: RawCapture) -> ToolResult<()> {
        self.shared.send(ToolSignal::Modified { tool: self.kind, id, capture })
    }

    pub fn remove(&self, id: AnnotationId) -> ToolResult<()> {
        self.shared.send(ToolSignal::Removed { tool: self.kind, id })
    }
}
