//! Persistence sessions
//!
//! A session is a versioned, owner-scoped collection of annotation records
//! plus summary metadata. Every persisted session is a fully validated
//! value; `refresh_summary` keeps the derived metadata in sync with the
//! records.

use crate::annotation::{AnnotationId, AnnotationRecord, ToolKind};
use crate::change_queue::Change;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a session
pub type SessionId = uuid::Uuid;

/// Descriptive metadata attached to a session
///
/// The correlation fields are supplied by the caller. `record_count` and
/// `tool_kinds` are derived from the records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    pub record_count: usize,
    /// Distinct tool kinds present, sorted
    pub tool_kinds: Vec<ToolKind>,
}

impl SessionMetadata {
    pub fn for_viewport(viewport_id: impl Into<String>, image_id: impl Into<String>) -> Self {
        Self {
            viewport_id: Some(viewport_id.into()),
            image_id: Some(image_id.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceSession {
    pub id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub records: Vec<AnnotationRecord>,
    pub metadata: SessionMetadata,
    pub version: u64,
}

/// Outcome of applying a batch of changes to a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub appended: usize,
    pub replaced: usize,
    pub removed: usize,
    /// Records refused because the session was full
    pub rejected: Vec<AnnotationId>,
}

impl ApplyReport {
    /// Whether any change altered the session
    pub fn changed(&self) -> bool {
        self.appended + self.replaced + self.removed > 0
    }
}

/// Lightweight listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub user_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    pub record_count: usize,
    pub tool_kinds: Vec<ToolKind>,
}

impl PersistenceSession {
    /// Create an empty session at version 1
    pub fn new(metadata: SessionMetadata, user_id: Option<String>) -> Self {
        let now = Utc::now();
        let mut session = Self {
            id: SessionId::new_v4(),
            user_id,
            created_at: now,
            updated_at: now,
            records: Vec::new(),
            metadata,
            version: 1,
        };
        session.refresh_summary();
        session
    }

    pub fn record(&self, id: AnnotationId) -> Option<&AnnotationRecord> {
        self.records.iter().find(|r| r.id() == id)
    }

    /// Recompute the derived metadata from the records
    pub fn refresh_summary(&mut self) {
        let mut kinds: Vec<ToolKind> = self.records.iter().map(AnnotationRecord::kind).collect();
        kinds.sort();
        kinds.dedup();
        self.metadata.record_count = self.records.len();
        self.metadata.tool_kinds = kinds;
    }

    /// Apply queued changes in order.
    ///
    /// An upsert replaces the record with the same id in place, otherwise
    /// appends it. Appends beyond `capacity` records are rejected.
    pub fn apply(&mut self, changes: &[Change], capacity: usize) -> ApplyReport {
        let mut report = ApplyReport::default();
        for change in changes {
            match change {
                Change::Upsert(record) => {
                    if let Some(slot) = self.records.iter_mut().find(|r| r.id() == record.id()) {
                        *slot = record.clone();
                        report.replaced += 1;
                    } else if self.records.len() < capacity {
                        self.records.push(record.clone());
                        report.appended += 1;
                    } else {
                        report.rejected.push(record.id());
                    }
                }
                Change::Remove(id) => {
                    let before = self.records.len();
                    self.records.retain(|r| r.id() != *id);
                    if self.records.len() < before {
                        report.removed += 1;
                    }
                }
            }
        }
        self.refresh_summary();
        report
    }

    /// Check every record and the derived metadata
    pub fn validate(&self) -> Result<(), crate::annotation::RecordError> {
        self.records.iter().try_for_each(AnnotationRecord::validate)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            user_id: self.user_id.clone(),
            updated_at: self.updated_at,
            version: self.version,
            record_count: self.records.len(),
            tool_kinds: self.metadata.tool_kinds.clone(),
        }
    }
}
