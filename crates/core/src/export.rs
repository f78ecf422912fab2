//! Session export and import
//!
//! JSON is the lossless interchange format: the full session document.
//! CSV is a flattened, lossy report with one row per record; importing CSV
//! can only rebuild text annotations.

use crate::annotation::{AnnotationGeometry, AnnotationId, AnnotationRecord, ImagePoint, ToolKind};
use crate::session::{PersistenceSession, SessionMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid import document: {0}")]
    InvalidDocument(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("session not found: {0}")]
    SessionNotFound(crate::session::SessionId),
}

pub type ExportResult<T> = Result<T, ExportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        })
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(ExportError::UnsupportedFormat(other.to_owned())),
        }
    }
}

/// Configuration for CSV export
#[derive(Debug, Clone)]
pub struct CsvExportConfig {
    /// Include column headers in the output
    pub include_headers: bool,

    /// CSV delimiter character
    pub delimiter: u8,
}

impl Default for CsvExportConfig {
    fn default() -> Self {
        Self { include_headers: true, delimiter: b',' }
    }
}

const CSV_HEADERS: [&str; 8] = ["ID", "Tool", "Text", "X", "Y", "Image ID", "Viewport ID", "Timestamp"];

/// Records parsed from an import document, not yet bound to a session
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedSession {
    pub metadata: SessionMetadata,
    pub user_id: Option<String>,
    pub records: Vec<AnnotationRecord>,
    /// Rows or entries that could not be turned into valid records
    pub skipped: usize,
}

pub fn export_session(session: &PersistenceSession, format: ExportFormat) -> ExportResult<String> {
    match format {
        ExportFormat::Json => export_json(session),
        ExportFormat::Csv => export_csv(session, &CsvExportConfig::default()),
    }
}

pub fn export_json(session: &PersistenceSession) -> ExportResult<String> {
    Ok(serde_json::to_string_pretty(session)?)
}

/// Export records as CSV
///
/// CSV columns:
/// - ID: Record identifier
/// - Tool: Tool kind (text, arrow, length, ...)
/// - Text: Label, if any
/// - X, Y: First defining point, image pixels
/// - Image ID, Viewport ID: Owners
/// - Timestamp: Last modification, RFC 3339
pub fn export_csv(session: &PersistenceSession, config: &CsvExportConfig) -> ExportResult<String> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(config.delimiter)
        .has_headers(config.include_headers)
        .from_writer(Vec::new());

    if config.include_headers {
        writer.write_record(CSV_HEADERS)?;
    }

    for record in &session.records {
        let point = record.geometry().first_point();
        writer.write_record([
            record.id().to_string(),
            record.kind().to_string(),
            record.label().unwrap_or_default().to_owned(),
            point.x.to_string(),
            point.y.to_string(),
            record.image_id().to_owned(),
            record.viewport_id().to_owned(),
            record.modified_at().to_rfc3339(),
        ])?;
    }

    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    String::from_utf8(bytes).map_err(|e| ExportError::InvalidDocument(e.to_string()))
}

pub fn parse_import(data: &str, format: ExportFormat) -> ExportResult<ImportedSession> {
    match format {
        ExportFormat::Json => parse_json(data),
        ExportFormat::Csv => parse_csv(data),
    }
}

fn parse_json(data: &str) -> ExportResult<ImportedSession> {
    let document: serde_json::Value = serde_json::from_str(data)?;
    let object = document
        .as_object()
        .ok_or_else(|| ExportError::InvalidDocument("expected a JSON object".into()))?;
    let entries = object
        .get("records")
        .and_then(|r| r.as_array())
        .ok_or_else(|| ExportError::InvalidDocument("missing \"records\" array".into()))?;

    let metadata = object
        .get("metadata")
        .cloned()
        .and_then(|m| serde_json::from_value::<SessionMetadata>(m).ok())
        .unwrap_or_default();
    let user_id = object.get("user_id").and_then(|u| u.as_str()).map(str::to_owned);

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(entries.len());
    let mut skipped = 0;
    for entry in entries {
        let record = match serde_json::from_value::<AnnotationRecord>(entry.clone()) {
            Ok(record) => record,
            Err(err) => {
                log::debug!("skipping unreadable record: {err}");
                skipped += 1;
                continue;
            }
        };
        if let Err(err) = record.validate() {
            log::debug!("skipping invalid record {}: {err}", record.id());
            skipped += 1;
            continue;
        }
        if !seen.insert(record.id()) {
            skipped += 1;
            continue;
        }
        records.push(record);
    }

    Ok(ImportedSession { metadata, user_id, records, skipped })
}

fn parse_csv(data: &str) -> ExportResult<ImportedSession> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).flexible(true).from_reader(data.as_bytes());

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    let mut skipped = 0;
    for row in reader.records() {
        let rebuilt = row.ok().and_then(|row| text_record_from_row(&row));
        match rebuilt {
            Some(record) if seen.insert(record.id()) => records.push(record),
            _ => skipped += 1,
        }
    }

    let metadata = match records.first() {
        Some(first) => SessionMetadata::for_viewport(first.viewport_id(), first.image_id()),
        None => SessionMetadata::default(),
    };
    Ok(ImportedSession { metadata, user_id: None, records, skipped })
}

fn text_record_from_row(row: &csv::StringRecord) -> Option<AnnotationRecord> {
    let kind: ToolKind = row.get(1)?.parse().ok()?;
    if kind != ToolKind::Text {
        return None;
    }
    let id: AnnotationId = row.get(0)?.trim().parse().ok()?;
    let text = row.get(2).map(str::to_owned);
    let x: f64 = row.get(3)?.trim().parse().ok()?;
    let y: f64 = row.get(4)?.trim().parse().ok()?;
    let timestamp = DateTime::parse_from_rfc3339(row.get(7)?.trim()).ok()?.with_timezone(&Utc);

    let geometry = AnnotationGeometry::Anchor { position: ImagePoint::new(x, y) };
    AnnotationRecord::new(kind, geometry, row.get(5)?, row.get(6)?)
        .ok()
        .map(|record| record.with_id(id).with_label(text).with_created_at(timestamp))
}
