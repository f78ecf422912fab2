//! Annotation Engine Core Library
//!
//! Annotation data model, measurement tools and session persistence.

pub mod annotation;
pub mod backup;
pub mod change_queue;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod export;
pub mod measurement;
pub mod persistence;
pub mod session;
pub mod session_store;
pub mod tools;
pub mod write_coordinator;

pub use annotation::{
    AnnotationGeometry, AnnotationId, AnnotationRecord, Bounds, Correlation, GeometryShape,
    ImagePoint, MeasuredValue, RecordError, RecordResult, ToolKind, Unit,
};
pub use backup::{Backup, BackupId, BackupInfo, BackupManager, BackupReason};
pub use change_queue::{Change, ChangeQueue};
pub use codec::{CodecError, CodecResult, CodecStore, PayloadCodec};
pub use config::{BackupConfig, ConfigError, ConfigResult, PersistenceConfig};
pub use coordinator::{
    CoordinatorConfig, CoordinatorError, CoordinatorResult, MeasurementSummary,
    MeasurementToolCoordinator, ToolPhase,
};
pub use events::{MeasurementEvent, RawCapture, SignalBus, ToolSignal};
pub use export::{CsvExportConfig, ExportError, ExportFormat, ExportResult, ImportedSession};
pub use measurement::{MeasurementPrecision, PixelSpacing};
pub use persistence::{
    AnnotationPersistence, FlushOutcome, FlushReport, ImportReport, SaveOutcome, SessionHandle,
    SweepReport,
};
pub use session::{ApplyReport, PersistenceSession, SessionId, SessionMetadata, SessionSummary};
pub use session_store::SessionStore;
pub use tools::{SurfaceTool, ToolAdapter, ToolError, ToolHandle, ToolResult};
pub use write_coordinator::{PeriodicTask, TaskControl, WriteCoordinator};

pub use markup_storage::{BackendConfig, BackendKind, StorageBackend, StorageStats};
