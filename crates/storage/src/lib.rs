//! Key-value storage backends for annotation sessions and backups.
//!
//! Every adapter implements [`StorageBackend`] with identical semantics:
//! keys are namespaced strings (`session-<id>`, `backup-<id>`) and values are
//! opaque byte payloads. Each adapter owns its failure and quota behaviour.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

mod journal;
mod local;
mod memory;
mod remote;

pub use journal::JournalStore;
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use remote::RemoteStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("unable to resolve local data directory")]
    NoDataDirectory,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid key '{0}'")]
    InvalidKey(String),
    #[error("quota exceeded: {needed} bytes needed, limit is {limit}")]
    QuotaExceeded { needed: u64, limit: u64 },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("backend misconfigured: {0}")]
    Misconfigured(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Closed set of backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Durable per-user store (one file per key)
    Local,
    /// Volatile in-process store, lost when the process exits
    Memory,
    /// Single-file transactional table with a write-ahead journal
    Journal,
    /// Remote HTTP key-value service
    Remote,
}

/// Space accounting reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Bytes currently stored
    pub used: u64,
    /// Quota in bytes, `None` when unbounded or unknown
    pub limit: Option<u64>,
}

/// Uniform contract over every storage adapter.
///
/// A missing key is not an error: `load` returns `Ok(None)` and `delete`
/// succeeds. Writes replace the whole value for a key.
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn save(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    fn delete(&self, key: &str) -> StorageResult<()>;

    fn exists(&self, key: &str) -> StorageResult<bool>;

    /// All keys currently stored, sorted
    fn list(&self) -> StorageResult<Vec<String>>;

    fn clear(&self) -> StorageResult<()>;

    fn stats(&self) -> StorageResult<StorageStats>;
}

/// Keys are restricted so every adapter can map them to file names and URL
/// path segments without escaping.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_owned()))
    }
}

/// Backend selection, resolved once when the engine is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Local {
        /// Override for the per-user data directory
        #[serde(default)]
        root: Option<PathBuf>,
        #[serde(default)]
        quota_bytes: Option<u64>,
    },
    Memory {
        #[serde(default)]
        quota_bytes: Option<u64>,
    },
    Journal {
        path: Option<PathBuf>,
    },
    Remote {
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_remote_timeout")]
        timeout_secs: u64,
    },
}

fn default_remote_timeout() -> u64 {
    10
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local { root: None, quota_bytes: None }
    }
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Local { .. } => BackendKind::Local,
            BackendConfig::Memory { .. } => BackendKind::Memory,
            BackendConfig::Journal { .. } => BackendKind::Journal,
            BackendConfig::Remote { .. } => BackendKind::Remote,
        }
    }
}

/// A backend together with how it was obtained
pub struct OpenedBackend {
    pub backend: Arc<dyn StorageBackend>,
    /// Set when the configured backend could not be built and the local
    /// store was substituted
    pub fallback_reason: Option<String>,
}

impl std::fmt::Debug for OpenedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedBackend")
            .field("kind", &self.backend.kind())
            .field("fallback_reason", &self.fallback_reason)
            .finish()
    }
}

/// Build the configured backend without any fallback.
pub fn try_open_backend(config: &BackendConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match config {
        BackendConfig::Local { root, quota_bytes } => {
            let store = match root {
                Some(root) => LocalStore::with_root(root),
                None => LocalStore::from_default_project()?,
            };
            Arc::new(store.with_quota(*quota_bytes))
        }
        BackendConfig::Memory { quota_bytes } => {
            Arc::new(MemoryStore::new().with_quota(*quota_bytes))
        }
        BackendConfig::Journal { path } => {
            let path = path.as_ref().ok_or_else(|| {
                StorageError::Misconfigured("journal backend requires a database path".into())
            })?;
            Arc::new(JournalStore::open(path)?)
        }
        BackendConfig::Remote { endpoint, token, timeout_secs } => {
            let endpoint = endpoint.as_deref().filter(|e| !e.trim().is_empty()).ok_or_else(|| {
                StorageError::Misconfigured("remote backend requires an endpoint".into())
            })?;
            Arc::new(RemoteStore::new(
                endpoint,
                token.clone(),
                std::time::Duration::from_secs(*timeout_secs),
            )?)
        }
    };
    Ok(backend)
}

/// Build the configured backend, falling back to the durable local store
/// when the configuration cannot be satisfied.
pub fn open_backend(config: &BackendConfig) -> OpenedBackend {
    match try_open_backend(config) {
        Ok(backend) => OpenedBackend { backend, fallback_reason: None },
        Err(err) => {
            log::warn!("{:?} backend unavailable ({err}); falling back to local store", config.kind());
            let backend: Arc<dyn StorageBackend> = match LocalStore::from_default_project() {
                Ok(store) => Arc::new(store),
                Err(local_err) => {
                    log::error!("local store unavailable ({local_err}); using volatile memory store");
                    Arc::new(MemoryStore::new())
                }
            };
            OpenedBackend { backend, fallback_reason: Some(err.to_string()) }
        }
    }
}
