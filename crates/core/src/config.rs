//! Engine configuration
//!
//! Configuration is a plain serde value with defaults for every field, so a
//! JSON file only needs to name what it changes. Durations are written as
//! (possibly fractional) seconds.

use crate::codec::PayloadCodec;
use markup_storage::BackendConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

const DAY: u64 = 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

mod duration_secs {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Periodic backup settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Newest backups kept; older ones are pruned
    pub max_backups: usize,
    /// Backups older than this are pruned
    #[serde(with = "duration_secs")]
    pub max_backup_age: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            max_backups: 10,
            max_backup_age: Duration::from_secs(7 * DAY),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: BackendConfig,
    /// Flush the change queue on a timer instead of on every save
    pub auto_save: bool,
    #[serde(with = "duration_secs")]
    pub auto_save_interval: Duration,
    /// Bump the session version on every successful flush
    pub versioning: bool,
    pub compression: PayloadCodec,
    pub max_annotations_per_session: usize,
    pub backup: BackupConfig,
    /// Sessions not updated for this long are swept
    #[serde(with = "duration_secs")]
    pub retention_period: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            auto_save: true,
            auto_save_interval: Duration::from_secs(2),
            versioning: true,
            compression: PayloadCodec::Plain,
            max_annotations_per_session: 1000,
            backup: BackupConfig::default(),
            retention_period: Duration::from_secs(30 * DAY),
        }
    }
}

impl PersistenceConfig {
    /// Read a JSON configuration file, or the defaults when it does not exist
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Write the configuration as pretty JSON (temp file + rename)
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_auto_save(mut self, enabled: bool) -> Self {
        self.auto_save = enabled;
        self
    }

    pub fn with_auto_save_interval(mut self, interval: Duration) -> Self {
        self.auto_save_interval = interval;
        self
    }

    pub fn with_versioning(mut self, enabled: bool) -> Self {
        self.versioning = enabled;
        self
    }

    pub fn with_compression(mut self, codec: PayloadCodec) -> Self {
        self.compression = codec;
        self
    }

    pub fn with_max_annotations(mut self, max: usize) -> Self {
        self.max_annotations_per_session = max;
        self
    }

    pub fn with_backup(mut self, backup: BackupConfig) -> Self {
        self.backup = backup;
        self
    }

    pub fn with_retention_period(mut self, period: Duration) -> Self {
        self.retention_period = period;
        self
    }
}
