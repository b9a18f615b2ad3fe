//! Engine settings
//!
//! Retention, locking, dump parallelism and restore batching. Stored as
//! `config.json` in the base directory; every field has a default so older
//! files keep loading.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::paths::BackupPaths;
use crate::crypto::key_derivation::KdfCost;
use crate::error::EngineError;

/// Upper bound on concurrent collection dumps
pub const MAX_DUMP_WORKERS: usize = 4;

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Schema version for migration support
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Age in days after which cleanup removes backups and restore records
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Lease length of the operation lock; abandoned locks expire after this
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Whether `backup create` compresses unless told otherwise
    #[serde(default = "default_true")]
    pub compress_by_default: bool,

    /// Concurrent collection dumps, capped at 4
    #[serde(default = "default_dump_workers")]
    pub max_dump_workers: usize,

    /// Documents inserted per store call during restore
    #[serde(default = "default_batch_size")]
    pub restore_batch_size: usize,

    /// Take a safety backup before an overwrite restore
    #[serde(default = "default_true")]
    pub safety_backup_before_overwrite: bool,

    /// Keep backups that a surviving restore record names as its safety backup
    #[serde(default = "default_true")]
    pub retain_referenced_safety_backups: bool,

    /// Argon2 cost parameters for encrypted archives
    #[serde(default)]
    pub key_derivation: KdfCost,
}

fn default_schema_version() -> u32 {
    1
}

fn default_retention_days() -> u32 {
    30
}

fn default_lock_ttl_secs() -> u64 {
    15 * 60
}

fn default_true() -> bool {
    true
}

fn default_dump_workers() -> usize {
    MAX_DUMP_WORKERS
}

fn default_batch_size() -> usize {
    500
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            retention_days: default_retention_days(),
            lock_ttl_secs: default_lock_ttl_secs(),
            compress_by_default: true,
            max_dump_workers: default_dump_workers(),
            restore_batch_size: default_batch_size(),
            safety_backup_before_overwrite: true,
            retain_referenced_safety_backups: true,
            key_derivation: KdfCost::default(),
        }
    }
}

impl Settings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs.max(1))
    }

    /// Worker count clamped to `1..=4`
    pub fn dump_workers(&self) -> usize {
        self.max_dump_workers.clamp(1, MAX_DUMP_WORKERS)
    }

    pub fn batch_size(&self) -> usize {
        self.restore_batch_size.max(1)
    }

    /// Reject values that would make the engine misbehave
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.retention_days == 0 {
            return Err(EngineError::Config(
                "retention_days must be at least 1".into(),
            ));
        }
        if self.lock_ttl_secs == 0 {
            return Err(EngineError::Config("lock_ttl_secs must be at least 1".into()));
        }
        if self.key_derivation.exceeds_ceiling() {
            return Err(EngineError::Config(format!(
                "key_derivation cost exceeds the maximum {:?}",
                KdfCost::CEILING
            )));
        }
        Ok(())
    }

    /// Load settings from disk, or return defaults if the file doesn't exist
    pub fn load_or_create(paths: &BackupPaths) -> Result<Self, EngineError> {
        let settings_path = paths.settings_file();

        if settings_path.exists() {
            let contents = std::fs::read_to_string(&settings_path).map_err(|e| {
                EngineError::Io(format!("Failed to read settings file: {}", e))
            })?;

            let settings: Settings = serde_json::from_str(&contents).map_err(|e| {
                EngineError::Config(format!("Failed to parse settings file: {}", e))
            })?;

            settings.validate()?;
            Ok(settings)
        } else {
            // Don't save yet - let caller decide when to persist
            Ok(Settings::default())
        }
    }

    /// Save settings to disk
    pub fn save(&self, paths: &BackupPaths) -> Result<(), EngineError> {
        paths.ensure_directories()?;
        crate::storage::write_json_atomic(paths.settings_file(), self)
    }
}
