//! Path management for the backup engine
//!
//! ## Path Resolution Order
//!
//! 1. `CMS_BACKUP_HOME` environment variable (if set)
//! 2. The platform config directory from `directories`
//!    (`~/.config/cms-backup` on Linux)

use std::path::PathBuf;

use directories::ProjectDirs;

use crate::error::EngineError;

/// Environment variable that overrides the base directory
pub const HOME_ENV: &str = "CMS_BACKUP_HOME";

/// Manages all paths used by the engine
#[derive(Debug, Clone)]
pub struct BackupPaths {
    /// Base directory for all engine state
    base_dir: PathBuf,
}

impl BackupPaths {
    /// Resolve the base directory from the environment or platform defaults
    ///
    /// # Errors
    ///
    /// Returns an error if no home directory can be determined.
    pub fn new() -> Result<Self, EngineError> {
        let base_dir = match std::env::var(HOME_ENV) {
            Ok(custom) if !custom.trim().is_empty() => PathBuf::from(custom),
            _ => resolve_default_path()?,
        };

        Ok(Self { base_dir })
    }

    /// Create paths with a custom base directory (useful for testing)
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Directory holding archive files
    pub fn backup_dir(&self) -> PathBuf {
        self.base_dir.join("backups")
    }

    /// Default directory of the JSON document store used by the CLI
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    /// Directory holding the history files
    pub fn history_dir(&self) -> PathBuf {
        self.base_dir.join("history")
    }

    pub fn backup_history_file(&self) -> PathBuf {
        self.history_dir().join("backups.json")
    }

    pub fn restore_history_file(&self) -> PathBuf {
        self.history_dir().join("restores.json")
    }

    /// Lease file of the global operation lock
    pub fn lock_file(&self) -> PathBuf {
        self.base_dir.join("operation.lock")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<(), EngineError> {
        for dir in [
            self.base_dir.clone(),
            self.backup_dir(),
            self.data_dir(),
            self.history_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                EngineError::Io(format!("Failed to create directory {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

fn resolve_default_path() -> Result<PathBuf, EngineError> {
    ProjectDirs::from("", "", "cms-backup")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| EngineError::Config("Could not determine a home directory".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_custom_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let paths = BackupPaths::with_base_dir(temp_dir.path().to_path_buf());

        assert_eq!(paths.base_dir(), temp_dir.path());
        assert_eq!(paths.backup_dir(), temp_dir.path().join("backups"));
        assert_eq!(
            paths.backup_history_file(),
            temp_dir.path().join("history").join("backups.json")
        );
        assert_eq!(paths.lock_file(), temp_dir.path().join("operation.lock"));
    }

    #[test]
    fn test_ensure_directories() {
        let temp_dir = TempDir::new().unwrap();
        let paths = BackupPaths::with_base_dir(temp_dir.path().join("nested"));

        paths.ensure_directories().unwrap();

        assert!(paths.backup_dir().exists());
        assert!(paths.data_dir().exists());
        assert!(paths.history_dir().exists());
    }
}
