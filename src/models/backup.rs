//! Backup history record
//!
//! A `BackupRecord` describes one archive file: which collections it holds,
//! who created it and where it is in its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::collection::Collection;
use super::ids::BackupId;
use crate::error::{EngineError, EngineResult};

/// Kind of backup requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Every whitelisted collection unless a list is given
    #[default]
    Full,
    /// Recorded as incremental; content covers the resolved collections
    Incremental,
    /// An explicit subset of collections
    Selective,
}

impl BackupType {
    /// Parse backup type from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "full" => Some(Self::Full),
            "incremental" | "incr" => Some(Self::Incremental),
            "selective" => Some(Self::Selective),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Selective => "selective",
        }
    }

    /// Resolve the set of collections this backup will dump
    ///
    /// An explicit list always wins and is validated against the whitelist.
    /// Without one, full and incremental backups cover the whole whitelist
    /// while selective backups are rejected.
    pub fn resolve_collections<S: AsRef<str>>(
        &self,
        requested: Option<&[S]>,
    ) -> EngineResult<Vec<Collection>> {
        match requested {
            Some(names) if !names.is_empty() => Collection::parse_list(names),
            _ => match self {
                Self::Full | Self::Incremental => Ok(Collection::ALL.to_vec()),
                Self::Selective => Err(EngineError::Validation(
                    "A selective backup requires at least one collection".into(),
                )),
            },
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Creating,
    Completed,
    Failed,
    Deleted,
}

impl BackupStatus {
    /// Allowed moves: creating → completed | failed, completed | failed → deleted
    pub fn can_transition_to(&self, next: BackupStatus) -> bool {
        matches!(
            (self, next),
            (Self::Creating, Self::Completed)
                | (Self::Creating, Self::Failed)
                | (Self::Completed, Self::Deleted)
                | (Self::Failed, Self::Deleted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// History entry for one backup archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Unique identifier
    pub id: BackupId,

    /// Archive file name inside the backup directory
    pub filename: String,

    /// Full path to the archive file
    pub file_path: PathBuf,

    /// Name shown to users (same as `filename` for generated archives)
    pub original_name: String,

    pub backup_type: BackupType,

    /// Collections in archive order, never empty
    pub collections: Vec<Collection>,

    /// Archive size in bytes, meaningful once completed
    #[serde(default)]
    pub size: u64,

    pub status: BackupStatus,

    /// Creation time; history ordering and retention use this
    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    pub created_by: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub compression: bool,

    #[serde(default)]
    pub encryption: bool,
}

impl BackupRecord {
    /// Build a record in the `creating` state
    pub fn creating(
        id: BackupId,
        file_path: PathBuf,
        backup_type: BackupType,
        collections: Vec<Collection>,
        created_by: impl Into<String>,
    ) -> Self {
        let filename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Self {
            id,
            original_name: filename.clone(),
            filename,
            file_path,
            backup_type,
            collections,
            size: 0,
            status: BackupStatus::Creating,
            started_at: Utc::now(),
            completed_at: None,
            created_by: created_by.into(),
            description: None,
            error_message: None,
            deleted_at: None,
            compression: false,
            encryption: false,
        }
    }

    /// Whether the archive can be used as a restore source
    pub fn is_restorable(&self) -> bool {
        self.status == BackupStatus::Completed
    }

    /// Wall-clock duration of the backup, once finished
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_without_list_uses_whitelist() {
        let cols = BackupType::Full.resolve_collections::<&str>(None).unwrap();
        assert_eq!(cols, Collection::ALL.to_vec());

        let cols = BackupType::Incremental
            .resolve_collections::<&str>(Some(&[]))
            .unwrap();
        assert_eq!(cols.len(), 8);
    }

    #[test]
    fn test_explicit_list_is_validated() {
        let cols = BackupType::Selective
            .resolve_collections(Some(&["blogs", "users"]))
            .unwrap();
        assert_eq!(cols, vec![Collection::Blogs, Collection::Users]);

        let err = BackupType::Full
            .resolve_collections(Some(&["blogs", "invoices"]))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_selective_requires_collections() {
        let err = BackupType::Selective
            .resolve_collections::<&str>(None)
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_status_transitions() {
        use BackupStatus::*;
        assert!(Creating.can_transition_to(Completed));
        assert!(Creating.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Deleted));
        assert!(Failed.can_transition_to(Deleted));

        assert!(!Creating.can_transition_to(Deleted));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Deleted.can_transition_to(Deleted));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_creating_record() {
        let record = BackupRecord::creating(
            BackupId::new(),
            PathBuf::from("/tmp/backups/backup-full-x.cmsa"),
            BackupType::Full,
            vec![Collection::Blogs],
            "admin",
        );
        assert_eq!(record.status, BackupStatus::Creating);
        assert_eq!(record.filename, "backup-full-x.cmsa");
        assert_eq!(record.original_name, record.filename);
        assert!(!record.is_restorable());
        assert!(record.duration().is_none());
    }

    #[test]
    fn test_parse_type() {
        assert_eq!(BackupType::parse("Selective"), Some(BackupType::Selective));
        assert_eq!(BackupType::parse("weekly"), None);
    }
}
