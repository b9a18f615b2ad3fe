//! Restore history record and restore source variants

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::collection::Collection;
use super::ids::{BackupId, RestoreId};

/// Where a restore reads its archive from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    /// An archive produced by a previous backup
    ExistingBackup(BackupId),
    /// An archive file supplied by the caller
    UploadedFile { path: PathBuf },
}

impl RestoreSource {
    pub fn source_type(&self) -> SourceType {
        match self {
            Self::ExistingBackup(_) => SourceType::ExistingBackup,
            Self::UploadedFile { .. } => SourceType::UploadedFile,
        }
    }

    pub fn backup_id(&self) -> Option<BackupId> {
        match self {
            Self::ExistingBackup(id) => Some(*id),
            Self::UploadedFile { .. } => None,
        }
    }
}

/// Persisted discriminant of [`RestoreSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    ExistingBackup,
    UploadedFile,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExistingBackup => write!(f, "existing_backup"),
            Self::UploadedFile => write!(f, "uploaded_file"),
        }
    }
}

/// Scope of a restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreType {
    Full,
    Selective,
}

impl RestoreType {
    /// A restore without an explicit collection list is a full restore
    pub fn for_request(requested: Option<&[Collection]>) -> Self {
        match requested {
            Some(cols) if !cols.is_empty() => Self::Selective,
            _ => Self::Full,
        }
    }
}

impl fmt::Display for RestoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Selective => write!(f, "selective"),
        }
    }
}

/// Lifecycle state of a restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RestoreStatus {
    /// Only `in_progress` may move, and only to a terminal state
    pub fn can_transition_to(&self, next: RestoreStatus) -> bool {
        *self == Self::InProgress && next != Self::InProgress
    }

    pub fn is_terminal(&self) -> bool {
        *self != Self::InProgress
    }
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// History entry for one restore run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRecord {
    pub id: RestoreId,

    /// Lookup-only reference; the backup may since have been deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_backup_id: Option<BackupId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_backup_name: Option<String>,

    pub source_type: SourceType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_file_name: Option<String>,

    pub restore_type: RestoreType,

    #[serde(default)]
    pub collections_restored: Vec<Collection>,

    #[serde(default)]
    pub collections_skipped: Vec<Collection>,

    pub overwrite_mode: bool,

    /// Lookup-only reference to the pre-restore snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_backup_id: Option<BackupId>,

    #[serde(default)]
    pub total_documents_restored: u64,

    pub status: RestoreStatus,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    pub restored_by: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RestoreRecord {
    /// Build a record in the `in_progress` state
    pub fn in_progress(
        source_type: SourceType,
        restore_type: RestoreType,
        overwrite_mode: bool,
        restored_by: impl Into<String>,
    ) -> Self {
        Self {
            id: RestoreId::new(),
            source_backup_id: None,
            source_backup_name: None,
            source_type,
            uploaded_file_name: None,
            restore_type,
            collections_restored: Vec::new(),
            collections_skipped: Vec::new(),
            overwrite_mode,
            safety_backup_id: None,
            total_documents_restored: 0,
            status: RestoreStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            restored_by: restored_by.into(),
            description: None,
            error_message: None,
            details: None,
        }
    }

    /// Whether this record still points at the given backup
    pub fn references(&self, backup_id: BackupId) -> bool {
        self.source_backup_id == Some(backup_id) || self.safety_backup_id == Some(backup_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_status_transitions() {
        use RestoreStatus::*;
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(!InProgress.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Completed));
        assert!(Failed.is_terminal());
    }

    #[test]
    fn test_restore_type_for_request() {
        assert_eq!(RestoreType::for_request(None), RestoreType::Full);
        assert_eq!(RestoreType::for_request(Some(&[])), RestoreType::Full);
        assert_eq!(
            RestoreType::for_request(Some(&[Collection::Blogs])),
            RestoreType::Selective
        );
    }

    #[test]
    fn test_source_variants() {
        let id = BackupId::new();
        let existing = RestoreSource::ExistingBackup(id);
        assert_eq!(existing.source_type(), SourceType::ExistingBackup);
        assert_eq!(existing.backup_id(), Some(id));

        let uploaded = RestoreSource::UploadedFile {
            path: PathBuf::from("/tmp/upload.cmsa"),
        };
        assert_eq!(uploaded.source_type(), SourceType::UploadedFile);
        assert_eq!(uploaded.backup_id(), None);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&RestoreStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let json = serde_json::to_string(&SourceType::UploadedFile).unwrap();
        assert_eq!(json, "\"uploaded_file\"");
    }

    #[test]
    fn test_references() {
        let id = BackupId::new();
        let mut record =
            RestoreRecord::in_progress(SourceType::ExistingBackup, RestoreType::Full, true, "admin");
        assert!(!record.references(id));
        record.safety_backup_id = Some(id);
        assert!(record.references(id));
    }
}
