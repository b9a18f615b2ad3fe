//! Backup and restore orchestration
//!
//! - `BackupOrchestrator`: creates archives, keeps backup history, applies
//!   retention
//! - `RestoreOrchestrator`: safety backups, overwrite and merge restores,
//!   previews and restore history
//!
//! Both share one [`OperationLock`](crate::lock::OperationLock), so at most
//! one backup or restore runs at a time.
//!
//! # Example
//!
//! ```rust,ignore
//! use cms_backup::backup::{CreateBackupRequest, RestoreRequest};
//! use cms_backup::models::{BackupType, RestoreSource};
//!
//! let outcome = engine
//!     .backups()
//!     .create_backup(CreateBackupRequest::new(BackupType::Full, "admin"))?;
//!
//! let request = RestoreRequest::new(RestoreSource::ExistingBackup(outcome.backup_id), "admin")
//!     .overwrite(true);
//! engine.restores().restore_from_backup(request)?;
//! ```

mod orchestrator;
mod restore;

pub use orchestrator::{
    format_size, BackupOrchestrator, BackupOutcome, CleanupOutcome, CreateBackupRequest,
    DeleteOutcome,
};
pub use restore::{
    CollectionPreview, PreviewRequest, RestoreOrchestrator, RestoreOutcome, RestorePreview,
    RestoreRequest, SAFETY_BACKUP_DESCRIPTION,
};
