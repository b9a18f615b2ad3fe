//! Core data models for the backup engine
//!
//! History records, the collection whitelist and the document shape shared
//! by the archive codec and the document store.

pub mod backup;
pub mod collection;
pub mod document;
pub mod ids;
pub mod restore;

pub use backup::{BackupRecord, BackupStatus, BackupType};
pub use collection::Collection;
pub use document::{Document, DocumentKey, PRIMARY_KEY};
pub use ids::{BackupId, RestoreId};
pub use restore::{RestoreRecord, RestoreSource, RestoreStatus, RestoreType, SourceType};
