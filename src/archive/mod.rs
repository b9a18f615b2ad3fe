//! Archive codec
//!
//! Streams named collections into one `.cmsa` file and back. See
//! [`format`] for the byte layout.

pub mod format;
pub mod reader;
pub mod writer;

use chrono::{DateTime, Utc};

pub use format::SegmentHeader;
pub use reader::{ArchiveReader, ArchiveStream};
pub use writer::{ArchiveKey, ArchiveWriter, SegmentSpool, SpooledSegment};

use crate::models::{BackupId, BackupType};

/// File name for a new archive: `backup-{type}-{timestamp}-{id8}.cmsa[.gz]`
pub fn archive_file_name(
    backup_type: BackupType,
    id: BackupId,
    at: DateTime<Utc>,
    compressed: bool,
) -> String {
    let mut name = format!(
        "backup-{}-{}-{:03}-{}.{}",
        backup_type,
        at.format("%Y%m%d-%H%M%S"),
        at.timestamp_subsec_millis(),
        id.short(),
        format::EXTENSION
    );
    if compressed {
        name.push_str(".gz");
    }
    name
}
