//! Display formatting for terminal output
//!
//! History lists render as tables; single records and previews as detail
//! views.

pub mod backup;
pub mod restore;

pub use backup::{format_backup_details, format_backup_list};
pub use restore::{format_preview, format_restore_details, format_restore_list};

use chrono::{DateTime, Utc};

/// Timestamp as shown in every view
pub(crate) fn format_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Format a duration in human-readable form
pub(crate) fn format_duration(duration: chrono::Duration) -> String {
    let total_seconds = duration.num_seconds();
    if total_seconds < 60 {
        return format!("{}s", total_seconds);
    }

    let minutes = total_seconds / 60;
    if minutes < 60 {
        return format!("{}m {}s", minutes, total_seconds % 60);
    }

    format!("{}h {}m", minutes / 60, minutes % 60)
}
