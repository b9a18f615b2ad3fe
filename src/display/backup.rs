//! Backup record display formatting

use tabled::{settings::Style, Table, Tabled};

use super::{format_duration, format_time};
use crate::backup::format_size;
use crate::models::{BackupRecord, BackupStatus, Collection};

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    backup_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Collections")]
    collections: String,
    #[tabled(rename = "By")]
    created_by: String,
}

impl From<&BackupRecord> for BackupRow {
    fn from(record: &BackupRecord) -> Self {
        let collections = if Collection::is_whole_whitelist(&record.collections) {
            "all".to_string()
        } else {
            Collection::join(&record.collections)
        };
        let size = match record.status {
            BackupStatus::Completed => format_size(record.size),
            _ => "-".to_string(),
        };

        Self {
            id: record.id.to_string(),
            backup_type: record.backup_type.to_string(),
            status: record.status.to_string(),
            started: format_time(&record.started_at),
            size,
            collections,
            created_by: record.created_by.clone(),
        }
    }
}

/// Format backup history as a table
pub fn format_backup_list(records: &[BackupRecord]) -> String {
    if records.is_empty() {
        return "No backups found.".to_string();
    }

    let rows: Vec<BackupRow> = records.iter().map(BackupRow::from).collect();
    let mut table = Table::new(rows);
    table.with(Style::psql());
    format!("{}\n\nTotal: {} backup(s)", table, records.len())
}

/// Format a single backup's details
pub fn format_backup_details(record: &BackupRecord) -> String {
    let mut output = String::new();

    output.push_str(&format!("Backup: {}\n", record.filename));
    output.push_str(&format!("  ID:          {}\n", record.id));
    output.push_str(&format!("  Type:        {}\n", record.backup_type));
    output.push_str(&format!("  Status:      {}\n", record.status));
    output.push_str(&format!(
        "  Collections: {}\n",
        Collection::join(&record.collections)
    ));
    output.push_str(&format!("  Path:        {}\n", record.file_path.display()));
    output.push_str(&format!("  Size:        {}\n", format_size(record.size)));
    output.push_str(&format!(
        "  Compressed:  {}\n",
        if record.compression { "Yes" } else { "No" }
    ));
    output.push_str(&format!(
        "  Encrypted:   {}\n",
        if record.encryption { "Yes" } else { "No" }
    ));
    output.push_str(&format!("  Created by:  {}\n", record.created_by));
    output.push_str(&format!("  Started:     {}\n", format_time(&record.started_at)));

    if let Some(completed) = &record.completed_at {
        output.push_str(&format!("  Finished:    {}\n", format_time(completed)));
    }
    if let Some(duration) = record.duration() {
        output.push_str(&format!("  Duration:    {}\n", format_duration(duration)));
    }
    if let Some(deleted) = &record.deleted_at {
        output.push_str(&format!("  Deleted:     {}\n", format_time(deleted)));
    }
    if let Some(description) = &record.description {
        output.push_str(&format!("  Description: {}\n", description));
    }
    if let Some(error) = &record.error_message {
        output.push_str(&format!("  Error:       {}\n", error));
    }

    output
}
