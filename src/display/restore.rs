//! Restore record and preview display formatting

use tabled::{settings::Style, Table, Tabled};

use super::format_time;
use crate::backup::{format_size, RestorePreview};
use crate::models::{Collection, RestoreRecord};

#[derive(Tabled)]
struct RestoreRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Mode")]
    mode: &'static str,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Documents")]
    documents: u64,
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "By")]
    restored_by: String,
}

fn source_label(record: &RestoreRecord) -> String {
    record
        .source_backup_name
        .clone()
        .or_else(|| record.uploaded_file_name.clone())
        .unwrap_or_else(|| record.source_type.to_string())
}

fn mode_label(record: &RestoreRecord) -> &'static str {
    if record.overwrite_mode {
        "overwrite"
    } else {
        "merge"
    }
}

/// Format restore history as a table
pub fn format_restore_list(records: &[RestoreRecord]) -> String {
    if records.is_empty() {
        return "No restores found.".to_string();
    }

    let rows: Vec<RestoreRow> = records
        .iter()
        .map(|r| RestoreRow {
            id: r.id.to_string(),
            status: r.status.to_string(),
            mode: mode_label(r),
            source: source_label(r),
            documents: r.total_documents_restored,
            started: format_time(&r.started_at),
            restored_by: r.restored_by.clone(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::psql());
    table.to_string()
}

/// Format a single restore's details
pub fn format_restore_details(record: &RestoreRecord) -> String {
    let mut output = String::new();

    output.push_str(&format!("Restore: {}\n", record.id));
    output.push_str(&format!("  Status:      {}\n", record.status));
    output.push_str(&format!("  Type:        {} ({})\n", record.restore_type, mode_label(record)));
    output.push_str(&format!("  Source:      {}\n", source_label(record)));
    output.push_str(&format!(
        "  Restored:    {}\n",
        Collection::join(&record.collections_restored)
    ));
    if !record.collections_skipped.is_empty() {
        output.push_str(&format!(
            "  Skipped:     {}\n",
            Collection::join(&record.collections_skipped)
        ));
    }
    output.push_str(&format!("  Documents:   {}\n", record.total_documents_restored));
    if let Some(safety) = &record.safety_backup_id {
        output.push_str(&format!("  Safety copy: {}\n", safety));
    }
    output.push_str(&format!("  Started:     {}\n", format_time(&record.started_at)));
    if let Some(error) = &record.error_message {
        output.push_str(&format!("  Error:       {}\n", error));
    }

    output
}

/// Format a restore preview
pub fn format_preview(preview: &RestorePreview) -> String {
    let mut output = String::new();
    output.push_str(&format!("Archive size: {}\n\n", format_size(preview.total_size)));

    if preview.collections.is_empty() {
        output.push_str("Nothing to restore.\n");
    } else {
        output.push_str(&format!(
            "{:<18}  {:>10}  {:>10}\n",
            "Collection", "Documents", "Conflicts"
        ));
        output.push_str(&format!("{:-<18}  {:->10}  {:->10}\n", "", "", ""));
        for c in &preview.collections {
            output.push_str(&format!(
                "{:<18}  {:>10}  {:>10}\n",
                c.name.as_str(),
                c.document_count,
                c.estimated_conflicts
            ));
        }
    }

    if !preview.skipped.is_empty() {
        output.push_str(&format!(
            "\nNot in archive: {}\n",
            Collection::join(&preview.skipped)
        ));
    }
    if !preview.ignored_segments.is_empty() {
        output.push_str(&format!(
            "Ignored segments: {}\n",
            preview.ignored_segments.join(", ")
        ));
    }

    output
}
