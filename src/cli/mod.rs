//! CLI command handlers
//!
//! Bridges the clap argument parsing with the orchestrators.

pub mod backup;
pub mod passphrase;
pub mod restore;

pub use backup::{handle_backup_command, BackupCommands};
pub use restore::{handle_restore_command, RestoreCommands};

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::models::{BackupId, BackupStatus};

/// Resolve a backup argument: a backup id or `latest`
pub(crate) fn resolve_backup_id(engine: &Engine, backup: &str) -> EngineResult<BackupId> {
    if backup.eq_ignore_ascii_case("latest") {
        return engine
            .backups()
            .get_backup_history(usize::MAX)?
            .into_iter()
            .find(|r| r.status == BackupStatus::Completed)
            .map(|r| r.id)
            .ok_or_else(|| EngineError::backup_not_found("latest"));
    }

    backup
        .parse()
        .map_err(|_| EngineError::Validation(format!("'{}' is not a backup id", backup)))
}

/// Split a comma-separated `-c` value list
pub(crate) fn split_collections(values: &[String]) -> Option<Vec<String>> {
    let names: Vec<String> = values
        .iter()
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    (!names.is_empty()).then_some(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_collections() {
        let values = vec!["blogs, users".to_string(), "media".to_string()];
        assert_eq!(
            split_collections(&values),
            Some(vec!["blogs".into(), "users".into(), "media".into()])
        );
        assert_eq!(split_collections(&[]), None);
        assert_eq!(split_collections(&[" , ".to_string()]), None);
    }
}
