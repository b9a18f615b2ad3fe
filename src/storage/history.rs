//! History store for backup and restore records
//!
//! The history files `history/backups.json` and `history/restores.json` are
//! the source of truth and may be shared by several processes. Queries read
//! the current file. Mutations hold a lease on `history/history.lock`,
//! re-read the file, apply the change and rewrite it atomically, so one
//! process never overwrites another's records. Mutations are crate-private
//! so only the orchestrators drive a record through its lifecycle, and each
//! one is checked against the status transition rules.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::file_io::{read_json, write_json_atomic};
use crate::config::paths::BackupPaths;
use crate::error::{EngineError, EngineResult};
use crate::lock::{OperationGuard, OperationLock};
use crate::models::{BackupId, BackupRecord, BackupStatus, RestoreId, RestoreRecord, RestoreStatus};

/// Lease length of the history file lock; writers hold it for one rewrite
const HISTORY_LOCK_TTL: Duration = Duration::from_secs(30);
const HISTORY_LOCK_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BackupHistoryData {
    backups: Vec<BackupRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RestoreHistoryData {
    restores: Vec<RestoreRecord>,
}

type Backups = HashMap<BackupId, BackupRecord>;
type Restores = HashMap<RestoreId, RestoreRecord>;

/// Records finalized by [`HistoryStore::fail_abandoned`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbandonedRecords {
    pub backups: Vec<BackupId>,
    pub restores: Vec<RestoreId>,
}

impl AbandonedRecords {
    pub fn is_empty(&self) -> bool {
        self.backups.is_empty() && self.restores.is_empty()
    }
}

/// Persistence for backup and restore history
pub struct HistoryStore {
    backups_path: PathBuf,
    restores_path: PathBuf,
    file_lock: OperationLock,
}

fn newest_first<T>(mut records: Vec<T>, started_at: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    records.sort_by(|a, b| started_at(b).cmp(&started_at(a)));
    records
}

fn read_backups(path: &Path) -> EngineResult<Backups> {
    let data: BackupHistoryData = read_json(path)?;
    Ok(data.backups.into_iter().map(|r| (r.id, r)).collect())
}

fn read_restores(path: &Path) -> EngineResult<Restores> {
    let data: RestoreHistoryData = read_json(path)?;
    Ok(data.restores.into_iter().map(|r| (r.id, r)).collect())
}

fn write_backups(path: &Path, data: &Backups) -> EngineResult<()> {
    let file_data = BackupHistoryData {
        backups: newest_first(data.values().cloned().collect(), |r| r.started_at),
    };
    write_json_atomic(path, &file_data)
}

fn write_restores(path: &Path, data: &Restores) -> EngineResult<()> {
    let file_data = RestoreHistoryData {
        restores: newest_first(data.values().cloned().collect(), |r| r.started_at),
    };
    write_json_atomic(path, &file_data)
}

impl HistoryStore {
    /// Create a store over the given files; the lock file sits beside them
    pub fn new(backups_path: PathBuf, restores_path: PathBuf) -> Self {
        let file_lock = OperationLock::new(
            backups_path.with_file_name("history.lock"),
            HISTORY_LOCK_TTL,
        );
        Self {
            backups_path,
            restores_path,
            file_lock,
        }
    }

    /// Create a store at the standard history location and check it parses
    pub fn open(paths: &BackupPaths) -> EngineResult<Self> {
        let store = Self::new(paths.backup_history_file(), paths.restore_history_file());
        store.load()?;
        Ok(store)
    }

    /// Read both history files, failing if either is corrupt
    pub fn load(&self) -> EngineResult<()> {
        read_backups(&self.backups_path)?;
        read_restores(&self.restores_path)?;
        Ok(())
    }

    fn lock_files(&self) -> EngineResult<OperationGuard> {
        self.file_lock
            .acquire_wait("history", HISTORY_LOCK_WAIT)
            .map_err(|e| match e {
                EngineError::Conflict(reason) => EngineError::Storage(format!(
                    "Timed out waiting for the history lock: {}",
                    reason
                )),
                other => other,
            })
    }

    /// Locked read-modify-write of the backup history
    ///
    /// Nothing is written when `change` fails.
    fn update_backups<T>(
        &self,
        change: impl FnOnce(&mut Backups) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let _guard = self.lock_files()?;
        let mut data = read_backups(&self.backups_path)?;
        let out = change(&mut data)?;
        write_backups(&self.backups_path, &data)?;
        Ok(out)
    }

    fn update_restores<T>(
        &self,
        change: impl FnOnce(&mut Restores) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let _guard = self.lock_files()?;
        let mut data = read_restores(&self.restores_path)?;
        let out = change(&mut data)?;
        write_restores(&self.restores_path, &data)?;
        Ok(out)
    }

    // ----------------------------------------------------------------------
    // Backup queries
    // ----------------------------------------------------------------------

    pub fn backup(&self, id: BackupId) -> EngineResult<Option<BackupRecord>> {
        Ok(read_backups(&self.backups_path)?.remove(&id))
    }

    /// Most recent backups first, any status
    pub fn recent_backups(&self, limit: usize) -> EngineResult<Vec<BackupRecord>> {
        self.backups_where(limit, |_| true)
    }

    pub fn backups_by_status(&self, status: BackupStatus) -> EngineResult<Vec<BackupRecord>> {
        self.backups_where(usize::MAX, |r| r.status == status)
    }

    pub fn backups_by_creator(&self, created_by: &str) -> EngineResult<Vec<BackupRecord>> {
        self.backups_where(usize::MAX, |r| r.created_by == created_by)
    }

    /// Finished (completed or failed) backups created before `cutoff`
    pub fn finished_backups_before(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<BackupRecord>> {
        self.backups_where(usize::MAX, |r| {
            r.started_at < cutoff
                && matches!(r.status, BackupStatus::Completed | BackupStatus::Failed)
        })
    }

    fn backups_where(
        &self,
        limit: usize,
        filter: impl Fn(&BackupRecord) -> bool,
    ) -> EngineResult<Vec<BackupRecord>> {
        let matching = read_backups(&self.backups_path)?
            .into_values()
            .filter(|r| filter(r))
            .collect();
        let mut records = newest_first(matching, |r| r.started_at);
        records.truncate(limit);
        Ok(records)
    }

    // ----------------------------------------------------------------------
    // Restore queries
    // ----------------------------------------------------------------------

    pub fn restore(&self, id: RestoreId) -> EngineResult<Option<RestoreRecord>> {
        Ok(read_restores(&self.restores_path)?.remove(&id))
    }

    pub fn recent_restores(&self, limit: usize) -> EngineResult<Vec<RestoreRecord>> {
        self.restores_where(limit, |_| true)
    }

    pub fn restores_by_status(&self, status: RestoreStatus) -> EngineResult<Vec<RestoreRecord>> {
        self.restores_where(usize::MAX, |r| r.status == status)
    }

    pub fn restores_by_creator(&self, restored_by: &str) -> EngineResult<Vec<RestoreRecord>> {
        self.restores_where(usize::MAX, |r| r.restored_by == restored_by)
    }

    /// Restore records that name this backup as source or safety snapshot
    pub fn restores_referencing(&self, backup_id: BackupId) -> EngineResult<Vec<RestoreRecord>> {
        self.restores_where(usize::MAX, |r| r.references(backup_id))
    }

    fn restores_where(
        &self,
        limit: usize,
        filter: impl Fn(&RestoreRecord) -> bool,
    ) -> EngineResult<Vec<RestoreRecord>> {
        let matching = read_restores(&self.restores_path)?
            .into_values()
            .filter(|r| filter(r))
            .collect();
        let mut records = newest_first(matching, |r| r.started_at);
        records.truncate(limit);
        Ok(records)
    }

    // ----------------------------------------------------------------------
    // Backup mutations
    // ----------------------------------------------------------------------

    pub(crate) fn insert_backup(&self, record: BackupRecord) -> EngineResult<()> {
        self.update_backups(|data| {
            if data.contains_key(&record.id) {
                return Err(EngineError::Storage(format!(
                    "Backup record {} already exists",
                    record.id
                )));
            }
            data.insert(record.id, record);
            Ok(())
        })
    }

    /// Move a backup to `next`, applying `change`, and persist
    pub(crate) fn transition_backup(
        &self,
        id: BackupId,
        next: BackupStatus,
        change: impl FnOnce(&mut BackupRecord),
    ) -> EngineResult<BackupRecord> {
        self.update_backups(|data| {
            let record = data
                .get_mut(&id)
                .ok_or_else(|| EngineError::backup_not_found(id.to_string()))?;

            if !record.status.can_transition_to(next) {
                return Err(EngineError::Validation(format!(
                    "Backup {} cannot move from {} to {}",
                    id, record.status, next
                )));
            }

            record.status = next;
            change(record);
            Ok(record.clone())
        })
    }

    pub(crate) fn complete_backup(&self, id: BackupId, size: u64) -> EngineResult<BackupRecord> {
        self.transition_backup(id, BackupStatus::Completed, |r| {
            r.size = size;
            r.completed_at = Some(Utc::now());
        })
    }

    pub(crate) fn fail_backup(&self, id: BackupId, message: &str) -> EngineResult<BackupRecord> {
        self.transition_backup(id, BackupStatus::Failed, |r| {
            r.error_message = Some(message.to_string());
            r.completed_at = Some(Utc::now());
        })
    }

    pub(crate) fn mark_backup_deleted(&self, id: BackupId) -> EngineResult<BackupRecord> {
        self.transition_backup(id, BackupStatus::Deleted, |r| {
            r.deleted_at = Some(Utc::now());
        })
    }

    // ----------------------------------------------------------------------
    // Restore mutations
    // ----------------------------------------------------------------------

    pub(crate) fn insert_restore(&self, record: RestoreRecord) -> EngineResult<()> {
        self.update_restores(|data| {
            if data.contains_key(&record.id) {
                return Err(EngineError::Storage(format!(
                    "Restore record {} already exists",
                    record.id
                )));
            }
            data.insert(record.id, record);
            Ok(())
        })
    }

    /// Move an in-progress restore to a terminal status, applying `change`
    pub(crate) fn finish_restore(
        &self,
        id: RestoreId,
        status: RestoreStatus,
        change: impl FnOnce(&mut RestoreRecord),
    ) -> EngineResult<RestoreRecord> {
        self.update_restores(|data| {
            let record = data
                .get_mut(&id)
                .ok_or_else(|| EngineError::restore_not_found(id.to_string()))?;

            if !record.status.can_transition_to(status) {
                return Err(EngineError::Validation(format!(
                    "Restore {} cannot move from {} to {}",
                    id, record.status, status
                )));
            }

            record.status = status;
            record.completed_at = Some(Utc::now());
            change(record);
            Ok(record.clone())
        })
    }

    /// Drop terminal restore records created before `cutoff`
    pub(crate) fn remove_finished_restores_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EngineResult<Vec<RestoreId>> {
        self.update_restores(|data| {
            let expired: Vec<RestoreId> = data
                .values()
                .filter(|r| r.status.is_terminal() && r.started_at < cutoff)
                .map(|r| r.id)
                .collect();
            for id in &expired {
                data.remove(id);
            }
            Ok(expired)
        })
    }

    // ----------------------------------------------------------------------
    // Recovery
    // ----------------------------------------------------------------------

    /// Mark every `creating` backup and `in_progress` restore failed
    ///
    /// Only sound while the caller holds the operation lock: records in
    /// those states then belong to a process that died mid-operation.
    pub(crate) fn fail_abandoned(&self, message: &str) -> EngineResult<AbandonedRecords> {
        let now = Utc::now();
        let backups = self.update_backups(|data| {
            let mut ids = Vec::new();
            for record in data.values_mut() {
                if record.status == BackupStatus::Creating {
                    record.status = BackupStatus::Failed;
                    record.error_message = Some(message.to_string());
                    record.completed_at = Some(now);
                    ids.push(record.id);
                }
            }
            Ok(ids)
        })?;
        let restores = self.update_restores(|data| {
            let mut ids = Vec::new();
            for record in data.values_mut() {
                if record.status == RestoreStatus::InProgress {
                    record.status = RestoreStatus::Failed;
                    record.error_message = Some(message.to_string());
                    record.completed_at = Some(now);
                    ids.push(record.id);
                }
            }
            Ok(ids)
        })?;

        let abandoned = AbandonedRecords { backups, restores };
        if !abandoned.is_empty() {
            warn!(
                backups = abandoned.backups.len(),
                restores = abandoned.restores.len(),
                "marked abandoned operations failed"
            );
        }
        Ok(abandoned)
    }

    /// Test hook: rewrite a record's creation time
    #[cfg(test)]
    pub(crate) fn backdate_backup(&self, id: BackupId, started_at: DateTime<Utc>) -> EngineResult<()> {
        self.update_backups(|data| {
            if let Some(record) = data.get_mut(&id) {
                record.started_at = started_at;
            }
            Ok(())
        })
    }

    #[cfg(test)]
    pub(crate) fn backdate_restore(&self, id: RestoreId, started_at: DateTime<Utc>) -> EngineResult<()> {
        self.update_restores(|data| {
            if let Some(record) = data.get_mut(&id) {
                record.started_at = started_at;
            }
            Ok(())
        })
    }
}
