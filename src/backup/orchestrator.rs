//! Backup orchestration
//!
//! Creates archives of whitelisted collections, keeps their history records,
//! and enforces retention.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::archive::{archive_file_name, ArchiveKey, ArchiveWriter, SpooledSegment};
use crate::config::settings::Settings;
use crate::control::OperationControl;
use crate::error::{EngineError, EngineResult};
use crate::lock::OperationLock;
use crate::models::{BackupId, BackupRecord, BackupStatus, BackupType, Collection};
use crate::storage::{DocumentStore, HistoryStore};

/// Documents dumped between deadline checks
const CHECKPOINT_EVERY: usize = 1000;

/// Parameters of [`BackupOrchestrator::create_backup`]
#[derive(Clone, Default)]
pub struct CreateBackupRequest {
    pub backup_type: BackupType,
    /// Collection names; `None` lets the backup type decide
    pub collections: Option<Vec<String>>,
    pub compress: bool,
    pub description: Option<String>,
    pub created_by: String,
    /// Encrypt every document with a key derived from this passphrase
    pub passphrase: Option<Zeroizing<String>>,
    pub timeout: Option<Duration>,
}

impl CreateBackupRequest {
    pub fn new(backup_type: BackupType, created_by: impl Into<String>) -> Self {
        Self {
            backup_type,
            created_by: created_by.into(),
            ..Default::default()
        }
    }

    pub fn with_collections<S: Into<String>>(mut self, collections: impl IntoIterator<Item = S>) -> Self {
        self.collections = Some(collections.into_iter().map(Into::into).collect());
        self
    }

    pub fn compressed(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub backup_id: BackupId,
    pub record: BackupRecord,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupOutcome {
    pub deleted_count: usize,
    /// Kept because a restore record names them as its safety backup
    pub skipped_referenced: usize,
    pub message: String,
}

/// Creates, lists, deletes and expires backups
pub struct BackupOrchestrator {
    backup_dir: PathBuf,
    settings: Settings,
    history: Arc<HistoryStore>,
    store: Arc<dyn DocumentStore>,
    lock: OperationLock,
}

impl BackupOrchestrator {
    pub fn new(
        backup_dir: PathBuf,
        settings: Settings,
        history: Arc<HistoryStore>,
        store: Arc<dyn DocumentStore>,
        lock: OperationLock,
    ) -> Self {
        Self {
            backup_dir,
            settings,
            history,
            store,
            lock,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Dump the requested collections into a new archive
    ///
    /// Validation and lock conflicts fail before a record exists. Any later
    /// failure marks the record failed and is then returned; the partial
    /// archive is left on disk.
    pub fn create_backup(&self, request: CreateBackupRequest) -> EngineResult<BackupOutcome> {
        let collections = request
            .backup_type
            .resolve_collections(request.collections.as_deref())?;
        if request.created_by.trim().is_empty() {
            return Err(EngineError::Validation("created_by must not be empty".into()));
        }

        let key = request
            .passphrase
            .as_deref()
            .map(|p| ArchiveKey::derive(p, self.settings.key_derivation))
            .transpose()?;
        let encrypted = key.is_some();

        let lease = self.lock.acquire("backup")?.keep_alive()?;
        let control = OperationControl::new(request.timeout, None).watching(&lease);

        let id = BackupId::new();
        let started_at = Utc::now();
        let file_path = self.backup_dir.join(archive_file_name(
            request.backup_type,
            id,
            started_at,
            request.compress,
        ));

        let mut record = BackupRecord::creating(
            id,
            file_path.clone(),
            request.backup_type,
            collections.clone(),
            request.created_by,
        );
        record.started_at = started_at;
        record.description = request.description;
        record.compression = request.compress;
        record.encryption = encrypted;
        let filename = record.filename.clone();
        self.history.insert_backup(record)?;

        info!(
            backup_id = %id,
            backup_type = %request.backup_type,
            collections = %Collection::join(&collections),
            "backup started"
        );

        match self.write_archive(&collections, &file_path, request.compress, key, &control) {
            Ok(size) => {
                let record = self.history.complete_backup(id, size)?;
                info!(backup_id = %id, size, "backup completed");
                Ok(BackupOutcome {
                    backup_id: id,
                    message: format!(
                        "Backup created: {} ({} collection(s), {})",
                        filename,
                        collections.len(),
                        format_size(size)
                    ),
                    record,
                })
            }
            Err(e) => {
                warn!(backup_id = %id, error = %e, "backup failed");
                if let Err(history_err) = self.history.fail_backup(id, &e.to_string()) {
                    warn!(backup_id = %id, error = %history_err, "could not record backup failure");
                }
                Err(e)
            }
        }
    }

    /// Dump `collections` in parallel and write the archive to `dest`
    ///
    /// When a collection fails, the ones already dumped are still written
    /// to `dest` so the failed record points at a file worth inspecting.
    fn write_archive(
        &self,
        collections: &[Collection],
        dest: &Path,
        compress: bool,
        key: Option<ArchiveKey>,
        control: &OperationControl,
    ) -> EngineResult<u64> {
        let writer = ArchiveWriter::new(&self.backup_dir, key)?;
        let workers = self.settings.dump_workers().min(collections.len()).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("cms-dump-{}", i))
            .build()
            .map_err(|e| EngineError::Io(format!("Failed to start dump workers: {}", e)))?;

        let results: Vec<EngineResult<SpooledSegment>> = pool.install(|| {
            collections
                .par_iter()
                .enumerate()
                .map(|(index, collection)| {
                    self.dump_collection(&writer, index, *collection, control)
                })
                .collect()
        });

        let mut segments = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(segment) => segments.push(segment),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => writer.finish(&segments, dest, compress),
            Some(e) => {
                match writer.finish(&segments, dest, compress) {
                    Ok(size) => debug!(
                        path = %dest.display(),
                        segments = segments.len(),
                        size,
                        "partial archive kept"
                    ),
                    Err(write_err) => {
                        warn!(path = %dest.display(), error = %write_err, "could not write partial archive")
                    }
                }
                Err(e)
            }
        }
    }

    fn dump_collection(
        &self,
        writer: &ArchiveWriter,
        index: usize,
        collection: Collection,
        control: &OperationControl,
    ) -> EngineResult<SpooledSegment> {
        control.checkpoint()?;
        let mut spool = writer.spool(index, collection.as_str())?;

        for (n, document) in self.store.find_all(collection.as_str())?.enumerate() {
            if n > 0 && n % CHECKPOINT_EVERY == 0 {
                control.checkpoint()?;
            }
            spool.push(&document?)?;
        }

        let segment = spool.finish()?;
        debug!(
            collection = %collection,
            documents = segment.document_count,
            bytes = segment.byte_length,
            "collection dumped"
        );
        Ok(segment)
    }

    /// Most recent backups first, any status
    pub fn get_backup_history(&self, limit: usize) -> EngineResult<Vec<BackupRecord>> {
        self.history.recent_backups(limit)
    }

    pub fn get_backup_by_id(&self, id: BackupId) -> EngineResult<BackupRecord> {
        self.history
            .backup(id)?
            .ok_or_else(|| EngineError::backup_not_found(id.to_string()))
    }

    /// Remove a backup's archive and mark its record deleted
    pub fn delete_backup(&self, id: BackupId) -> EngineResult<DeleteOutcome> {
        let record = self.get_backup_by_id(id)?;
        match record.status {
            BackupStatus::Creating => {
                return Err(EngineError::Validation(format!(
                    "Backup {} is still being created",
                    id
                )))
            }
            BackupStatus::Deleted => {
                return Err(EngineError::Validation(format!(
                    "Backup {} is already deleted",
                    id
                )))
            }
            BackupStatus::Completed | BackupStatus::Failed => {}
        }

        remove_archive(&record.file_path);
        self.history.mark_backup_deleted(id)?;
        info!(backup_id = %id, "backup deleted");

        Ok(DeleteOutcome {
            message: format!("Backup {} deleted", record.filename),
        })
    }

    /// Delete finished backups older than `retention_days`
    pub fn cleanup_old_backups(&self, retention_days: u32) -> EngineResult<CleanupOutcome> {
        if retention_days == 0 {
            return Err(EngineError::Validation(
                "retention_days must be at least 1".into(),
            ));
        }
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));

        let mut outcome = CleanupOutcome::default();
        for record in self.history.finished_backups_before(cutoff)? {
            if self.settings.retain_referenced_safety_backups && self.is_safety_backup(record.id)? {
                debug!(backup_id = %record.id, "keeping backup referenced as safety backup");
                outcome.skipped_referenced += 1;
                continue;
            }

            remove_archive(&record.file_path);
            self.history.mark_backup_deleted(record.id)?;
            outcome.deleted_count += 1;
        }

        outcome.message = format!(
            "Removed {} backup(s) older than {} day(s)",
            outcome.deleted_count, retention_days
        );
        if outcome.skipped_referenced > 0 {
            outcome.message.push_str(&format!(
                "; kept {} referenced safety backup(s)",
                outcome.skipped_referenced
            ));
        }
        info!(
            deleted = outcome.deleted_count,
            kept = outcome.skipped_referenced,
            retention_days,
            "backup cleanup finished"
        );
        Ok(outcome)
    }

    fn is_safety_backup(&self, id: BackupId) -> EngineResult<bool> {
        Ok(self
            .history
            .restores_referencing(id)?
            .iter()
            .any(|r| r.safety_backup_id == Some(id)))
    }
}

/// Best-effort archive removal; a failure is logged, never returned
fn remove_archive(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "archive removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "archive already gone")
        }
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove archive"),
    }
}

/// Format a file size in human-readable form
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveReader;
    use crate::config::paths::BackupPaths;
    use crate::crypto::key_derivation::test_cost;
    use crate::models::{Document, DocumentKey};
    use crate::storage::{DocumentCursor, MemoryStore};
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        history: Arc<HistoryStore>,
        store: Arc<MemoryStore>,
        lock: OperationLock,
        orchestrator: BackupOrchestrator,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let paths = BackupPaths::with_base_dir(temp.path().to_path_buf());
        let mut settings = Settings::default();
        settings.key_derivation = test_cost();

        let history = Arc::new(HistoryStore::open(&paths).unwrap());
        let store = Arc::new(MemoryStore::new());
        let lock = OperationLock::new(paths.lock_file(), settings.lock_ttl());
        let orchestrator = BackupOrchestrator::new(
            paths.backup_dir(),
            settings,
            history.clone(),
            store.clone(),
            lock.clone(),
        );
        Fixture {
            _temp: temp,
            history,
            store,
            lock,
            orchestrator,
        }
    }

    /// Store whose dumps take longer than a short lock TTL
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    impl DocumentStore for SlowStore {
        fn find_all(&self, collection: &str) -> EngineResult<DocumentCursor<'_>> {
            std::thread::sleep(self.delay);
            self.inner.find_all(collection)
        }

        fn find_by_keys(
            &self,
            collection: &str,
            keys: &[DocumentKey],
        ) -> EngineResult<HashMap<DocumentKey, Document>> {
            self.inner.find_by_keys(collection, keys)
        }

        fn insert_many(&self, collection: &str, documents: Vec<Document>) -> EngineResult<u64> {
            self.inner.insert_many(collection, documents)
        }

        fn delete_all(&self, collection: &str) -> EngineResult<u64> {
            self.inner.delete_all(collection)
        }

        fn drop_collection(&self, collection: &str) -> EngineResult<()> {
            self.inner.drop_collection(collection)
        }

        fn count(&self, collection: &str) -> EngineResult<u64> {
            self.inner.count(collection)
        }
    }

    fn seed(store: &MemoryStore, collection: &str, n: usize) {
        let docs = (0..n)
            .map(|i| json!({"_id": format!("{}-{}", collection, i), "n": i}).as_object().cloned().unwrap())
            .collect();
        store.seed(collection, docs).unwrap();
    }

    #[test]
    fn test_full_backup_completes() {
        let f = fixture();
        seed(&f.store, "blogs", 10);
        seed(&f.store, "users", 3);

        let outcome = f
            .orchestrator
            .create_backup(CreateBackupRequest::new(BackupType::Full, "admin"))
            .unwrap();

        let record = outcome.record;
        assert_eq!(record.status, BackupStatus::Completed);
        assert!(record.size > 0);
        assert_eq!(record.collections, Collection::ALL.to_vec());
        assert!(record.completed_at.unwrap() >= record.started_at);
        assert_eq!(fs::metadata(&record.file_path).unwrap().len(), record.size);

        let headers = ArchiveReader::open(&record.file_path, None)
            .unwrap()
            .headers()
            .unwrap();
        assert_eq!(headers.len(), 8);
        assert_eq!(headers[0].name, "blogs");
        assert_eq!(headers[0].document_count, 10);
    }

    #[test]
    fn test_selective_backup_keeps_requested_order() {
        let f = fixture();
        let outcome = f
            .orchestrator
            .create_backup(
                CreateBackupRequest::new(BackupType::Selective, "admin")
                    .with_collections(["users", "blogs", "users"])
                    .compressed(true),
            )
            .unwrap();
        assert_eq!(
            outcome.record.collections,
            vec![Collection::Users, Collection::Blogs]
        );
        assert!(outcome.record.filename.ends_with(".cmsa.gz"));
        assert!(outcome.record.filename.starts_with("backup-selective-"));
    }

    #[test]
    fn test_invalid_request_creates_no_record() {
        let f = fixture();
        let err = f
            .orchestrator
            .create_backup(
                CreateBackupRequest::new(BackupType::Selective, "admin").with_collections(["orders"]),
            )
            .unwrap_err();
        assert!(err.is_validation());

        let err = f
            .orchestrator
            .create_backup(CreateBackupRequest::new(BackupType::Selective, "admin"))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(f.orchestrator.get_backup_history(10).unwrap().is_empty());
    }

    #[test]
    fn test_lock_conflict_creates_no_record() {
        let f = fixture();
        let _held = f.lock.acquire("restore").unwrap();

        let err = f
            .orchestrator
            .create_backup(CreateBackupRequest::new(BackupType::Full, "admin"))
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(f.history.recent_backups(10).unwrap().is_empty());
    }

    #[test]
    fn test_timeout_marks_record_failed() {
        let f = fixture();
        let mut request = CreateBackupRequest::new(BackupType::Full, "admin");
        request.timeout = Some(Duration::ZERO);

        let err = f.orchestrator.create_backup(request).unwrap_err();
        assert!(matches!(err, EngineError::Timeout));

        let records = f.orchestrator.get_backup_history(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BackupStatus::Failed);
        assert_eq!(records[0].error_message.as_deref(), Some("timeout"));
        assert!(records[0].file_path.is_file());
        let reader = ArchiveReader::open(&records[0].file_path, None).unwrap();
        assert!(reader.headers().unwrap().is_empty());
        // lock is free again
        assert!(f.lock.holder().unwrap().is_none());
    }

    #[test]
    fn test_lock_stays_held_through_slow_dump() {
        let temp = TempDir::new().unwrap();
        let paths = BackupPaths::with_base_dir(temp.path().to_path_buf());
        let settings = Settings {
            lock_ttl_secs: 1,
            max_dump_workers: 1,
            ..Settings::default()
        };
        let history = Arc::new(HistoryStore::open(&paths).unwrap());
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(1500),
        });
        let lock = OperationLock::new(paths.lock_file(), settings.lock_ttl());
        let orchestrator =
            BackupOrchestrator::new(paths.backup_dir(), settings, history, store, lock.clone());

        std::thread::scope(|s| {
            let backup = s.spawn(|| {
                orchestrator.create_backup(
                    CreateBackupRequest::new(BackupType::Selective, "admin")
                        .with_collections(["blogs", "users"]),
                )
            });

            std::thread::sleep(Duration::from_millis(2200));
            assert!(lock.acquire("restore").unwrap_err().is_conflict());

            let outcome = backup.join().unwrap().unwrap();
            assert_eq!(outcome.record.status, BackupStatus::Completed);
        });
        assert!(lock.holder().unwrap().is_none());
    }

    #[test]
    fn test_encrypted_backup_records_flag() {
        let f = fixture();
        seed(&f.store, "scripts", 2);
        let mut request = CreateBackupRequest::new(BackupType::Selective, "admin")
            .with_collections(["scripts"]);
        request.passphrase = Some(Zeroizing::new("s3cret".to_string()));

        let outcome = f.orchestrator.create_backup(request).unwrap();
        assert!(outcome.record.encryption);
        let reader = ArchiveReader::open(&outcome.record.file_path, Some("s3cret")).unwrap();
        assert!(reader.is_encrypted());
    }

    #[test]
    fn test_delete_backup() {
        let f = fixture();
        let outcome = f
            .orchestrator
            .create_backup(CreateBackupRequest::new(BackupType::Full, "admin"))
            .unwrap();
        let id = outcome.backup_id;

        f.orchestrator.delete_backup(id).unwrap();
        let record = f.orchestrator.get_backup_by_id(id).unwrap();
        assert_eq!(record.status, BackupStatus::Deleted);
        assert!(record.deleted_at.is_some());
        assert!(!record.file_path.exists());

        assert!(f.orchestrator.delete_backup(id).unwrap_err().is_validation());
        assert!(f
            .orchestrator
            .delete_backup(BackupId::new())
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_delete_tolerates_missing_file() {
        let f = fixture();
        let outcome = f
            .orchestrator
            .create_backup(CreateBackupRequest::new(BackupType::Full, "admin"))
            .unwrap();
        fs::remove_file(&outcome.record.file_path).unwrap();

        f.orchestrator.delete_backup(outcome.backup_id).unwrap();
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let f = fixture();
        let old = f
            .orchestrator
            .create_backup(CreateBackupRequest::new(BackupType::Full, "admin"))
            .unwrap();
        let fresh = f
            .orchestrator
            .create_backup(CreateBackupRequest::new(BackupType::Full, "admin"))
            .unwrap();
        f.history
            .backdate_backup(old.backup_id, Utc::now() - chrono::Duration::days(45))
            .unwrap();

        let first = f.orchestrator.cleanup_old_backups(30).unwrap();
        assert_eq!(first.deleted_count, 1);
        assert!(!old.record.file_path.exists());
        assert!(fresh.record.file_path.exists());

        let second = f.orchestrator.cleanup_old_backups(30).unwrap();
        assert_eq!(second.deleted_count, 0);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }
}
