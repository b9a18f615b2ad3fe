//! Restore orchestration
//!
//! Applies an archive to the document store in overwrite or merge mode,
//! optionally after taking a safety backup of what is about to change.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::orchestrator::{BackupOrchestrator, CleanupOutcome, CreateBackupRequest};
use crate::archive::{ArchiveReader, ArchiveStream, SegmentHeader};
use crate::config::settings::Settings;
use crate::control::{CancelToken, OperationControl};
use crate::error::{EngineError, EngineResult};
use crate::lock::OperationLock;
use crate::models::{
    BackupId, BackupRecord, BackupType, Collection, Document, DocumentKey, RestoreId,
    RestoreRecord, RestoreSource, RestoreStatus, RestoreType,
};
use crate::storage::{DocumentStore, HistoryStore};

/// Description given to backups taken right before an overwrite restore
pub const SAFETY_BACKUP_DESCRIPTION: &str = "pre-restore safety backup";

/// Parameters of [`RestoreOrchestrator::restore_from_backup`]
#[derive(Clone)]
pub struct RestoreRequest {
    pub source: RestoreSource,
    /// Collection names; `None` restores everything the archive holds
    pub collections: Option<Vec<String>>,
    /// Replace collection contents instead of merging into them
    pub overwrite: bool,
    /// Take a safety backup before overwriting; `None` uses the settings
    pub safety_backup: Option<bool>,
    pub created_by: String,
    pub description: Option<String>,
    pub passphrase: Option<Zeroizing<String>>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl RestoreRequest {
    pub fn new(source: RestoreSource, created_by: impl Into<String>) -> Self {
        Self {
            source,
            collections: None,
            overwrite: false,
            safety_backup: None,
            created_by: created_by.into(),
            description: None,
            passphrase: None,
            timeout: None,
            cancel: None,
        }
    }

    pub fn with_collections<S: Into<String>>(mut self, collections: impl IntoIterator<Item = S>) -> Self {
        self.collections = Some(collections.into_iter().map(Into::into).collect());
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub restore_id: RestoreId,
    pub record: RestoreRecord,
    pub safety_backup_id: Option<BackupId>,
    pub message: String,
}

/// Parameters of [`RestoreOrchestrator::get_restore_preview`]
#[derive(Clone)]
pub struct PreviewRequest {
    pub source: RestoreSource,
    pub collections: Option<Vec<String>>,
    pub passphrase: Option<Zeroizing<String>>,
}

impl PreviewRequest {
    pub fn new(source: RestoreSource) -> Self {
        Self {
            source,
            collections: None,
            passphrase: None,
        }
    }

    pub fn with_collections<S: Into<String>>(mut self, collections: impl IntoIterator<Item = S>) -> Self {
        self.collections = Some(collections.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionPreview {
    pub name: Collection,
    pub document_count: u64,
    /// Archived documents whose key exists in the store with other content
    pub estimated_conflicts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestorePreview {
    pub collections: Vec<CollectionPreview>,
    /// Requested collections the archive does not contain
    pub skipped: Vec<Collection>,
    /// Segments whose names are not whitelisted collections
    pub ignored_segments: Vec<String>,
    /// Archive size on disk
    pub total_size: u64,
}

/// A restore source checked to be usable
struct ResolvedSource {
    path: PathBuf,
    backup: Option<BackupRecord>,
}

/// Which archive segments a restore will touch
#[derive(Debug, Default)]
struct RestorePlan {
    targets: Vec<Collection>,
    skipped: Vec<Collection>,
    ignored: Vec<String>,
}

impl RestorePlan {
    fn from_headers(headers: &[SegmentHeader], requested: Option<&[Collection]>) -> Self {
        let mut plan = Self::default();
        let mut present = Vec::new();
        for header in headers {
            match Collection::parse(&header.name) {
                Some(c) if !present.contains(&c) => present.push(c),
                Some(_) => {}
                None => plan.ignored.push(header.name.clone()),
            }
        }

        match requested {
            Some(wanted) => {
                plan.targets = present.into_iter().filter(|c| wanted.contains(c)).collect();
                plan.skipped = wanted
                    .iter()
                    .filter(|c| !plan.targets.contains(c))
                    .copied()
                    .collect();
            }
            None => plan.targets = present,
        }
        plan
    }
}

/// What has been applied so far; survives a mid-restore failure
#[derive(Debug, Default)]
struct RestoreProgress {
    plan: RestorePlan,
    restored: Vec<Collection>,
    counts: Vec<(Collection, u64)>,
    total: u64,
    current: Option<Collection>,
}

impl RestoreProgress {
    fn details(&self, archive: &Path) -> serde_json::Value {
        let counts: serde_json::Map<String, serde_json::Value> = self
            .counts
            .iter()
            .map(|(c, n)| (c.to_string(), json!(n)))
            .collect();
        json!({
            "archive": archive.display().to_string(),
            "collections": counts,
            "ignored_segments": self.plan.ignored,
        })
    }
}

/// Restores archives and keeps restore history
pub struct RestoreOrchestrator {
    backups: Arc<BackupOrchestrator>,
    settings: Settings,
    history: Arc<HistoryStore>,
    store: Arc<dyn DocumentStore>,
    lock: OperationLock,
}

impl RestoreOrchestrator {
    pub fn new(
        backups: Arc<BackupOrchestrator>,
        settings: Settings,
        history: Arc<HistoryStore>,
        store: Arc<dyn DocumentStore>,
        lock: OperationLock,
    ) -> Self {
        Self {
            backups,
            settings,
            history,
            store,
            lock,
        }
    }

    /// Back up `collections` as they are now; `None` if that fails
    ///
    /// The failure is logged and the caller carries on without a snapshot.
    pub fn create_pre_restore_backup(
        &self,
        collections: &[Collection],
        created_by: &str,
    ) -> Option<BackupId> {
        let backup_type = if Collection::is_whole_whitelist(collections) {
            BackupType::Full
        } else {
            BackupType::Selective
        };
        let mut request = CreateBackupRequest::new(backup_type, created_by)
            .with_collections(collections.iter().map(|c| c.to_string()))
            .compressed(self.settings.compress_by_default);
        request.description = Some(SAFETY_BACKUP_DESCRIPTION.to_string());

        match self.backups.create_backup(request) {
            Ok(outcome) => {
                info!(backup_id = %outcome.backup_id, "pre-restore safety backup created");
                Some(outcome.backup_id)
            }
            Err(e) => {
                warn!(error = %e, "pre-restore safety backup failed, continuing without one");
                None
            }
        }
    }

    /// Apply an archive to the document store
    ///
    /// Source, validation and lock errors fail before a record exists. A
    /// failure after that is recorded and returned; collections applied
    /// before it stay applied and the error becomes `PartialFailure`.
    pub fn restore_from_backup(&self, request: RestoreRequest) -> EngineResult<RestoreOutcome> {
        let requested = parse_requested(request.collections.as_deref())?;
        if request.created_by.trim().is_empty() {
            return Err(EngineError::Validation("created_by must not be empty".into()));
        }
        let source = self.resolve_source(&request.source)?;

        let take_safety = request.overwrite
            && request
                .safety_backup
                .unwrap_or(self.settings.safety_backup_before_overwrite);
        let safety_backup_id = if take_safety {
            let scope = requested.clone().unwrap_or_else(|| Collection::ALL.to_vec());
            self.create_pre_restore_backup(&scope, &request.created_by)
        } else {
            None
        };

        let lease = self.lock.acquire("restore")?.keep_alive()?;

        let mut record = RestoreRecord::in_progress(
            request.source.source_type(),
            RestoreType::for_request(requested.as_deref()),
            request.overwrite,
            request.created_by.clone(),
        );
        record.source_backup_id = request.source.backup_id();
        record.source_backup_name = source.backup.as_ref().map(|b| b.filename.clone());
        if let RestoreSource::UploadedFile { path } = &request.source {
            record.uploaded_file_name = path.file_name().map(|n| n.to_string_lossy().to_string());
        }
        record.safety_backup_id = safety_backup_id;
        record.description = request.description.clone();
        let restore_id = record.id;
        self.history.insert_restore(record)?;

        info!(
            restore_id = %restore_id,
            archive = %source.path.display(),
            overwrite = request.overwrite,
            "restore started"
        );

        let control =
            OperationControl::new(request.timeout, request.cancel.clone()).watching(&lease);
        let mut progress = RestoreProgress::default();
        let result = self.apply_archive(
            &source.path,
            request.passphrase.as_deref().map(String::as_str),
            requested.as_deref(),
            request.overwrite,
            &control,
            &mut progress,
        );
        let details = progress.details(&source.path);

        match result {
            Ok(()) => {
                let record = self.history.finish_restore(restore_id, RestoreStatus::Completed, |r| {
                    r.collections_restored = progress.restored.clone();
                    r.collections_skipped = progress.plan.skipped.clone();
                    r.total_documents_restored = progress.total;
                    r.details = Some(details);
                })?;
                info!(
                    restore_id = %restore_id,
                    collections = progress.restored.len(),
                    documents = progress.total,
                    "restore completed"
                );
                Ok(RestoreOutcome {
                    restore_id,
                    safety_backup_id,
                    message: format!(
                        "Restored {} document(s) into {} collection(s)",
                        progress.total,
                        progress.restored.len()
                    ),
                    record,
                })
            }
            Err(e) => {
                let status = if matches!(e, EngineError::Cancelled) {
                    RestoreStatus::Cancelled
                } else {
                    RestoreStatus::Failed
                };
                let error = match e {
                    EngineError::Timeout | EngineError::Cancelled => e,
                    e if !progress.restored.is_empty() => EngineError::PartialFailure {
                        restored: progress.restored.iter().map(|c| c.to_string()).collect(),
                        failed_collection: progress
                            .current
                            .map(|c| c.to_string())
                            .unwrap_or_default(),
                        reason: e.to_string(),
                    },
                    e => e,
                };
                warn!(restore_id = %restore_id, %status, error = %error, "restore did not complete");

                let message = error.to_string();
                let finished = self.history.finish_restore(restore_id, status, |r| {
                    r.collections_restored = progress.restored.clone();
                    r.collections_skipped = progress.plan.skipped.clone();
                    r.total_documents_restored = progress.total;
                    r.error_message = Some(message);
                    r.details = Some(details);
                });
                if let Err(history_err) = finished {
                    warn!(restore_id = %restore_id, error = %history_err, "could not record restore failure");
                }
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_archive(
        &self,
        path: &Path,
        passphrase: Option<&str>,
        requested: Option<&[Collection]>,
        overwrite: bool,
        control: &OperationControl,
        progress: &mut RestoreProgress,
    ) -> EngineResult<()> {
        let reader = ArchiveReader::open(path, passphrase)?;
        progress.plan = RestorePlan::from_headers(&reader.headers()?, requested);

        let mut stream = reader.stream()?;
        while let Some(header) = stream.next_segment()? {
            let Some(collection) = Collection::parse(&header.name) else {
                continue;
            };
            if !progress.plan.targets.contains(&collection) || progress.restored.contains(&collection)
            {
                continue;
            }

            control.checkpoint()?;

            progress.current = Some(collection);
            let count = self.apply_collection(&mut stream, collection, overwrite, control)?;
            progress.current = None;

            progress.restored.push(collection);
            progress.counts.push((collection, count));
            progress.total += count;
        }
        Ok(())
    }

    fn apply_collection(
        &self,
        stream: &mut ArchiveStream,
        collection: Collection,
        overwrite: bool,
        control: &OperationControl,
    ) -> EngineResult<u64> {
        let name = collection.as_str();
        if overwrite {
            let removed = self.store.delete_all(name)?;
            debug!(collection = name, removed, "cleared collection for overwrite");
        }

        let batch_size = self.settings.batch_size();
        let mut batch = Vec::with_capacity(batch_size);
        let mut inserted = 0;
        let mut keyless = 0;
        while let Some(document) = stream.next_document()? {
            if !overwrite && DocumentKey::of(&document).is_none() {
                keyless += 1;
                continue;
            }
            batch.push(document);
            if batch.len() >= batch_size {
                control.checkpoint()?;
                inserted += self.insert_batch(name, std::mem::take(&mut batch), overwrite)?;
            }
        }
        if !batch.is_empty() {
            control.checkpoint()?;
            inserted += self.insert_batch(name, batch, overwrite)?;
        }

        if keyless > 0 {
            warn!(collection = name, keyless, "merge skipped documents without a primary key");
        }
        debug!(collection = name, inserted, "collection restored");
        Ok(inserted)
    }

    /// Insert a batch; in merge mode only documents with an unseen key go in
    fn insert_batch(&self, collection: &str, batch: Vec<Document>, overwrite: bool) -> EngineResult<u64> {
        if overwrite {
            return self.store.insert_many(collection, batch);
        }

        let keys: Vec<DocumentKey> = batch.iter().filter_map(DocumentKey::of).collect();
        let existing = self.store.existing_keys(collection, &keys)?;
        let fresh: Vec<Document> = batch
            .into_iter()
            .filter(|doc| DocumentKey::of(doc).is_some_and(|k| !existing.contains(&k)))
            .collect();

        if fresh.is_empty() {
            return Ok(0);
        }
        self.store.insert_many(collection, fresh)
    }

    /// Describe what a restore of this source would do, without doing it
    pub fn get_restore_preview(&self, request: PreviewRequest) -> EngineResult<RestorePreview> {
        let requested = parse_requested(request.collections.as_deref())?;
        let source = self.resolve_source(&request.source)?;
        let total_size = fs::metadata(&source.path)?.len();

        let reader = ArchiveReader::open(
            &source.path,
            request.passphrase.as_deref().map(String::as_str),
        )?;
        let plan = RestorePlan::from_headers(&reader.headers()?, requested.as_deref());

        let mut collections = Vec::new();
        let mut stream = reader.stream()?;
        while let Some(header) = stream.next_segment()? {
            let Some(collection) = Collection::parse(&header.name) else {
                continue;
            };
            if !plan.targets.contains(&collection) || collections.iter().any(|p: &CollectionPreview| p.name == collection) {
                continue;
            }
            collections.push(self.preview_collection(&mut stream, collection)?);
        }

        Ok(RestorePreview {
            collections,
            skipped: plan.skipped,
            ignored_segments: plan.ignored,
            total_size,
        })
    }

    fn preview_collection(
        &self,
        stream: &mut ArchiveStream,
        collection: Collection,
    ) -> EngineResult<CollectionPreview> {
        let batch_size = self.settings.batch_size();
        let mut preview = CollectionPreview {
            name: collection,
            document_count: 0,
            estimated_conflicts: 0,
        };

        let mut batch = Vec::with_capacity(batch_size);
        loop {
            let next = stream.next_document()?;
            let done = next.is_none();
            if let Some(document) = next {
                preview.document_count += 1;
                batch.push(document);
            }
            if batch.len() >= batch_size || (done && !batch.is_empty()) {
                preview.estimated_conflicts +=
                    self.count_conflicts(collection.as_str(), std::mem::take(&mut batch))?;
            }
            if done {
                return Ok(preview);
            }
        }
    }

    fn count_conflicts(&self, collection: &str, batch: Vec<Document>) -> EngineResult<u64> {
        let keyed: Vec<(DocumentKey, Document)> = batch
            .into_iter()
            .filter_map(|doc| DocumentKey::of(&doc).map(|k| (k, doc)))
            .collect();
        if keyed.is_empty() {
            return Ok(0);
        }

        let keys: Vec<DocumentKey> = keyed.iter().map(|(k, _)| k.clone()).collect();
        let current = self.store.find_by_keys(collection, &keys)?;
        Ok(keyed
            .iter()
            .filter(|(key, archived)| current.get(key).is_some_and(|live| live != archived))
            .count() as u64)
    }

    /// Most recent restores first
    pub fn get_restore_history(&self, limit: usize) -> EngineResult<Vec<RestoreRecord>> {
        self.history.recent_restores(limit)
    }

    pub fn get_restore_by_id(&self, id: RestoreId) -> EngineResult<RestoreRecord> {
        self.history
            .restore(id)?
            .ok_or_else(|| EngineError::restore_not_found(id.to_string()))
    }

    /// Drop finished restore records older than `retention_days`
    pub fn cleanup_old_restores(&self, retention_days: u32) -> EngineResult<CleanupOutcome> {
        if retention_days == 0 {
            return Err(EngineError::Validation(
                "retention_days must be at least 1".into(),
            ));
        }
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let removed = self.history.remove_finished_restores_before(cutoff)?;
        info!(removed = removed.len(), retention_days, "restore history cleanup finished");

        Ok(CleanupOutcome {
            deleted_count: removed.len(),
            skipped_referenced: 0,
            message: format!(
                "Removed {} restore record(s) older than {} day(s)",
                removed.len(),
                retention_days
            ),
        })
    }

    fn resolve_source(&self, source: &RestoreSource) -> EngineResult<ResolvedSource> {
        match source {
            RestoreSource::ExistingBackup(id) => {
                let record = self
                    .history
                    .backup(*id)?
                    .ok_or_else(|| EngineError::backup_not_found(id.to_string()))?;
                if !record.is_restorable() {
                    return Err(EngineError::backup_not_found(format!(
                        "{} (status {})",
                        id, record.status
                    )));
                }
                if !record.file_path.is_file() {
                    return Err(EngineError::file_not_found(
                        record.file_path.display().to_string(),
                    ));
                }
                Ok(ResolvedSource {
                    path: record.file_path.clone(),
                    backup: Some(record),
                })
            }
            RestoreSource::UploadedFile { path } => {
                if !path.is_file() {
                    return Err(EngineError::file_not_found(path.display().to_string()));
                }
                Ok(ResolvedSource {
                    path: path.clone(),
                    backup: None,
                })
            }
        }
    }
}

fn parse_requested(names: Option<&[String]>) -> EngineResult<Option<Vec<Collection>>> {
    match names {
        Some(names) if !names.is_empty() => Ok(Some(Collection::parse_list(names)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use crate::config::paths::BackupPaths;
    use crate::models::{BackupStatus, SourceType};
    use crate::storage::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        store: Arc<MemoryStore>,
        lock: OperationLock,
        backups: Arc<BackupOrchestrator>,
        restores: RestoreOrchestrator,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let paths = BackupPaths::with_base_dir(temp.path().to_path_buf());
        let mut settings = Settings::default();
        settings.restore_batch_size = 4;

        let history = Arc::new(HistoryStore::open(&paths).unwrap());
        let store = Arc::new(MemoryStore::new());
        let lock = OperationLock::new(paths.lock_file(), settings.lock_ttl());
        let backups = Arc::new(BackupOrchestrator::new(
            paths.backup_dir(),
            settings.clone(),
            history.clone(),
            store.clone(),
            lock.clone(),
        ));
        let restores = RestoreOrchestrator::new(
            backups.clone(),
            settings,
            history,
            store.clone(),
            lock.clone(),
        );
        Fixture {
            temp,
            store,
            lock,
            backups,
            restores,
        }
    }

    fn doc(id: &str, title: &str) -> Document {
        json!({"_id": id, "title": title}).as_object().cloned().unwrap()
    }

    fn docs(prefix: &str, n: usize) -> Vec<Document> {
        (0..n).map(|i| doc(&format!("{}{}", prefix, i), "v1")).collect()
    }

    fn backup(f: &Fixture, collections: &[&str]) -> BackupId {
        f.backups
            .create_backup(
                CreateBackupRequest::new(BackupType::Selective, "admin")
                    .with_collections(collections.iter().copied()),
            )
            .unwrap()
            .backup_id
    }

    #[test]
    fn test_overwrite_replaces_extra_documents() {
        let f = fixture();
        f.store.seed("blogs", docs("b", 10)).unwrap();
        let id = backup(&f, &["blogs"]);

        f.store.insert_many("blogs", docs("extra", 5)).unwrap();
        assert_eq!(f.store.count("blogs").unwrap(), 15);

        let outcome = f
            .restores
            .restore_from_backup(
                RestoreRequest::new(RestoreSource::ExistingBackup(id), "admin").overwrite(true),
            )
            .unwrap();
        assert_eq!(f.store.count("blogs").unwrap(), 10);
        assert_eq!(outcome.record.status, RestoreStatus::Completed);
        assert_eq!(outcome.record.total_documents_restored, 10);
        assert_eq!(outcome.record.collections_restored, vec![Collection::Blogs]);
        assert!(outcome.safety_backup_id.is_some());
    }

    #[test]
    fn test_merge_is_repeatable() {
        let f = fixture();
        f.store.seed("users", docs("u", 6)).unwrap();
        let id = backup(&f, &["users"]);
        f.store.seed("users", docs("u", 2)).unwrap();

        let request = RestoreRequest::new(RestoreSource::ExistingBackup(id), "admin");
        let first = f.restores.restore_from_backup(request.clone()).unwrap();
        assert_eq!(first.record.total_documents_restored, 4);
        assert_eq!(f.store.count("users").unwrap(), 6);

        let second = f.restores.restore_from_backup(request).unwrap();
        assert_eq!(second.record.total_documents_restored, 0);
        assert_eq!(f.store.count("users").unwrap(), 6);
        assert!(second.safety_backup_id.is_none());
    }

    #[test]
    fn test_merge_skips_documents_without_key() {
        let f = fixture();
        let mut seeded = docs("s", 2);
        seeded.push(json!({"title": "no id"}).as_object().cloned().unwrap());
        f.store.seed("scripts", seeded).unwrap();
        let id = backup(&f, &["scripts"]);

        let request = RestoreRequest::new(RestoreSource::ExistingBackup(id), "admin");
        for _ in 0..2 {
            let outcome = f.restores.restore_from_backup(request.clone()).unwrap();
            assert_eq!(outcome.record.total_documents_restored, 0);
            assert_eq!(f.store.count("scripts").unwrap(), 3);
        }

        // overwrite still brings keyless documents back
        f.restores
            .restore_from_backup(request.overwrite(true))
            .unwrap();
        assert_eq!(f.store.count("scripts").unwrap(), 3);
    }

    #[test]
    fn test_merge_keeps_live_content() {
        let f = fixture();
        f.store.seed("comments", vec![doc("c1", "old")]).unwrap();
        let id = backup(&f, &["comments"]);
        f.store.seed("comments", vec![doc("c1", "edited")]).unwrap();

        f.restores
            .restore_from_backup(RestoreRequest::new(RestoreSource::ExistingBackup(id), "admin"))
            .unwrap();
        assert_eq!(f.store.documents("comments").unwrap(), vec![doc("c1", "edited")]);
    }

    #[test]
    fn test_preview_conflicts_cleared_by_overwrite() {
        let f = fixture();
        f.store.seed("media", docs("m", 9)).unwrap();
        let id = backup(&f, &["media"]);
        f.store
            .seed("media", vec![doc("m0", "changed"), doc("m1", "changed"), doc("m2", "v1")])
            .unwrap();

        let preview = f
            .restores
            .get_restore_preview(PreviewRequest::new(RestoreSource::ExistingBackup(id)))
            .unwrap();
        assert_eq!(
            preview.collections,
            vec![CollectionPreview {
                name: Collection::Media,
                document_count: 9,
                estimated_conflicts: 2,
            }]
        );
        assert!(preview.total_size > 0);

        let mut request = RestoreRequest::new(RestoreSource::ExistingBackup(id), "admin").overwrite(true);
        request.safety_backup = Some(false);
        f.restores.restore_from_backup(request).unwrap();

        let preview = f
            .restores
            .get_restore_preview(PreviewRequest::new(RestoreSource::ExistingBackup(id)))
            .unwrap();
        assert_eq!(preview.collections[0].estimated_conflicts, 0);
    }

    #[test]
    fn test_requested_but_absent_collections_are_skipped() {
        let f = fixture();
        f.store.seed("blogs", docs("b", 2)).unwrap();
        let id = backup(&f, &["blogs"]);

        let outcome = f
            .restores
            .restore_from_backup(
                RestoreRequest::new(RestoreSource::ExistingBackup(id), "admin")
                    .with_collections(["pageseo", "blogs"]),
            )
            .unwrap();
        assert_eq!(outcome.record.restore_type, RestoreType::Selective);
        assert_eq!(outcome.record.collections_restored, vec![Collection::Blogs]);
        assert_eq!(outcome.record.collections_skipped, vec![Collection::PageSeo]);
    }

    #[test]
    fn test_uploaded_file_with_unknown_segment() {
        let f = fixture();
        let path = f.temp.path().join("upload.cmsa");
        ArchiveWriter::new(f.temp.path(), None)
            .unwrap()
            .write_segments(
                &path,
                false,
                vec![
                    ("invoices".to_string(), docs("i", 3)),
                    ("scripts".to_string(), docs("s", 2)),
                ],
            )
            .unwrap();

        let outcome = f
            .restores
            .restore_from_backup(RestoreRequest::new(
                RestoreSource::UploadedFile { path: path.clone() },
                "admin",
            ))
            .unwrap();
        let record = outcome.record;
        assert_eq!(record.source_type, SourceType::UploadedFile);
        assert_eq!(record.uploaded_file_name.as_deref(), Some("upload.cmsa"));
        assert_eq!(record.collections_restored, vec![Collection::Scripts]);
        assert_eq!(f.store.count("invoices").unwrap(), 0);
        let details = record.details.unwrap();
        assert_eq!(details["ignored_segments"], json!(["invoices"]));
        assert_eq!(details["collections"]["scripts"], json!(2));
    }

    #[test]
    fn test_unusable_sources_are_not_found() {
        let f = fixture();
        let err = f
            .restores
            .restore_from_backup(RestoreRequest::new(
                RestoreSource::ExistingBackup(BackupId::new()),
                "admin",
            ))
            .unwrap_err();
        assert!(err.is_not_found());

        let err = f
            .restores
            .restore_from_backup(RestoreRequest::new(
                RestoreSource::UploadedFile {
                    path: f.temp.path().join("missing.cmsa"),
                },
                "admin",
            ))
            .unwrap_err();
        assert!(err.is_not_found());

        let id = backup(&f, &["blogs"]);
        f.backups.delete_backup(id).unwrap();
        let err = f
            .restores
            .restore_from_backup(RestoreRequest::new(RestoreSource::ExistingBackup(id), "admin"))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(f.restores.get_restore_history(10).unwrap().is_empty());
    }

    #[test]
    fn test_lock_conflict_creates_no_record() {
        let f = fixture();
        let id = backup(&f, &["blogs"]);
        let _held = f.lock.acquire("backup").unwrap();

        let err = f
            .restores
            .restore_from_backup(RestoreRequest::new(RestoreSource::ExistingBackup(id), "admin"))
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(f.restores.get_restore_history(10).unwrap().is_empty());
    }

    #[test]
    fn test_safety_backup_failure_is_swallowed() {
        let f = fixture();
        let id = backup(&f, &["blogs"]);
        // The safety backup contends for the lock the test holds
        let held = f.lock.acquire("backup").unwrap();
        assert!(f
            .restores
            .create_pre_restore_backup(&[Collection::Blogs], "admin")
            .is_none());
        drop(held);

        let safety = f
            .restores
            .create_pre_restore_backup(&Collection::ALL, "admin")
            .unwrap();
        let record = f.backups.get_backup_by_id(safety).unwrap();
        assert_eq!(record.backup_type, BackupType::Full);
        assert_eq!(record.description.as_deref(), Some(SAFETY_BACKUP_DESCRIPTION));
        assert_ne!(safety, id);
    }

    #[test]
    fn test_cancelled_restore_is_recorded() {
        let f = fixture();
        let id = backup(&f, &["blogs"]);
        let token = CancelToken::new();
        token.cancel();

        let mut request = RestoreRequest::new(RestoreSource::ExistingBackup(id), "admin");
        request.cancel = Some(token);
        let err = f.restores.restore_from_backup(request).unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));

        let record = &f.restores.get_restore_history(1).unwrap()[0];
        assert_eq!(record.status, RestoreStatus::Cancelled);
        assert!(f.lock.holder().unwrap().is_none());
    }

    #[test]
    fn test_timeout_records_failure() {
        let f = fixture();
        let id = backup(&f, &["blogs"]);
        let mut request = RestoreRequest::new(RestoreSource::ExistingBackup(id), "admin");
        request.timeout = Some(Duration::ZERO);

        let err = f.restores.restore_from_backup(request).unwrap_err();
        assert!(matches!(err, EngineError::Timeout));
        let record = &f.restores.get_restore_history(1).unwrap()[0];
        assert_eq!(record.status, RestoreStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_failure_after_applied_collection_is_partial() {
        let f = fixture();
        let path = f.temp.path().join("dupes.cmsa");
        // users holds a duplicate key, so inserting it fails after blogs
        ArchiveWriter::new(f.temp.path(), None)
            .unwrap()
            .write_segments(
                &path,
                false,
                vec![
                    ("blogs".to_string(), docs("b", 3)),
                    ("users".to_string(), vec![doc("u", "a"), doc("u", "b")]),
                ],
            )
            .unwrap();

        let mut request = RestoreRequest::new(RestoreSource::UploadedFile { path }, "admin").overwrite(true);
        request.safety_backup = Some(false);
        let err = f.restores.restore_from_backup(request).unwrap_err();
        match err {
            EngineError::PartialFailure {
                restored,
                failed_collection,
                ..
            } => {
                assert_eq!(restored, vec!["blogs".to_string()]);
                assert_eq!(failed_collection, "users");
            }
            other => panic!("expected partial failure, got {other:?}"),
        }

        // blogs stays applied
        assert_eq!(f.store.count("blogs").unwrap(), 3);
        let record = &f.restores.get_restore_history(1).unwrap()[0];
        assert_eq!(record.status, RestoreStatus::Failed);
        assert_eq!(record.collections_restored, vec![Collection::Blogs]);
    }

    #[test]
    fn test_referenced_safety_backup_survives_cleanup() {
        let f = fixture();
        f.store.seed("blogs", docs("b", 2)).unwrap();
        let id = backup(&f, &["blogs"]);
        let outcome = f
            .restores
            .restore_from_backup(
                RestoreRequest::new(RestoreSource::ExistingBackup(id), "admin").overwrite(true),
            )
            .unwrap();
        let safety = outcome.safety_backup_id.unwrap();

        for backup_id in [id, safety] {
            f.restores
                .history
                .backdate_backup(backup_id, Utc::now() - chrono::Duration::days(90))
                .unwrap();
        }

        let cleanup = f.backups.cleanup_old_backups(30).unwrap();
        assert_eq!(cleanup.deleted_count, 1);
        assert_eq!(cleanup.skipped_referenced, 1);
        assert_eq!(
            f.backups.get_backup_by_id(safety).unwrap().status,
            BackupStatus::Completed
        );
        assert_eq!(
            f.backups.get_backup_by_id(id).unwrap().status,
            BackupStatus::Deleted
        );
    }

    #[test]
    fn test_cleanup_old_restores() {
        let f = fixture();
        let id = backup(&f, &["blogs"]);
        let outcome = f
            .restores
            .restore_from_backup(RestoreRequest::new(RestoreSource::ExistingBackup(id), "admin"))
            .unwrap();
        f.restores
            .history
            .backdate_restore(outcome.restore_id, Utc::now() - chrono::Duration::days(60))
            .unwrap();

        let cleanup = f.restores.cleanup_old_restores(30).unwrap();
        assert_eq!(cleanup.deleted_count, 1);
        assert!(f
            .restores
            .get_restore_by_id(outcome.restore_id)
            .unwrap_err()
            .is_not_found());
    }
}
