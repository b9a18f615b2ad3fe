//! Engine wiring
//!
//! Builds the history store, lock and both orchestrators over one base
//! directory and document store.

use std::sync::Arc;

use tracing::debug;

use crate::backup::{BackupOrchestrator, RestoreOrchestrator};
use crate::config::{BackupPaths, Settings};
use crate::error::EngineResult;
use crate::lock::OperationLock;
use crate::storage::{AbandonedRecords, DocumentStore, HistoryStore};

/// Error message given to records whose process died mid-operation
pub const ABANDONED_MESSAGE: &str = "abandoned: the process running this operation stopped before it finished";

/// Everything needed to run backups and restores against one store
pub struct Engine {
    paths: BackupPaths,
    settings: Settings,
    lock: OperationLock,
    history: Arc<HistoryStore>,
    backups: Arc<BackupOrchestrator>,
    restores: RestoreOrchestrator,
}

impl Engine {
    /// Create the directory layout, load history and wire the orchestrators
    ///
    /// Records left unfinished by a dead process are marked failed when no
    /// other operation holds the lock.
    pub fn open(
        paths: BackupPaths,
        settings: Settings,
        store: Arc<dyn DocumentStore>,
    ) -> EngineResult<Self> {
        settings.validate()?;
        paths.ensure_directories()?;

        let history = Arc::new(HistoryStore::open(&paths)?);
        let lock = OperationLock::new(paths.lock_file(), settings.lock_ttl());

        let backups = Arc::new(BackupOrchestrator::new(
            paths.backup_dir(),
            settings.clone(),
            Arc::clone(&history),
            Arc::clone(&store),
            lock.clone(),
        ));
        let restores = RestoreOrchestrator::new(
            Arc::clone(&backups),
            settings.clone(),
            Arc::clone(&history),
            store,
            lock.clone(),
        );

        let engine = Self {
            paths,
            settings,
            lock,
            history,
            backups,
            restores,
        };
        engine.recover_abandoned()?;

        debug!(base_dir = %engine.paths.base_dir().display(), "engine opened");
        Ok(engine)
    }

    /// Fail `creating` backups and `in_progress` restores nobody is running
    ///
    /// Such records only exist while their operation holds the lock, so with
    /// the lock taken here, any left over belong to a process that died.
    /// Does nothing while another operation holds the lock.
    pub fn recover_abandoned(&self) -> EngineResult<AbandonedRecords> {
        let _guard = match self.lock.acquire("recovery") {
            Ok(guard) => guard,
            Err(e) if e.is_conflict() => {
                debug!(error = %e, "operation in progress, skipping recovery");
                return Ok(AbandonedRecords::default());
            }
            Err(e) => return Err(e),
        };
        self.history.fail_abandoned(ABANDONED_MESSAGE)
    }

    pub fn backups(&self) -> &BackupOrchestrator {
        &self.backups
    }

    pub fn restores(&self) -> &RestoreOrchestrator {
        &self.restores
    }

    pub fn paths(&self) -> &BackupPaths {
        &self.paths
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn lock(&self) -> &OperationLock {
        &self.lock
    }
}
