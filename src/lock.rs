//! Global operation lock
//!
//! At most one backup or restore runs at a time. A lease is written to a
//! private temp file and hard-linked onto the lock path, so the lock file
//! only ever appears with complete contents and a second acquirer's link
//! fails. A lease carries an expiry; a holder that dies without releasing
//! stops blocking others once the lease runs out. Long operations keep
//! their lease fresh through a [`LeaseKeeper`].

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::storage::write_json_atomic;

const ACQUIRE_ATTEMPTS: usize = 3;
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Contents of the lease file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: Uuid,
    /// What the holder is doing, e.g. `backup` or `restore`
    pub operation: String,
    pub holder_pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// What sits at the lock path right now
enum LockState {
    Vacant,
    Held(Lease),
    /// Contents that do not parse, with the file's modification time
    Unreadable { reason: String, modified: SystemTime },
}

/// Lease-based mutex shared by every engine pointing at the same directory
#[derive(Debug, Clone)]
pub struct OperationLock {
    path: PathBuf,
    ttl: Duration,
}

impl OperationLock {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take the lock for `operation`
    ///
    /// Fails with `Conflict` while another holder's lease is live. An
    /// expired lease is taken over. An unreadable lock file counts as live
    /// until it is older than the TTL.
    pub fn acquire(&self, operation: &str) -> EngineResult<OperationGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..ACQUIRE_ATTEMPTS {
            let lease = self.new_lease(operation);
            if self.publish(&lease)? {
                debug!(operation, token = %lease.token, "operation lock acquired");
                return Ok(OperationGuard {
                    path: self.path.clone(),
                    ttl: self.ttl,
                    lease,
                    released: false,
                });
            }
            self.take_over_if_stale()?;
        }

        Err(EngineError::Conflict(
            "Another operation acquired the lock first".into(),
        ))
    }

    /// Like [`acquire`](Self::acquire), but keep retrying a live lease for up to `wait`
    pub fn acquire_wait(&self, operation: &str, wait: Duration) -> EngineResult<OperationGuard> {
        let deadline = Instant::now() + wait;
        loop {
            match self.acquire(operation) {
                Err(e) if e.is_conflict() && Instant::now() < deadline => {
                    std::thread::sleep(WAIT_POLL)
                }
                other => return other,
            }
        }
    }

    /// The current live lease, if any
    pub fn holder(&self) -> EngineResult<Option<Lease>> {
        match read_state(&self.path)? {
            LockState::Held(lease) if !lease.is_expired(Utc::now()) => Ok(Some(lease)),
            _ => Ok(None),
        }
    }

    fn new_lease(&self, operation: &str) -> Lease {
        let now = Utc::now();
        Lease {
            token: Uuid::new_v4(),
            operation: operation.to_string(),
            holder_pid: std::process::id(),
            acquired_at: now,
            expires_at: now + ttl_delta(self.ttl),
        }
    }

    /// Link a fully written lease onto the lock path; `false` if one is there
    fn publish(&self, lease: &Lease) -> EngineResult<bool> {
        let staged = self.sibling(&format!("acquire-{}", lease.token.simple()));
        let result = write_staged(&staged, lease).and_then(|()| {
            match fs::hard_link(&staged, &self.path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(EngineError::Io(format!(
                    "Failed to create lock file {}: {}",
                    self.path.display(),
                    e
                ))),
            }
        });
        let _ = fs::remove_file(&staged);
        result
    }

    fn take_over_if_stale(&self) -> EngineResult<()> {
        match read_state(&self.path)? {
            // Released between our link attempt and this read
            LockState::Vacant => Ok(()),
            LockState::Held(lease) if !lease.is_expired(Utc::now()) => {
                Err(conflict_with(&lease))
            }
            LockState::Held(lease) => {
                warn!(
                    operation = %lease.operation,
                    holder_pid = lease.holder_pid,
                    expired_at = %lease.expires_at,
                    "taking over expired operation lock"
                );
                self.evict(Some(lease.token))
            }
            LockState::Unreadable { reason, modified } => {
                let age = SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO);
                if age < self.ttl {
                    return Err(EngineError::Conflict(format!(
                        "Operation lock file {} is unreadable ({}) and too recent to take over",
                        self.path.display(),
                        reason
                    )));
                }
                warn!(path = %self.path.display(), %reason, "taking over unreadable operation lock");
                self.evict(None)
            }
        }
    }

    /// Move the stale lock file aside, putting it back if it changed under us
    ///
    /// `expected` is the token of the stale lease, `None` for an unreadable
    /// file. A rename is atomic, so exactly one contender evicts a given file.
    fn evict(&self, expected: Option<Uuid>) -> EngineResult<()> {
        let aside = self.sibling(&format!("stale-{}", Uuid::new_v4().simple()));
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(EngineError::Io(format!(
                    "Failed to move stale lock file {}: {}",
                    self.path.display(),
                    e
                )))
            }
        }

        let moved = read_state(&aside)?;
        let result = match (&moved, expected) {
            (LockState::Held(lease), Some(token)) if lease.token == token => Ok(()),
            (LockState::Unreadable { .. }, None) => Ok(()),
            (LockState::Held(lease), _) if !lease.is_expired(Utc::now()) => {
                // Someone else's fresh lease; hand it back
                match fs::hard_link(&aside, &self.path) {
                    Ok(()) => Err(conflict_with(lease)),
                    Err(e) => {
                        warn!(error = %e, "could not reinstate a lease moved during takeover");
                        Err(conflict_with(lease))
                    }
                }
            }
            _ => Ok(()),
        };
        remove_if_present(&aside)?;
        result
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "operation.lock".to_string());
        self.path.with_file_name(format!(".{}.{}", name, suffix))
    }
}

fn conflict_with(lease: &Lease) -> EngineError {
    EngineError::Conflict(format!(
        "A {} operation is already running (pid {}, started {})",
        lease.operation,
        lease.holder_pid,
        lease.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
    ))
}

fn ttl_delta(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn write_staged(path: &Path, lease: &Lease) -> EngineResult<()> {
    let bytes = serde_json::to_vec_pretty(lease)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| EngineError::Io(format!("Failed to stage lease {}: {}", path.display(), e)))?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

fn read_state(path: &Path) -> EngineResult<LockState> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockState::Vacant),
        Err(e) => {
            return Err(EngineError::Io(format!(
                "Failed to read lock file {}: {}",
                path.display(),
                e
            )))
        }
    };
    match serde_json::from_slice::<Lease>(&bytes) {
        Ok(lease) => Ok(LockState::Held(lease)),
        Err(e) => {
            let modified = match fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LockState::Vacant),
                Err(_) => SystemTime::now(),
            };
            Ok(LockState::Unreadable {
                reason: e.to_string(),
                modified,
            })
        }
    }
}

fn remove_if_present(path: &Path) -> EngineResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::Io(format!(
            "Failed to remove lock file {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct OperationGuard {
    path: PathBuf,
    ttl: Duration,
    lease: Lease,
    released: bool,
}

impl OperationGuard {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Extend the lease by another TTL from now
    ///
    /// Fails with `Conflict` if the lease was taken over in the meantime.
    pub fn renew(&mut self) -> EngineResult<()> {
        self.ensure_owned()?;
        let mut lease = self.lease.clone();
        lease.expires_at = Utc::now() + ttl_delta(self.ttl);
        write_json_atomic(&self.path, &lease)?;
        self.lease = lease;
        Ok(())
    }

    /// Renew the lease in the background until the keeper drops
    pub fn keep_alive(self) -> EngineResult<LeaseKeeper> {
        LeaseKeeper::start(self)
    }

    /// Release now instead of at end of scope
    pub fn release(mut self) -> EngineResult<()> {
        self.release_inner()
    }

    fn ensure_owned(&self) -> EngineResult<()> {
        match read_state(&self.path)? {
            LockState::Held(current) if current.token == self.lease.token => Ok(()),
            _ => Err(EngineError::Conflict(format!(
                "Operation lock for {} was lost to another holder",
                self.lease.operation
            ))),
        }
    }

    fn release_inner(&mut self) -> EngineResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Never remove a lease that now belongs to someone else
        match read_state(&self.path)? {
            LockState::Held(current) if current.token == self.lease.token => {
                remove_if_present(&self.path)?;
                debug!(operation = %self.lease.operation, "operation lock released");
            }
            _ => warn!(
                operation = %self.lease.operation,
                "operation lock was taken over before release"
            ),
        }
        Ok(())
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(error = %e, "failed to release operation lock");
        }
    }
}

/// Owns a guard and renews it every third of the TTL on a background thread
///
/// If a renewal fails the lease is flagged lost; [`check`](Self::check) and
/// every [`OperationControl`](crate::control::OperationControl) watching the
/// flag then fail with `Conflict`. Dropping the keeper stops the thread and
/// releases the lock.
#[derive(Debug)]
pub struct LeaseKeeper {
    guard: Arc<Mutex<OperationGuard>>,
    lost: Arc<AtomicBool>,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl LeaseKeeper {
    fn start(guard: OperationGuard) -> EngineResult<Self> {
        let interval = (guard.ttl / 3).max(Duration::from_millis(20));
        let operation = guard.lease.operation.clone();
        let guard = Arc::new(Mutex::new(guard));
        let lost = Arc::new(AtomicBool::new(false));
        let (stop, stopped) = mpsc::channel::<()>();

        let thread = {
            let guard = Arc::clone(&guard);
            let lost = Arc::clone(&lost);
            std::thread::Builder::new()
                .name(format!("cms-lease-{}", operation))
                .spawn(move || loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let renewed = guard
                                .lock()
                                .map_err(|e| EngineError::Io(format!("Lease guard poisoned: {}", e)))
                                .and_then(|mut g| g.renew());
                            if let Err(e) = renewed {
                                warn!(operation = %operation, error = %e, "operation lock lease lost");
                                lost.store(true, Ordering::SeqCst);
                                return;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                })
                .map_err(|e| EngineError::Io(format!("Failed to start lease renewal: {}", e)))?
        };

        Ok(Self {
            guard,
            lost,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    /// Shared flag that flips once the lease could not be renewed
    pub fn lost_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.lost)
    }

    /// `Conflict` once the lease has been lost
    pub fn check(&self) -> EngineResult<()> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(EngineError::Conflict(
                "Operation lock lease was lost while the operation ran".into(),
            ));
        }
        Ok(())
    }

    pub fn lease(&self) -> EngineResult<Lease> {
        self.guard
            .lock()
            .map(|g| g.lease().clone())
            .map_err(|e| EngineError::Io(format!("Lease guard poisoned: {}", e)))
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("lease renewal thread panicked");
            }
        }
        // The guard is released when the last Arc goes, which is ours
    }
}
