//! Cooperative cancellation and deadlines for long operations

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{EngineError, EngineResult};
use crate::lock::LeaseKeeper;

/// Shared flag a caller flips to ask a running operation to stop
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Deadline, cancel token and lock lease checked at operation checkpoints
#[derive(Debug, Clone, Default)]
pub struct OperationControl {
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
    lease_lost: Option<Arc<AtomicBool>>,
}

impl OperationControl {
    pub fn new(timeout: Option<Duration>, cancel: Option<CancelToken>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            cancel,
            lease_lost: None,
        }
    }

    /// Also fail checkpoints once `keeper` loses its lease
    pub fn watching(mut self, keeper: &LeaseKeeper) -> Self {
        self.lease_lost = Some(keeper.lost_flag());
        self
    }

    /// `Cancelled`, `Timeout` or `Conflict` once any of them has tripped
    pub fn checkpoint(&self) -> EngineResult<()> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(EngineError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(EngineError::Timeout);
        }
        if self
            .lease_lost
            .as_ref()
            .is_some_and(|lost| lost.load(Ordering::SeqCst))
        {
            return Err(EngineError::Conflict(
                "Operation lock lease was lost while the operation ran".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_control_never_trips() {
        assert!(OperationControl::default().checkpoint().is_ok());
    }

    #[test]
    fn test_zero_timeout_trips() {
        let control = OperationControl::new(Some(Duration::ZERO), None);
        assert!(matches!(control.checkpoint(), Err(EngineError::Timeout)));
    }

    #[test]
    fn test_lost_lease_trips_checkpoint() {
        let temp = tempfile::TempDir::new().unwrap();
        let lock = crate::lock::OperationLock::new(
            temp.path().join("operation.lock"),
            Duration::from_millis(200),
        );
        let keeper = lock.acquire("backup").unwrap().keep_alive().unwrap();
        let control = OperationControl::default().watching(&keeper);
        assert!(control.checkpoint().is_ok());

        std::fs::remove_file(lock.path()).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(control.checkpoint().unwrap_err().is_conflict());
    }

    #[test]
    fn test_cancel_wins_over_timeout() {
        let token = CancelToken::new();
        let control = OperationControl::new(Some(Duration::ZERO), Some(token.clone()));
        token.cancel();
        assert!(matches!(control.checkpoint(), Err(EngineError::Cancelled)));
    }
}
