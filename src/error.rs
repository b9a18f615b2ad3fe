//! Error types for the backup engine
//!
//! All fallible operations return [`EngineResult`]. Variants carry a plain
//! message so they can be copied verbatim into a history record's
//! `error_message`.

use thiserror::Error;

/// The main error type for backup and restore operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(String),

    /// Invalid input: unknown collection, missing option, illegal transition
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity not found errors
    #[error("{entity_type} not found: {identifier}")]
    NotFound {
        entity_type: &'static str,
        identifier: String,
    },

    /// Another backup or restore holds the operation lock
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Document store or history persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed, truncated or unsupported archive file
    #[error("Archive error: {0}")]
    Archive(String),

    /// Encryption errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// The caller-supplied deadline expired
    #[error("timeout")]
    Timeout,

    /// The caller cancelled the operation at a collection boundary
    #[error("Operation cancelled")]
    Cancelled,

    /// Some collections were restored before a later one failed
    #[error(
        "Partial restore: {} collection(s) applied ({}) before '{failed_collection}' failed: {reason}",
        .restored.len(),
        .restored.join(", ")
    )]
    PartialFailure {
        restored: Vec<String>,
        failed_collection: String,
        reason: String,
    },
}

impl EngineError {
    /// Create a "not found" error for backups
    pub fn backup_not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: "Backup",
            identifier: identifier.into(),
        }
    }

    /// Create a "not found" error for restore records
    pub fn restore_not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: "Restore",
            identifier: identifier.into(),
        }
    }

    /// Create a "not found" error for archive files on disk
    pub fn file_not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: "Backup file",
            identifier: identifier.into(),
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Check if this is a lock conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Errors that are surfaced before any history record is written
    pub fn is_precondition(&self) -> bool {
        self.is_validation() || self.is_conflict() || self.is_not_found()
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::Config("test error".into());
        assert_eq!(err.to_string(), "Configuration error: test error");
    }

    #[test]
    fn test_not_found_error() {
        let err = EngineError::backup_not_found("bak-1234");
        assert_eq!(err.to_string(), "Backup not found: bak-1234");
        assert!(err.is_not_found());
        assert!(err.is_precondition());
    }

    #[test]
    fn test_timeout_message_is_bare() {
        assert_eq!(EngineError::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_partial_failure_display() {
        let err = EngineError::PartialFailure {
            restored: vec!["blogs".into(), "users".into()],
            failed_collection: "media".into(),
            reason: "disk full".into(),
        };
        assert_eq!(
            err.to_string(),
            "Partial restore: 2 collection(s) applied (blogs, users) before 'media' failed: disk full"
        );
        assert!(!err.is_precondition());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
