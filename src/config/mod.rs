//! Configuration module
//!
//! - Base-directory path resolution
//! - Engine settings persistence

pub mod paths;
pub mod settings;

pub use paths::BackupPaths;
pub use settings::Settings;
