//! cms-backup - Snapshot backup and restore for a CMS document store
//!
//! This library dumps a fixed whitelist of CMS collections into a single
//! archive file and applies such archives back, either replacing or merging
//! into the live collections. Every operation is recorded in a persistent
//! history, and a global lease lock keeps backups and restores from
//! overlapping.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - `archive`: The `.cmsa` archive codec (optionally gzip and AES-GCM)
//! - `backup`: Backup and restore orchestration
//! - `config`: Configuration and path management
//! - `control`: Deadlines and cancellation
//! - `crypto`: Key derivation and document sealing
//! - `lock`: The global operation lock
//! - `models`: History records and collection names
//! - `storage`: Document store adapters and the history store
//! - `cli` / `display`: The `cmsbackup` command line
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cms_backup::config::{BackupPaths, Settings};
//! use cms_backup::storage::JsonDirStore;
//! use cms_backup::Engine;
//!
//! let paths = BackupPaths::new()?;
//! let settings = Settings::load_or_create(&paths)?;
//! let engine = Engine::open(paths.clone(), settings, Arc::new(JsonDirStore::new(paths.data_dir())))?;
//! ```

pub mod archive;
pub mod backup;
pub mod cli;
pub mod config;
pub mod control;
pub mod crypto;
pub mod display;
pub mod engine;
pub mod error;
pub mod lock;
pub mod logging;
pub mod models;
pub mod storage;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};
