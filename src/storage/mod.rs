//! Storage layer
//!
//! Atomic JSON file helpers, the history store, and the document-store seam
//! with its in-memory and JSON-directory implementations.

pub mod documents;
pub mod file_io;
pub mod history;
pub mod json_store;

pub use documents::{DocumentCursor, DocumentStore, MemoryStore};
pub use file_io::{read_json, write_json_atomic};
pub use history::{AbandonedRecords, HistoryStore};
pub use json_store::JsonDirStore;
