//! JSON-file document store
//!
//! Each collection lives in `<dir>/<collection>.json`. This is the store the
//! CLI operates on; it keeps the engine usable without a database driver.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::documents::{CollectionData, DocumentCursor, DocumentStore};
use super::file_io::{read_json, write_json_atomic};
use crate::error::{EngineError, EngineResult};
use crate::models::{Document, DocumentKey};

/// On-disk shape of one collection file
#[derive(Debug, Default, Serialize, Deserialize)]
struct CollectionFile {
    #[serde(default)]
    documents: Vec<Document>,
}

/// Document store backed by one JSON file per collection
pub struct JsonDirStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles on the collection files
    write_lock: Mutex<()>,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn collection_file(&self, collection: &str) -> EngineResult<PathBuf> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(EngineError::Validation(format!(
                "Invalid collection name '{}'",
                collection
            )));
        }
        Ok(self.dir.join(format!("{}.json", collection)))
    }

    fn load(&self, collection: &str) -> EngineResult<CollectionData> {
        let file: CollectionFile = read_json(self.collection_file(collection)?)?;
        Ok(CollectionData::from_documents(file.documents))
    }

    fn save(&self, collection: &str, data: CollectionData) -> EngineResult<()> {
        let file = CollectionFile {
            documents: data.documents,
        };
        write_json_atomic(self.collection_file(collection)?, &file)
    }

    fn guard(&self) -> EngineResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|e| EngineError::Storage(format!("Failed to acquire store lock: {}", e)))
    }
}

impl DocumentStore for JsonDirStore {
    fn find_all(&self, collection: &str) -> EngineResult<DocumentCursor<'_>> {
        let data = self.load(collection)?;
        Ok(Box::new(data.documents.into_iter().map(Ok)))
    }

    fn find_by_keys(
        &self,
        collection: &str,
        keys: &[DocumentKey],
    ) -> EngineResult<HashMap<DocumentKey, Document>> {
        Ok(self.load(collection)?.find_by_keys(keys))
    }

    fn insert_many(&self, collection: &str, documents: Vec<Document>) -> EngineResult<u64> {
        let _guard = self.guard()?;
        let mut data = self.load(collection)?;
        let inserted = data.insert_many(collection, documents)?;
        self.save(collection, data)?;
        Ok(inserted)
    }

    fn delete_all(&self, collection: &str) -> EngineResult<u64> {
        let _guard = self.guard()?;
        let mut data = self.load(collection)?;
        let removed = data.clear();
        self.save(collection, data)?;
        Ok(removed)
    }

    fn drop_collection(&self, collection: &str) -> EngineResult<()> {
        let _guard = self.guard()?;
        let path = self.collection_file(collection)?;
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                EngineError::Storage(format!("Failed to drop {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }

    fn count(&self, collection: &str) -> EngineResult<u64> {
        Ok(self.load(collection)?.documents.len() as u64)
    }
}
