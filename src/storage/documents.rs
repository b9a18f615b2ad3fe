//! Document-store driver seam
//!
//! The engine never talks to a database directly. Everything it needs from
//! the CMS store is the handful of per-collection operations on
//! [`DocumentStore`]. [`MemoryStore`] is the in-process implementation used
//! by tests and embedders.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::models::{Document, DocumentKey};

/// Lazy sequence of documents read from a collection
pub type DocumentCursor<'a> = Box<dyn Iterator<Item = EngineResult<Document>> + Send + 'a>;

/// Per-collection operations consumed from the document-store driver
pub trait DocumentStore: Send + Sync {
    /// Stream every document of a collection (empty for an unknown collection)
    fn find_all(&self, collection: &str) -> EngineResult<DocumentCursor<'_>>;

    /// Fetch the documents whose primary key is in `keys`
    fn find_by_keys(
        &self,
        collection: &str,
        keys: &[DocumentKey],
    ) -> EngineResult<HashMap<DocumentKey, Document>>;

    /// Insert documents; a key that already exists is an error
    fn insert_many(&self, collection: &str, documents: Vec<Document>) -> EngineResult<u64>;

    /// Remove every document, keeping the collection; returns how many went
    fn delete_all(&self, collection: &str) -> EngineResult<u64>;

    /// Remove the collection itself
    fn drop_collection(&self, collection: &str) -> EngineResult<()>;

    fn count(&self, collection: &str) -> EngineResult<u64>;

    /// Keys from `keys` that already exist in the collection
    fn existing_keys(
        &self,
        collection: &str,
        keys: &[DocumentKey],
    ) -> EngineResult<HashSet<DocumentKey>> {
        Ok(self.find_by_keys(collection, keys)?.into_keys().collect())
    }
}

/// Documents of one collection with a key index
#[derive(Debug, Default, Clone)]
pub(crate) struct CollectionData {
    pub(crate) documents: Vec<Document>,
    keys: HashSet<DocumentKey>,
}

impl CollectionData {
    pub(crate) fn from_documents(documents: Vec<Document>) -> Self {
        let keys = documents.iter().filter_map(DocumentKey::of).collect();
        Self { documents, keys }
    }

    pub(crate) fn insert_many(
        &mut self,
        collection: &str,
        documents: Vec<Document>,
    ) -> EngineResult<u64> {
        // Check the whole batch first so a duplicate leaves nothing half-inserted
        let mut batch_keys = HashSet::new();
        for doc in &documents {
            if let Some(key) = DocumentKey::of(doc) {
                if self.keys.contains(&key) || !batch_keys.insert(key.clone()) {
                    return Err(EngineError::Storage(format!(
                        "Duplicate key '{}' in collection '{}'",
                        key, collection
                    )));
                }
            }
        }

        let inserted = documents.len() as u64;
        self.keys.extend(batch_keys);
        self.documents.extend(documents);
        Ok(inserted)
    }

    pub(crate) fn find_by_keys(&self, keys: &[DocumentKey]) -> HashMap<DocumentKey, Document> {
        let wanted: HashSet<&DocumentKey> =
            keys.iter().filter(|k| self.keys.contains(*k)).collect();
        if wanted.is_empty() {
            return HashMap::new();
        }

        self.documents
            .iter()
            .filter_map(|doc| {
                let key = DocumentKey::of(doc)?;
                wanted.contains(&key).then(|| (key, doc.clone()))
            })
            .collect()
    }

    pub(crate) fn clear(&mut self) -> u64 {
        let removed = self.documents.len() as u64;
        self.documents.clear();
        self.keys.clear();
        removed
    }
}

/// In-memory document store
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, CollectionData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a collection's contents
    pub fn seed(&self, collection: &str, documents: Vec<Document>) -> EngineResult<()> {
        let mut data = self.write()?;
        data.insert(
            collection.to_string(),
            CollectionData::from_documents(documents),
        );
        Ok(())
    }

    /// Snapshot of a collection's documents
    pub fn documents(&self, collection: &str) -> EngineResult<Vec<Document>> {
        let data = self.read()?;
        Ok(data
            .get(collection)
            .map(|c| c.documents.clone())
            .unwrap_or_default())
    }

    fn read(
        &self,
    ) -> EngineResult<std::sync::RwLockReadGuard<'_, HashMap<String, CollectionData>>> {
        self.collections
            .read()
            .map_err(|e| EngineError::Storage(format!("Failed to acquire read lock: {}", e)))
    }

    fn write(
        &self,
    ) -> EngineResult<std::sync::RwLockWriteGuard<'_, HashMap<String, CollectionData>>> {
        self.collections
            .write()
            .map_err(|e| EngineError::Storage(format!("Failed to acquire write lock: {}", e)))
    }
}

impl DocumentStore for MemoryStore {
    fn find_all(&self, collection: &str) -> EngineResult<DocumentCursor<'_>> {
        // Snapshot under the read lock; the cursor must not hold it
        let documents = self.documents(collection)?;
        Ok(Box::new(documents.into_iter().map(Ok)))
    }

    fn find_by_keys(
        &self,
        collection: &str,
        keys: &[DocumentKey],
    ) -> EngineResult<HashMap<DocumentKey, Document>> {
        let data = self.read()?;
        Ok(data
            .get(collection)
            .map(|c| c.find_by_keys(keys))
            .unwrap_or_default())
    }

    fn insert_many(&self, collection: &str, documents: Vec<Document>) -> EngineResult<u64> {
        let mut data = self.write()?;
        data.entry(collection.to_string())
            .or_default()
            .insert_many(collection, documents)
    }

    fn delete_all(&self, collection: &str) -> EngineResult<u64> {
        let mut data = self.write()?;
        Ok(data.get_mut(collection).map(|c| c.clear()).unwrap_or(0))
    }

    fn drop_collection(&self, collection: &str) -> EngineResult<()> {
        let mut data = self.write()?;
        data.remove(collection);
        Ok(())
    }

    fn count(&self, collection: &str) -> EngineResult<u64> {
        let data = self.read()?;
        Ok(data
            .get(collection)
            .map(|c| c.documents.len() as u64)
            .unwrap_or(0))
    }
}
