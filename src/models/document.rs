//! Documents as stored in the CMS collections
//!
//! A document is an arbitrary JSON object. Its primary key is the `_id`
//! field; merge restores and previews compare documents by that key.

use serde_json::{Map, Value};
use std::fmt;

/// Name of the primary-key field
pub const PRIMARY_KEY: &str = "_id";

/// A single stored document
pub type Document = Map<String, Value>;

/// Comparable primary key extracted from a document's `_id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey(String);

impl DocumentKey {
    /// Extract the key of a document, `None` when it has no usable `_id`
    pub fn of(document: &Document) -> Option<Self> {
        match document.get(PRIMARY_KEY)? {
            Value::Null => None,
            Value::String(s) => Some(Self(s.clone())),
            // Extended-JSON style ids ({"$oid": ...}) and numbers keep their JSON text
            other => Some(Self(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
