//! Document envelope and query types.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::DocumentStoreError;

/// A document as stored: JSON body plus store-owned metadata.
///
/// The `etag` is assigned by the store on every successful write and is
/// required for etag-guarded conditional updates. Callers never choose it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredDocument {
    /// Unique id within the partition.
    pub id: String,
    /// Partition (grouping) key. Related documents share a partition.
    pub partition_key: String,
    /// JSON-encoded document body.
    pub body: String,
    /// Opaque version tag, replaced by the store on every write.
    pub etag: String,
    /// Seconds of inactivity after which the store deletes the document.
    pub ttl_seconds: Option<u32>,
}

impl StoredDocument {
    /// Create a document envelope for a write. The etag is left empty; the
    /// store fills it in on the returned copy.
    pub fn new(id: impl Into<String>, partition_key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            partition_key: partition_key.into(),
            body: body.into(),
            etag: String::new(),
            ttl_seconds: None,
        }
    }

    /// Attach a TTL to the document.
    pub fn with_ttl(mut self, ttl_seconds: u32) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    /// Parse the body into a JSON object map.
    ///
    /// Fails with [`DocumentStoreError::Corrupted`] when the body is not a
    /// JSON object.
    pub fn fields(&self) -> Result<Map<String, Value>, DocumentStoreError> {
        match serde_json::from_str::<Value>(&self.body) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(DocumentStoreError::Corrupted {
                id: self.id.clone(),
                reason: "body is not a JSON object".to_string(),
            }),
            Err(e) => Err(DocumentStoreError::Corrupted {
                id: self.id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Validate the envelope before a write.
    pub fn validate(&self) -> Result<(), DocumentStoreError> {
        if self.id.is_empty() || self.partition_key.is_empty() {
            return Err(DocumentStoreError::EmptyId);
        }
        Ok(())
    }
}

/// Equality filter over a single body field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldFilter {
    pub field: String,
    pub equals: Value,
}

impl FieldFilter {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            equals: value.into(),
        }
    }
}

/// Sort order for query results, keyed on a numeric body field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending by the named field.
    Ascending(String),
    /// Descending by the named field.
    Descending(String),
    /// Store order, whatever that is.
    #[default]
    Unsorted,
}

/// Query over a single partition.
///
/// All filters must hold for a document to match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    pub partition_key: String,
    pub filters: Vec<FieldFilter>,
    pub sort: SortOrder,
}

impl QueryRequest {
    pub fn new(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            filters: Vec::new(),
            sort: SortOrder::Unsorted,
        }
    }

    pub fn filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn fields_parses_object_body() {
        let doc = StoredDocument::new("a", "p", r#"{"value":3}"#);
        let fields = doc.fields().unwrap();
        assert_eq!(fields.get("value"), Some(&json!(3)));
    }

    #[test]
    fn fields_rejects_non_object_body() {
        let doc = StoredDocument::new("a", "p", "[1,2]");
        assert!(matches!(doc.fields(), Err(DocumentStoreError::Corrupted { .. })));
    }

    #[test]
    fn empty_id_rejected() {
        let doc = StoredDocument::new("", "p", "{}");
        assert!(matches!(doc.validate(), Err(DocumentStoreError::EmptyId)));
    }

    #[test]
    fn query_builder_collects_filters() {
        let q = QueryRequest::new("p")
            .filter(FieldFilter::equals("doc_type", "counter_shard"))
            .sort(SortOrder::Ascending("value".to_string()));
        assert_eq!(q.filters.len(), 1);
        assert_eq!(q.sort, SortOrder::Ascending("value".to_string()));
    }
}
