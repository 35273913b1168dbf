//! Counter record types as stored in the document store.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tally_store::StoredDocument;
use uuid::Uuid;

use crate::error::CounterError;

/// Discriminator value for primary counter records.
pub const PRIMARY_COUNTER_DOC_TYPE: &str = "primary_counter";
/// Discriminator value for shard records.
pub const COUNTER_SHARD_DOC_TYPE: &str = "counter_shard";

/// Lifecycle status of a counter or shard.
///
/// `Updating` is primary-level: one rebalance (split or merge) holds it as a
/// soft advisory lock. `Paused` is shard-level: write suppression while a
/// rebalance mutates that shard's value. They are deliberately distinct
/// states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CounterStatus {
    /// In rotation; decrements accepted.
    Active,
    /// Soft tombstone; excluded from selection, never physically removed.
    Deleted,
    /// A rebalance operation is in progress on the primary counter.
    Updating,
    /// Shard temporarily out of rotation while its value is rewritten.
    Paused,
    /// Created but not yet activated.
    Pending,
}

impl CounterStatus {
    /// The serialized form, for building store-side conditions.
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterStatus::Active => "active",
            CounterStatus::Deleted => "deleted",
            CounterStatus::Updating => "updating",
            CounterStatus::Paused => "paused",
            CounterStatus::Pending => "pending",
        }
    }

    /// The serialized form as a JSON value.
    pub fn as_json(&self) -> Value {
        Value::from(self.as_str())
    }
}

/// The logical counter record. Its id doubles as the partition key for the
/// counter and all of its shards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrimaryCounter {
    /// Unique id; also the partition key.
    pub id: String,
    /// Display name.
    pub name: String,
    /// The counter's nominal starting total.
    pub start_value: i64,
    /// Lifecycle status.
    pub status: CounterStatus,
    /// Record kind discriminator.
    pub doc_type: String,
    /// Store-assigned version tag; empty until read back.
    #[serde(skip)]
    pub etag: String,
}

impl PrimaryCounter {
    /// Create a new counter record in `Pending` status.
    pub fn new(name: impl Into<String>, start_value: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            start_value,
            status: CounterStatus::Pending,
            doc_type: PRIMARY_COUNTER_DOC_TYPE.to_string(),
            etag: String::new(),
        }
    }

    /// Serialize into a store envelope.
    pub fn to_document(&self) -> Result<StoredDocument, CounterError> {
        let body = serde_json::to_string(self)?;
        Ok(StoredDocument::new(self.id.clone(), self.id.clone(), body))
    }

    /// Deserialize from a store envelope, carrying the etag over.
    pub fn from_document(doc: &StoredDocument) -> Result<Self, CounterError> {
        let mut counter: PrimaryCounter =
            serde_json::from_str(&doc.body).map_err(|e| corrupted(&doc.id, e))?;
        counter.etag = doc.etag.clone();
        Ok(counter)
    }
}

/// One shard of a distributed counter.
///
/// Belongs to exactly one [`PrimaryCounter`] by foreign key; stored and
/// addressed independently. Active shards hold non-negative values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterShard {
    /// Unique shard id.
    pub id: String,
    /// Parent counter id; also the partition key.
    pub counter_id: String,
    /// This shard's portion of the counter total.
    pub value: i64,
    /// Lifecycle status.
    pub status: CounterStatus,
    /// Record kind discriminator.
    pub doc_type: String,
    /// Store-assigned version tag; empty until read back.
    #[serde(skip)]
    pub etag: String,
}

impl CounterShard {
    /// Create a new active shard for a counter.
    pub fn new(counter_id: impl Into<String>, value: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            counter_id: counter_id.into(),
            value,
            status: CounterStatus::Active,
            doc_type: COUNTER_SHARD_DOC_TYPE.to_string(),
            etag: String::new(),
        }
    }

    /// Serialize into a store envelope.
    pub fn to_document(&self) -> Result<StoredDocument, CounterError> {
        let body = serde_json::to_string(self)?;
        Ok(StoredDocument::new(self.id.clone(), self.counter_id.clone(), body))
    }

    /// Deserialize from a store envelope, carrying the etag over.
    pub fn from_document(doc: &StoredDocument) -> Result<Self, CounterError> {
        let mut shard: CounterShard =
            serde_json::from_str(&doc.body).map_err(|e| corrupted(&doc.id, e))?;
        shard.etag = doc.etag.clone();
        Ok(shard)
    }
}

fn corrupted(id: &str, source: serde_json::Error) -> CounterError {
    CounterError::Corrupted {
        id: id.to_string(),
        reason: source.to_string(),
    }
}
