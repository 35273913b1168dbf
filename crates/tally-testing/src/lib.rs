//! Deterministic in-memory [`DocumentStore`] for tests.
//!
//! Thread-safe, fully in-memory, with two properties real backends lack:
//! every conditional write is evaluated under one write lock (so tests see
//! true atomicity), and time is a logical clock advanced explicitly via
//! [`InMemoryDocumentStore::advance`] so TTL expiry is testable without
//! real sleeps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tally_store::apply_patch_ops;
use tally_store::condition_holds;
use tally_store::DocumentStore;
use tally_store::DocumentStoreError;
use tally_store::PatchOp;
use tally_store::QueryRequest;
use tally_store::SortOrder;
use tally_store::StoredDocument;
use tally_store::WriteCondition;
use tokio::sync::RwLock;

/// One stored document plus the metadata the store owns.
#[derive(Clone)]
struct Entry {
    body: String,
    revision: u64,
    ttl_seconds: Option<u32>,
    last_write_ms: u64,
}

impl Entry {
    fn expired(&self, now_ms: u64) -> bool {
        match self.ttl_seconds {
            Some(ttl) => now_ms >= self.last_write_ms.saturating_add(u64::from(ttl) * 1000),
            None => false,
        }
    }

    fn to_document(&self, id: &str, partition_key: &str) -> StoredDocument {
        StoredDocument {
            id: id.to_string(),
            partition_key: partition_key.to_string(),
            body: self.body.clone(),
            etag: self.revision.to_string(),
            ttl_seconds: self.ttl_seconds,
        }
    }
}

struct State {
    /// Keyed by (partition_key, id) so partition scans are contiguous.
    docs: BTreeMap<(String, String), Entry>,
    /// Global revision counter; stringified as the etag.
    revision: u64,
    /// Logical clock in milliseconds.
    now_ms: u64,
}

/// Deterministic in-memory document store.
pub struct InMemoryDocumentStore {
    state: RwLock<State>,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl InMemoryDocumentStore {
    /// Create a new store wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    fn new_inner() -> Self {
        Self {
            state: RwLock::new(State {
                docs: BTreeMap::new(),
                revision: 0,
                now_ms: 0,
            }),
        }
    }

    /// Advance the logical clock, expiring any document whose TTL has run
    /// out by the new time.
    pub async fn advance(&self, by: Duration) {
        let mut state = self.state.write().await;
        state.now_ms = state.now_ms.saturating_add(by.as_millis() as u64);
        let now = state.now_ms;
        state.docs.retain(|_, entry| !entry.expired(now));
    }

    /// Current logical time in milliseconds.
    pub async fn now_ms(&self) -> u64 {
        self.state.read().await.now_ms
    }

    /// Number of live (non-expired) documents.
    pub async fn len(&self) -> usize {
        let state = self.state.read().await;
        let now = state.now_ms;
        state.docs.values().filter(|e| !e.expired(now)).count()
    }

    /// True when no live documents remain.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn sort_key(doc: &StoredDocument, field: &str) -> i64 {
    doc.fields()
        .ok()
        .and_then(|f| f.get(field).and_then(Value::as_i64))
        .unwrap_or(0)
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, id: &str, partition_key: &str) -> Result<StoredDocument, DocumentStoreError> {
        let state = self.state.read().await;
        let key = (partition_key.to_string(), id.to_string());
        match state.docs.get(&key) {
            Some(entry) if !entry.expired(state.now_ms) => Ok(entry.to_document(id, partition_key)),
            _ => Err(DocumentStoreError::NotFound { id: id.to_string() }),
        }
    }

    async fn create(&self, doc: StoredDocument) -> Result<StoredDocument, DocumentStoreError> {
        doc.validate()?;
        doc.fields()?;
        let mut state = self.state.write().await;
        let key = (doc.partition_key.clone(), doc.id.clone());
        let now = state.now_ms;
        if state.docs.get(&key).is_some_and(|e| !e.expired(now)) {
            return Err(DocumentStoreError::Conflict { id: doc.id });
        }
        state.revision += 1;
        let entry = Entry {
            body: doc.body.clone(),
            revision: state.revision,
            ttl_seconds: doc.ttl_seconds,
            last_write_ms: now,
        };
        let stored = entry.to_document(&doc.id, &doc.partition_key);
        state.docs.insert(key, entry);
        Ok(stored)
    }

    async fn upsert(&self, doc: StoredDocument) -> Result<StoredDocument, DocumentStoreError> {
        doc.validate()?;
        doc.fields()?;
        let mut state = self.state.write().await;
        state.revision += 1;
        let entry = Entry {
            body: doc.body.clone(),
            revision: state.revision,
            ttl_seconds: doc.ttl_seconds,
            last_write_ms: state.now_ms,
        };
        let stored = entry.to_document(&doc.id, &doc.partition_key);
        state.docs.insert((doc.partition_key, doc.id), entry);
        Ok(stored)
    }

    async fn patch(
        &self,
        id: &str,
        partition_key: &str,
        ops: Vec<PatchOp>,
        condition: WriteCondition,
    ) -> Result<StoredDocument, DocumentStoreError> {
        let mut state = self.state.write().await;
        let now = state.now_ms;
        let key = (partition_key.to_string(), id.to_string());

        let entry = match state.docs.get(&key) {
            Some(entry) if !entry.expired(now) => entry.clone(),
            _ => return Err(DocumentStoreError::NotFound { id: id.to_string() }),
        };

        let current = entry.to_document(id, partition_key);
        let mut fields = current.fields()?;
        if !condition_holds(&condition, &fields, &current.etag) {
            return Err(DocumentStoreError::PreconditionFailed { id: id.to_string() });
        }
        apply_patch_ops(&mut fields, &ops).map_err(|reason| DocumentStoreError::Corrupted {
            id: id.to_string(),
            reason,
        })?;

        state.revision += 1;
        let updated = Entry {
            body: Value::Object(fields).to_string(),
            revision: state.revision,
            ttl_seconds: entry.ttl_seconds,
            last_write_ms: now,
        };
        let stored = updated.to_document(id, partition_key);
        state.docs.insert(key, updated);
        Ok(stored)
    }

    async fn query(&self, request: QueryRequest) -> Result<Vec<StoredDocument>, DocumentStoreError> {
        let state = self.state.read().await;
        let now = state.now_ms;

        let mut matches = Vec::new();
        let lower = (request.partition_key.clone(), String::new());
        for ((pk, id), entry) in state.docs.range(lower..) {
            if pk != &request.partition_key {
                break;
            }
            if entry.expired(now) {
                continue;
            }
            let doc = entry.to_document(id, pk);
            let fields = doc.fields()?;
            if request
                .filters
                .iter()
                .all(|f| fields.get(&f.field) == Some(&f.equals))
            {
                matches.push(doc);
            }
        }

        match &request.sort {
            SortOrder::Ascending(field) => matches.sort_by_key(|d| sort_key(d, field)),
            SortOrder::Descending(field) => matches.sort_by_key(|d| std::cmp::Reverse(sort_key(d, field))),
            SortOrder::Unsorted => {}
        }

        Ok(matches)
    }

    async fn delete(&self, id: &str, partition_key: &str) -> Result<bool, DocumentStoreError> {
        let mut state = self.state.write().await;
        let now = state.now_ms;
        let key = (partition_key.to_string(), id.to_string());
        match state.docs.remove(&key) {
            Some(entry) => Ok(!entry.expired(now)),
            None => Ok(false),
        }
    }
}
