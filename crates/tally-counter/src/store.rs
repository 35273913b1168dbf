//! CRUD over primary counter and shard records.
//!
//! All conditional operations follow one convention: `Ok(Some(_))` means the
//! write landed, `Ok(None)` means the store rejected it for an expected
//! reason (lost race, already in the target state, shard gone or depleted),
//! and `Err(_)` is reserved for unexpected store failures.

use std::sync::Arc;

use tally_store::DocumentStore;
use tally_store::DocumentStoreError;
use tally_store::FieldFilter;
use tally_store::PatchOp;
use tally_store::QueryRequest;
use tally_store::SortOrder;
use tally_store::StoredDocument;
use tally_store::WriteCondition;
use tracing::debug;

use crate::error::CounterError;
use crate::model::CounterShard;
use crate::model::CounterStatus;
use crate::model::PrimaryCounter;
use crate::model::COUNTER_SHARD_DOC_TYPE;

/// Sort order for shard listings, keyed on shard value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardSort {
    Ascending,
    Descending,
    Unsorted,
}

impl ShardSort {
    fn to_order(self) -> SortOrder {
        match self {
            ShardSort::Ascending => SortOrder::Ascending("value".to_string()),
            ShardSort::Descending => SortOrder::Descending("value".to_string()),
            ShardSort::Unsorted => SortOrder::Unsorted,
        }
    }
}

/// Storage access for counter and shard records.
pub struct ShardStore<S: DocumentStore + ?Sized> {
    store: Arc<S>,
}

impl<S: DocumentStore + ?Sized> Clone for ShardStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: DocumentStore + ?Sized> ShardStore<S> {
    /// Create a shard store over the given document store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Write a primary counter record (create or replace).
    pub async fn create_primary(&self, counter: &PrimaryCounter) -> Result<PrimaryCounter, CounterError> {
        let doc = self.store.upsert(counter.to_document()?).await?;
        debug!(counter_id = %counter.id, start_value = counter.start_value, "primary counter written");
        PrimaryCounter::from_document(&doc)
    }

    /// Read a primary counter. `Ok(None)` when it does not exist.
    pub async fn read_primary(&self, counter_id: &str) -> Result<Option<PrimaryCounter>, CounterError> {
        match self.store.get(counter_id, counter_id).await {
            Ok(doc) => Ok(Some(PrimaryCounter::from_document(&doc)?)),
            Err(DocumentStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the primary counter to `status`.
    ///
    /// `Ok(None)` when the counter is already in that status - the signal
    /// the rebalancer uses to detect a concurrent rebalance holding
    /// `Updating`.
    pub async fn update_primary_status(
        &self,
        counter: &PrimaryCounter,
        status: CounterStatus,
    ) -> Result<Option<PrimaryCounter>, CounterError> {
        let result = self
            .store
            .patch(
                &counter.id,
                &counter.id,
                vec![PatchOp::set("status", status.as_str())],
                WriteCondition::FieldNotEquals {
                    field: "status".to_string(),
                    value: status.as_json(),
                },
            )
            .await;
        match result {
            Ok(doc) => Ok(Some(PrimaryCounter::from_document(&doc)?)),
            Err(DocumentStoreError::PreconditionFailed { .. }) => Ok(None),
            Err(DocumentStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a new active shard holding `value`.
    pub async fn create_shard(&self, counter_id: &str, value: i64) -> Result<CounterShard, CounterError> {
        let shard = CounterShard::new(counter_id, value);
        let doc = self.store.create(shard.to_document()?).await?;
        debug!(counter_id, shard_id = %shard.id, value, "shard created");
        CounterShard::from_document(&doc)
    }

    /// Read one shard. `Ok(None)` when absent - a consumed or merged-away
    /// shard is a normal outcome, not an error.
    pub async fn read_shard(&self, shard_id: &str, counter_id: &str) -> Result<Option<CounterShard>, CounterError> {
        match self.store.get(shard_id, counter_id).await {
            Ok(doc) => Ok(Some(CounterShard::from_document(&doc)?)),
            Err(DocumentStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List a counter's shards, optionally only active ones, in the given
    /// value order.
    pub async fn list_shards(
        &self,
        counter_id: &str,
        active_only: bool,
        sort: ShardSort,
    ) -> Result<Vec<CounterShard>, CounterError> {
        let mut request = QueryRequest::new(counter_id)
            .filter(FieldFilter::equals("doc_type", COUNTER_SHARD_DOC_TYPE))
            .sort(sort.to_order());
        if active_only {
            request = request.filter(FieldFilter::equals("status", CounterStatus::Active.as_str()));
        }
        let docs = self.store.query(request).await?;
        docs.iter().map(CounterShard::from_document).collect()
    }

    /// Move a shard to `status`.
    ///
    /// `Ok(None)` when the shard is already in that status or no longer
    /// exists.
    pub async fn update_shard_status(
        &self,
        shard: &CounterShard,
        status: CounterStatus,
    ) -> Result<Option<CounterShard>, CounterError> {
        let result = self
            .store
            .patch(
                &shard.id,
                &shard.counter_id,
                vec![PatchOp::set("status", status.as_str())],
                WriteCondition::FieldNotEquals {
                    field: "status".to_string(),
                    value: status.as_json(),
                },
            )
            .await;
        self.expected_patch_outcome(result)
    }

    /// Rewrite a shard's value and status together, guarded by the version
    /// tag carried on `shard`. `Ok(None)` means another writer got there
    /// first and the caller must re-read.
    pub async fn update_shard_value_and_status(
        &self,
        shard: &CounterShard,
        status: CounterStatus,
        value: i64,
    ) -> Result<Option<CounterShard>, CounterError> {
        let result = self
            .store
            .patch(
                &shard.id,
                &shard.counter_id,
                vec![PatchOp::set("status", status.as_str()), PatchOp::set("value", value)],
                WriteCondition::EtagMatches {
                    etag: shard.etag.clone(),
                },
            )
            .await;
        self.expected_patch_outcome(result)
    }

    /// Atomically subtract `amount` from an active shard.
    ///
    /// The store-side predicate requires `status == active` and
    /// `value >= amount`, so a decrement can never drive the shard negative
    /// and never races a concurrent pause. `Ok(None)` means the predicate
    /// rejected the write (inactive, depleted, or gone).
    pub async fn decrement_shard(
        &self,
        counter_id: &str,
        shard_id: &str,
        amount: i64,
    ) -> Result<Option<CounterShard>, CounterError> {
        debug_assert!(amount > 0, "decrement amount must be positive");
        let result = self
            .store
            .patch(
                shard_id,
                counter_id,
                vec![PatchOp::increment("value", -amount)],
                WriteCondition::All(vec![
                    WriteCondition::FieldEquals {
                        field: "status".to_string(),
                        value: CounterStatus::Active.as_json(),
                    },
                    WriteCondition::FieldAtLeast {
                        field: "value".to_string(),
                        min: amount,
                    },
                ]),
            )
            .await;
        self.expected_patch_outcome(result)
    }

    /// Collapse a patch result into the `Ok(None)`-on-expected-rejection
    /// convention.
    fn expected_patch_outcome(
        &self,
        result: Result<StoredDocument, DocumentStoreError>,
    ) -> Result<Option<CounterShard>, CounterError> {
        match result {
            Ok(doc) => Ok(Some(CounterShard::from_document(&doc)?)),
            Err(DocumentStoreError::PreconditionFailed { .. }) => Ok(None),
            Err(DocumentStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tally_testing::InMemoryDocumentStore;

    use super::*;

    fn shard_store() -> ShardStore<InMemoryDocumentStore> {
        ShardStore::new(InMemoryDocumentStore::new())
    }

    #[tokio::test]
    async fn shard_create_read_roundtrip() {
        let store = shard_store();
        let shard = store.create_shard("c1", 25).await.unwrap();

        let read = store.read_shard(&shard.id, "c1").await.unwrap().unwrap();
        assert_eq!(read.value, 25);
        assert_eq!(read.status, CounterStatus::Active);
        assert_eq!(read.etag, shard.etag);
    }

    #[tokio::test]
    async fn read_missing_shard_is_none() {
        let store = shard_store();
        assert!(store.read_shard("nope", "c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_shards_filters_and_orders() {
        let store = shard_store();
        store.create_shard("c1", 30).await.unwrap();
        let paused = store.create_shard("c1", 10).await.unwrap();
        store.create_shard("c1", 20).await.unwrap();
        store.update_shard_status(&paused, CounterStatus::Paused).await.unwrap();

        let active = store.list_shards("c1", true, ShardSort::Ascending).await.unwrap();
        let values: Vec<_> = active.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![20, 30]);

        let all = store.list_shards("c1", false, ShardSort::Descending).await.unwrap();
        let values: Vec<_> = all.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![30, 20, 10]);
    }

    #[tokio::test]
    async fn status_update_rejects_same_status() {
        let store = shard_store();
        let shard = store.create_shard("c1", 5).await.unwrap();

        let paused = store.update_shard_status(&shard, CounterStatus::Paused).await.unwrap();
        assert!(paused.is_some());

        // Already paused: expected rejection, not an error.
        let again = store.update_shard_status(&shard, CounterStatus::Paused).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn value_update_requires_fresh_etag() {
        let store = shard_store();
        let shard = store.create_shard("c1", 10).await.unwrap();

        let updated = store
            .update_shard_value_and_status(&shard, CounterStatus::Active, 7)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.value, 7);

        // The original etag is now stale.
        let lost = store
            .update_shard_value_and_status(&shard, CounterStatus::Active, 3)
            .await
            .unwrap();
        assert!(lost.is_none());
    }

    #[tokio::test]
    async fn decrement_happy_path() {
        let store = shard_store();
        let shard = store.create_shard("c1", 10).await.unwrap();

        let after = store.decrement_shard("c1", &shard.id, 4).await.unwrap().unwrap();
        assert_eq!(after.value, 6);
    }

    #[tokio::test]
    async fn decrement_rejected_below_amount() {
        let store = shard_store();
        let shard = store.create_shard("c1", 3).await.unwrap();

        assert!(store.decrement_shard("c1", &shard.id, 4).await.unwrap().is_none());

        // Value untouched.
        let read = store.read_shard(&shard.id, "c1").await.unwrap().unwrap();
        assert_eq!(read.value, 3);
    }

    #[tokio::test]
    async fn decrement_rejected_when_paused() {
        let store = shard_store();
        let shard = store.create_shard("c1", 50).await.unwrap();
        store.update_shard_status(&shard, CounterStatus::Paused).await.unwrap();

        assert!(store.decrement_shard("c1", &shard.id, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn primary_status_transition_guard() {
        let store = shard_store();
        let pc = store.create_primary(&PrimaryCounter::new("orders", 100)).await.unwrap();

        let updating = store.update_primary_status(&pc, CounterStatus::Updating).await.unwrap();
        assert!(updating.is_some());

        // Second rebalancer loses: counter already Updating.
        let busy = store.update_primary_status(&pc, CounterStatus::Updating).await.unwrap();
        assert!(busy.is_none());
    }
}
