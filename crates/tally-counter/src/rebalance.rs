//! Counter creation and split/merge rebalancing.
//!
//! A rebalance never moves value outside the counter: a split halves one
//! shard and gives the remainder to a new sibling; a merge tombstones one
//! shard and folds its captured value into the next. Every shard being
//! mutated is paused first so a concurrent decrement cannot compute against
//! a stale value.
//!
//! Mutual exclusion between rebalances is the primary counter's own status
//! field: whoever flips it to `Updating` first runs; the loser gets
//! `Ok(None)` and retries later. This is an advisory soft lock, not a real
//! mutex, and losing the race is a normal outcome.

use std::sync::Arc;

use tally_store::DocumentStore;
use tracing::debug;
use tracing::warn;

use crate::constants::LOW_VALUE_MERGE_THRESHOLD;
use crate::constants::REPAIR_RETRY_ATTEMPTS;
use crate::error::CounterError;
use crate::model::CounterShard;
use crate::model::CounterStatus;
use crate::model::PrimaryCounter;
use crate::pure::halve;
use crate::pure::needs_low_value_merge;
use crate::pure::split_evenly;
use crate::store::ShardSort;
use crate::store::ShardStore;

/// Create/activate/split/merge operations for distributed counters.
pub struct CounterManager<S: DocumentStore + ?Sized> {
    shards: ShardStore<S>,
}

impl<S: DocumentStore + ?Sized> Clone for CounterManager<S> {
    fn clone(&self) -> Self {
        Self {
            shards: self.shards.clone(),
        }
    }
}

impl<S: DocumentStore + ?Sized> CounterManager<S> {
    /// Create a new manager over the given document store.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            shards: ShardStore::new(store),
        }
    }

    /// The underlying shard store.
    pub fn shard_store(&self) -> &ShardStore<S> {
        &self.shards
    }

    /// Create a counter with `initial_value` spread as evenly as possible
    /// across `shard_count` shards (the last shard absorbs the integer
    /// remainder). The primary record is created in `Pending` status;
    /// call [`CounterManager::activate`] before accepting decrements.
    pub async fn create_counter(
        &self,
        name: &str,
        initial_value: i64,
        shard_count: u32,
    ) -> Result<PrimaryCounter, CounterError> {
        assert!(shard_count > 0, "counter must have at least one shard");
        assert!(initial_value >= 0, "counter start value must be non-negative");

        let counter = PrimaryCounter::new(name, initial_value);
        for part in split_evenly(initial_value, shard_count) {
            self.shards.create_shard(&counter.id, part).await?;
        }
        let created = self.shards.create_primary(&counter).await?;
        debug!(counter_id = %created.id, name, initial_value, shard_count, "counter created");
        Ok(created)
    }

    /// Activate a pending counter. `Ok(None)` when the counter does not
    /// exist or is already active.
    pub async fn activate(&self, counter_id: &str) -> Result<Option<PrimaryCounter>, CounterError> {
        match self.shards.read_primary(counter_id).await? {
            Some(counter) => self.shards.update_primary_status(&counter, CounterStatus::Active).await,
            None => Ok(None),
        }
    }

    /// Read the primary counter record.
    pub async fn read_counter(&self, counter_id: &str) -> Result<Option<PrimaryCounter>, CounterError> {
        self.shards.read_primary(counter_id).await
    }

    /// Sum of the counter's active shard values: its observable total.
    pub async fn active_total(&self, counter_id: &str) -> Result<i64, CounterError> {
        let shards = self.shards.list_shards(counter_id, true, ShardSort::Unsorted).await?;
        Ok(shards.iter().map(|s| s.value).sum())
    }

    /// Split up to `split_count` shards, highest value first.
    ///
    /// Each selected shard is paused, halved in place, and a new sibling is
    /// created with the remainder. `Ok(None)` means another rebalance holds
    /// the counter; retry later. The counter is handed back to rotation
    /// even when a repair escalates. Returns the refreshed active shard
    /// list.
    pub async fn split(&self, counter_id: &str, split_count: u32) -> Result<Option<Vec<CounterShard>>, CounterError> {
        let candidates = self.shards.list_shards(counter_id, true, ShardSort::Descending).await?;

        let Some(counter) = self.begin_rebalance(counter_id).await? else {
            return Ok(None);
        };

        let outcome = self.split_walk(counter_id, &candidates, split_count).await;
        self.finish_rebalance(&counter).await?;
        outcome?;

        let refreshed = self.shards.list_shards(counter_id, true, ShardSort::Descending).await?;
        Ok(Some(refreshed))
    }

    /// Walk candidate shards in order, halving each in place and creating
    /// a sibling with the remainder. Returns the number of shards split.
    async fn split_walk(
        &self,
        counter_id: &str,
        candidates: &[CounterShard],
        split_count: u32,
    ) -> Result<u32, CounterError> {
        let mut done = 0u32;
        for shard in candidates {
            if done >= split_count {
                break;
            }

            // Out of rotation while we rewrite its value.
            let Some(paused) = self.shards.update_shard_status(shard, CounterStatus::Paused).await? else {
                continue;
            };

            let (kept, moved) = halve(paused.value);
            let halved = self
                .shards
                .update_shard_value_and_status(&paused, CounterStatus::Active, kept)
                .await?;
            if halved.is_none() {
                // Lost the etag race mid-split; put the full value back.
                if !self.restore_shard_value(&paused.id, counter_id, paused.value).await? {
                    return Err(CounterError::SplitRepairFailed {
                        shard_id: paused.id.clone(),
                    });
                }
                continue;
            }

            match self.shards.create_shard(counter_id, moved).await {
                Ok(sibling) => {
                    debug!(
                        counter_id,
                        shard_id = %paused.id,
                        sibling_id = %sibling.id,
                        kept,
                        moved,
                        "shard split"
                    );
                    done += 1;
                }
                Err(e) => {
                    // Sibling never materialized: the moved half exists
                    // nowhere. Restore the original value or fail loudly.
                    warn!(counter_id, shard_id = %paused.id, error = %e, "sibling create failed, restoring shard");
                    if !self.restore_shard_value(&paused.id, counter_id, paused.value).await? {
                        return Err(CounterError::SplitRepairFailed {
                            shard_id: paused.id.clone(),
                        });
                    }
                }
            }
        }
        Ok(done)
    }

    /// Merge up to `merge_count` adjacent pairs, lowest values first.
    ///
    /// The first shard of each pair is tombstoned (`Deleted`) and its value
    /// folded into the second. `Ok(None)` means another rebalance holds the
    /// counter. Returns the refreshed active shard list.
    pub async fn merge(&self, counter_id: &str, merge_count: u32) -> Result<Option<Vec<CounterShard>>, CounterError> {
        let candidates = self.shards.list_shards(counter_id, true, ShardSort::Ascending).await?;

        let Some(counter) = self.begin_rebalance(counter_id).await? else {
            return Ok(None);
        };

        let outcome = self.merge_walk(counter_id, &candidates, Some(merge_count), false).await;
        self.finish_rebalance(&counter).await?;
        outcome?;

        let refreshed = self.shards.list_shards(counter_id, true, ShardSort::Ascending).await?;
        Ok(Some(refreshed))
    }

    /// Maintenance routine: consolidate shards that have fallen below the
    /// low-value threshold. Quietly does nothing when the counter is busy
    /// or a single shard remains.
    pub async fn merge_low_value(&self, counter_id: &str) -> Result<(), CounterError> {
        let candidates = self.shards.list_shards(counter_id, true, ShardSort::Ascending).await?;
        if candidates.len() <= 1 {
            return Ok(());
        }

        let Some(counter) = self.begin_rebalance(counter_id).await? else {
            debug!(counter_id, "counter busy, skipping low-value merge");
            return Ok(());
        };

        let outcome = self.merge_walk(counter_id, &candidates, None, true).await;
        self.finish_rebalance(&counter).await?;
        outcome?;
        Ok(())
    }

    /// Walk shard pairs in order, tombstoning the first of each pair and
    /// folding its value into the second. Returns the number of pairs
    /// merged.
    async fn merge_walk(
        &self,
        counter_id: &str,
        candidates: &[CounterShard],
        max_pairs: Option<u32>,
        only_low_value: bool,
    ) -> Result<u32, CounterError> {
        let mut merged = 0u32;
        let mut i = 0usize;

        while i + 1 < candidates.len() {
            if max_pairs.is_some_and(|max| merged >= max) {
                break;
            }
            let source = &candidates[i];
            let target = &candidates[i + 1];

            if only_low_value && !needs_low_value_merge(source.value, LOW_VALUE_MERGE_THRESHOLD) {
                // Candidates are value-ascending; nothing further qualifies.
                break;
            }

            // Tombstone first so no decrement lands on the source while its
            // value is in flight.
            let Some(tombstoned) = self.shards.update_shard_status(source, CounterStatus::Deleted).await? else {
                i += 1;
                continue;
            };

            if self.fold_into(target, tombstoned.value).await? {
                debug!(
                    counter_id,
                    source_id = %tombstoned.id,
                    target_id = %target.id,
                    folded = tombstoned.value,
                    "shards merged"
                );
                merged += 1;
            } else {
                // The fold never landed: the tombstoned value would be lost.
                // Un-delete the source or escalate.
                if self.shards.update_shard_status(&tombstoned, CounterStatus::Active).await?.is_none() {
                    return Err(CounterError::MergeRepairFailed {
                        target_id: target.id.clone(),
                        source_id: tombstoned.id.clone(),
                    });
                }
                warn!(counter_id, source_id = %tombstoned.id, target_id = %target.id, "fold failed, source restored");
            }
            i += 2;
        }

        Ok(merged)
    }

    /// Fold `fold_value` into `target`: pause, add, reactivate.
    ///
    /// Retried with a fresh read each attempt; `Ok(false)` after the retry
    /// budget is spent (or when the target vanished).
    async fn fold_into(&self, target: &CounterShard, fold_value: i64) -> Result<bool, CounterError> {
        for _ in 0..REPAIR_RETRY_ATTEMPTS {
            let Some(fresh) = self.shards.read_shard(&target.id, &target.counter_id).await? else {
                return Ok(false);
            };

            // A previous attempt may have left the target paused; in that
            // case skip straight to the guarded rewrite.
            let paused = if fresh.status == CounterStatus::Paused {
                fresh
            } else {
                match self.shards.update_shard_status(&fresh, CounterStatus::Paused).await? {
                    Some(paused) => paused,
                    None => continue,
                }
            };

            let new_value = paused.value.saturating_add(fold_value);
            if self
                .shards
                .update_shard_value_and_status(&paused, CounterStatus::Active, new_value)
                .await?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Restore a shard to `value` and `Active`, retrying with fresh reads.
    /// Returns whether the restore landed.
    async fn restore_shard_value(&self, shard_id: &str, counter_id: &str, value: i64) -> Result<bool, CounterError> {
        for _ in 0..REPAIR_RETRY_ATTEMPTS {
            let Some(fresh) = self.shards.read_shard(shard_id, counter_id).await? else {
                return Ok(false);
            };
            if self
                .shards
                .update_shard_value_and_status(&fresh, CounterStatus::Active, value)
                .await?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Claim the counter for a rebalance by flipping it to `Updating`.
    /// `Ok(None)` when missing or another rebalance already holds it.
    async fn begin_rebalance(&self, counter_id: &str) -> Result<Option<PrimaryCounter>, CounterError> {
        let Some(counter) = self.shards.read_primary(counter_id).await? else {
            return Ok(None);
        };
        self.shards.update_primary_status(&counter, CounterStatus::Updating).await
    }

    /// Hand the counter back to rotation.
    async fn finish_rebalance(&self, counter: &PrimaryCounter) -> Result<(), CounterError> {
        self.shards.update_primary_status(counter, CounterStatus::Active).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tally_store::DocumentStoreError;
    use tally_store::PatchOp;
    use tally_store::QueryRequest;
    use tally_store::StoredDocument;
    use tally_store::WriteCondition;
    use tally_testing::InMemoryDocumentStore;

    use super::*;

    /// Delegates to the in-memory store until `fail_on` is set; from then
    /// on every create is rejected and the named document reads as gone,
    /// which defeats both halves of a split repair.
    struct SplitFaultStore {
        inner: Arc<InMemoryDocumentStore>,
        fail_on: Mutex<Option<String>>,
    }

    #[async_trait]
    impl DocumentStore for SplitFaultStore {
        async fn get(&self, id: &str, partition_key: &str) -> Result<StoredDocument, DocumentStoreError> {
            if self.fail_on.lock().unwrap().as_deref() == Some(id) {
                return Err(DocumentStoreError::NotFound { id: id.to_string() });
            }
            self.inner.get(id, partition_key).await
        }

        async fn create(&self, doc: StoredDocument) -> Result<StoredDocument, DocumentStoreError> {
            if self.fail_on.lock().unwrap().is_some() {
                return Err(DocumentStoreError::Transport {
                    reason: "write rejected".to_string(),
                });
            }
            self.inner.create(doc).await
        }

        async fn upsert(&self, doc: StoredDocument) -> Result<StoredDocument, DocumentStoreError> {
            self.inner.upsert(doc).await
        }

        async fn patch(
            &self,
            id: &str,
            partition_key: &str,
            ops: Vec<PatchOp>,
            condition: WriteCondition,
        ) -> Result<StoredDocument, DocumentStoreError> {
            self.inner.patch(id, partition_key, ops, condition).await
        }

        async fn query(&self, request: QueryRequest) -> Result<Vec<StoredDocument>, DocumentStoreError> {
            self.inner.query(request).await
        }

        async fn delete(&self, id: &str, partition_key: &str) -> Result<bool, DocumentStoreError> {
            self.inner.delete(id, partition_key).await
        }
    }

    async fn active_counter(manager: &CounterManager<InMemoryDocumentStore>, value: i64, shards: u32) -> PrimaryCounter {
        let counter = manager.create_counter("test", value, shards).await.unwrap();
        manager.activate(&counter.id).await.unwrap().unwrap();
        counter
    }

    #[tokio::test]
    async fn create_counter_distributes_value() {
        let manager = CounterManager::new(InMemoryDocumentStore::new());
        let counter = manager.create_counter("C1", 100, 3).await.unwrap();

        assert_eq!(counter.status, CounterStatus::Pending);

        let mut values: Vec<_> = manager
            .shard_store()
            .list_shards(&counter.id, true, ShardSort::Ascending)
            .await
            .unwrap()
            .iter()
            .map(|s| s.value)
            .collect();
        values.sort_unstable();
        assert_eq!(values, vec![33, 33, 34]);
        assert_eq!(manager.active_total(&counter.id).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn activate_transitions_pending_to_active() {
        let manager = CounterManager::new(InMemoryDocumentStore::new());
        let counter = manager.create_counter("C1", 10, 2).await.unwrap();

        let activated = manager.activate(&counter.id).await.unwrap().unwrap();
        assert_eq!(activated.status, CounterStatus::Active);

        // Already active: expected rejection.
        assert!(manager.activate(&counter.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn split_conserves_total_and_adds_shards() {
        let manager = CounterManager::new(InMemoryDocumentStore::new());
        let counter = active_counter(&manager, 100, 3).await;

        let shards = manager.split(&counter.id, 2).await.unwrap().unwrap();
        assert_eq!(shards.len(), 5);
        assert_eq!(manager.active_total(&counter.id).await.unwrap(), 100);

        // Counter handed back to rotation.
        let pc = manager.read_counter(&counter.id).await.unwrap().unwrap();
        assert_eq!(pc.status, CounterStatus::Active);
    }

    #[tokio::test]
    async fn split_busy_counter_returns_none() {
        let manager = CounterManager::new(InMemoryDocumentStore::new());
        let counter = active_counter(&manager, 100, 3).await;

        // Simulate a concurrent rebalance holding the advisory lock.
        let pc = manager.read_counter(&counter.id).await.unwrap().unwrap();
        manager
            .shard_store()
            .update_primary_status(&pc, CounterStatus::Updating)
            .await
            .unwrap()
            .unwrap();

        assert!(manager.split(&counter.id, 1).await.unwrap().is_none());
        assert!(manager.merge(&counter.id, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_split_repair_still_releases_the_counter() {
        let inner = InMemoryDocumentStore::new();
        let manager = CounterManager::new(inner.clone());
        let counter = active_counter(&manager, 50, 1).await;
        let shard = manager
            .shard_store()
            .list_shards(&counter.id, true, ShardSort::Unsorted)
            .await
            .unwrap()
            .remove(0);

        // Sibling creation fails and the original shard can no longer be
        // read back, so the halved value cannot be restored.
        let faulty = CounterManager::new(Arc::new(SplitFaultStore {
            inner,
            fail_on: Mutex::new(Some(shard.id.clone())),
        }));

        let err = faulty.split(&counter.id, 1).await.unwrap_err();
        assert!(matches!(err, CounterError::SplitRepairFailed { .. }));

        // The advisory lock was handed back even though the repair
        // escalated, so later rebalances are not wedged.
        let pc = manager.read_counter(&counter.id).await.unwrap().unwrap();
        assert_eq!(pc.status, CounterStatus::Active);
    }

    #[tokio::test]
    async fn merge_conserves_total_and_removes_shards() {
        let manager = CounterManager::new(InMemoryDocumentStore::new());
        let counter = active_counter(&manager, 100, 4).await;

        let shards = manager.merge(&counter.id, 1).await.unwrap().unwrap();
        assert_eq!(shards.len(), 3);
        assert_eq!(manager.active_total(&counter.id).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn merge_tombstones_are_soft() {
        let manager = CounterManager::new(InMemoryDocumentStore::new());
        let counter = active_counter(&manager, 100, 4).await;

        manager.merge(&counter.id, 1).await.unwrap().unwrap();

        // The merged-away shard still exists as a Deleted record.
        let all = manager
            .shard_store()
            .list_shards(&counter.id, false, ShardSort::Unsorted)
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all.iter().filter(|s| s.status == CounterStatus::Deleted).count(), 1);
    }

    #[tokio::test]
    async fn split_then_merge_roundtrip_conserves_value() {
        let manager = CounterManager::new(InMemoryDocumentStore::new());
        let counter = active_counter(&manager, 100, 3).await;

        manager.split(&counter.id, 3).await.unwrap().unwrap();
        assert_eq!(manager.active_total(&counter.id).await.unwrap(), 100);

        manager.merge(&counter.id, 3).await.unwrap().unwrap();
        assert_eq!(manager.active_total(&counter.id).await.unwrap(), 100);

        let active = manager
            .shard_store()
            .list_shards(&counter.id, true, ShardSort::Unsorted)
            .await
            .unwrap();
        assert_eq!(active.len(), 3);
    }

    #[tokio::test]
    async fn merge_low_value_consolidates_small_shards() {
        let manager = CounterManager::new(InMemoryDocumentStore::new());
        // 40 over 4 shards: each holds 10, all under the threshold of 15.
        let counter = active_counter(&manager, 40, 4).await;

        manager.merge_low_value(&counter.id).await.unwrap();

        assert_eq!(manager.active_total(&counter.id).await.unwrap(), 40);
        let active = manager
            .shard_store()
            .list_shards(&counter.id, true, ShardSort::Unsorted)
            .await
            .unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn merge_low_value_leaves_large_shards_alone() {
        let manager = CounterManager::new(InMemoryDocumentStore::new());
        let counter = active_counter(&manager, 400, 4).await;

        manager.merge_low_value(&counter.id).await.unwrap();

        let active = manager
            .shard_store()
            .list_shards(&counter.id, true, ShardSort::Unsorted)
            .await
            .unwrap();
        assert_eq!(active.len(), 4);
        assert_eq!(manager.active_total(&counter.id).await.unwrap(), 400);
    }

    #[tokio::test]
    async fn merge_low_value_on_single_shard_is_noop() {
        let manager = CounterManager::new(InMemoryDocumentStore::new());
        let counter = active_counter(&manager, 5, 1).await;

        manager.merge_low_value(&counter.id).await.unwrap();
        assert_eq!(manager.active_total(&counter.id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn conservation_across_mixed_operations() {
        let manager = CounterManager::new(InMemoryDocumentStore::new());
        let counter = active_counter(&manager, 100, 3).await;
        let store = manager.shard_store();

        // Decrement 10 in total.
        let mut remaining = 10i64;
        while remaining > 0 {
            let shards = store.list_shards(&counter.id, true, ShardSort::Descending).await.unwrap();
            let target = &shards[0];
            if store.decrement_shard(&counter.id, &target.id, 1).await.unwrap().is_some() {
                remaining -= 1;
            }
        }

        manager.split(&counter.id, 2).await.unwrap().unwrap();
        manager.merge(&counter.id, 1).await.unwrap().unwrap();

        assert_eq!(manager.active_total(&counter.id).await.unwrap(), 90);
    }
}
