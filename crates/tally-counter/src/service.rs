//! Client-side decrement path.
//!
//! Decrements pick a uniformly random active shard from a short-lived
//! local cache and issue one conditional write against it. A rejected
//! write is reported as `Ok(false)`; the caller retries and lands on a
//! different shard with high probability. The service never blocks on a
//! contended shard.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use rand::Rng;
use tally_store::DocumentStore;
use tracing::debug;
use tracing::warn;

use crate::constants::LOW_VALUE_MERGE_THRESHOLD;
use crate::constants::SHARD_CACHE_TTL;
use crate::error::CounterError;
use crate::model::CounterShard;
use crate::pure::needs_low_value_merge;
use crate::rebalance::CounterManager;
use crate::store::ShardSort;

/// Tuning knobs for [`DecrementService`].
#[derive(Debug, Clone, Copy)]
pub struct DecrementConfig {
    /// How long a fetched shard list is trusted before re-reading.
    pub cache_ttl: Duration,
    /// Shard values below this trigger a background consolidation.
    pub low_value_threshold: i64,
}

impl Default for DecrementConfig {
    fn default() -> Self {
        Self {
            cache_ttl: SHARD_CACHE_TTL,
            low_value_threshold: LOW_VALUE_MERGE_THRESHOLD,
        }
    }
}

struct CachedShards {
    shards: Vec<CounterShard>,
    fetched_at: Instant,
}

/// Issues decrements against randomly chosen shards of a counter.
pub struct DecrementService<S: DocumentStore + ?Sized> {
    manager: CounterManager<S>,
    config: DecrementConfig,
    cache: Mutex<HashMap<String, CachedShards>>,
}

impl<S: DocumentStore + ?Sized + 'static> DecrementService<S> {
    /// Create a service with default configuration.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, DecrementConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: DecrementConfig) -> Self {
        Self {
            manager: CounterManager::new(store),
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The manager this service consolidates through.
    pub fn manager(&self) -> &CounterManager<S> {
        &self.manager
    }

    /// Attempt to subtract `amount` from the counter.
    ///
    /// `Ok(true)` when the decrement landed. `Ok(false)` when the chosen
    /// shard rejected it, because it was paused, deleted, raced by a
    /// rebalance, or held less than `amount`; the caller should retry.
    pub async fn decrement(&self, counter_id: &str, amount: i64) -> Result<bool, CounterError> {
        let shards = self.active_shards(counter_id).await?;
        if shards.is_empty() {
            return Err(CounterError::NoActiveShards {
                counter_id: counter_id.to_string(),
            });
        }

        let pick = rand::rng().random_range(0..shards.len());
        let shard = &shards[pick];

        match self
            .manager
            .shard_store()
            .decrement_shard(counter_id, &shard.id, amount)
            .await?
        {
            Some(updated) => {
                debug!(counter_id, shard_id = %shard.id, amount, remaining = updated.value, "decrement applied");
                Ok(true)
            }
            None => {
                // The cached view is stale or the shard drained; drop it
                // and see whether the shard is worth consolidating.
                self.invalidate_cache(counter_id);
                self.maybe_consolidate(counter_id, &shard.id).await?;
                Ok(false)
            }
        }
    }

    /// Drop the cached shard list for a counter.
    pub fn invalidate_cache(&self, counter_id: &str) {
        self.cache.lock().unwrap().remove(counter_id);
    }

    /// Re-read the rejecting shard; if it is active but has fallen below
    /// the low-value threshold, kick off a background consolidation.
    async fn maybe_consolidate(&self, counter_id: &str, shard_id: &str) -> Result<(), CounterError> {
        let Some(fresh) = self.manager.shard_store().read_shard(shard_id, counter_id).await? else {
            return Ok(());
        };
        if !needs_low_value_merge(fresh.value, self.config.low_value_threshold) {
            return Ok(());
        }

        debug!(counter_id, shard_id, value = fresh.value, "shard below threshold, scheduling merge");
        let manager = self.manager.clone();
        let counter_id = counter_id.to_string();
        tokio::spawn(async move {
            // Best effort: a busy counter skips the merge on its own.
            if let Err(e) = manager.merge_low_value(&counter_id).await {
                warn!(counter_id = %counter_id, error = %e, "background low-value merge failed");
            }
        });
        Ok(())
    }

    /// Active shards for a counter, served from the local cache when still
    /// fresh. The lock is never held across an await.
    async fn active_shards(&self, counter_id: &str) -> Result<Vec<CounterShard>, CounterError> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.get(counter_id) {
                if cached.fetched_at.elapsed() < self.config.cache_ttl {
                    return Ok(cached.shards.clone());
                }
            }
        }

        let shards = self
            .manager
            .shard_store()
            .list_shards(counter_id, true, ShardSort::Unsorted)
            .await?;
        self.cache.lock().unwrap().insert(
            counter_id.to_string(),
            CachedShards {
                shards: shards.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(shards)
    }
}

#[cfg(test)]
mod tests {
    use tally_testing::InMemoryDocumentStore;

    use crate::model::CounterStatus;

    use super::*;

    async fn service_with_counter(value: i64, shards: u32) -> (DecrementService<InMemoryDocumentStore>, String) {
        let store = InMemoryDocumentStore::new();
        let service = DecrementService::new(store);
        let counter = service.manager().create_counter("test", value, shards).await.unwrap();
        service.manager().activate(&counter.id).await.unwrap().unwrap();
        (service, counter.id)
    }

    #[tokio::test]
    async fn decrement_reduces_total() {
        let (service, counter_id) = service_with_counter(100, 3).await;

        for _ in 0..10 {
            // Retry until the attempt lands on a shard with enough value.
            while !service.decrement(&counter_id, 1).await.unwrap() {}
        }

        assert_eq!(service.manager().active_total(&counter_id).await.unwrap(), 90);
    }

    #[tokio::test]
    async fn decrement_never_overdraws_a_shard() {
        let (service, counter_id) = service_with_counter(60, 3).await;

        // Each shard holds 20; a decrement of 25 cannot land anywhere.
        for _ in 0..20 {
            assert!(!service.decrement(&counter_id, 25).await.unwrap());
        }
        assert_eq!(service.manager().active_total(&counter_id).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn decrement_rejected_on_paused_shard() {
        let (service, counter_id) = service_with_counter(50, 1).await;
        let store = service.manager().shard_store();

        // Warm the cache while the shard is still active, then pause it
        // behind the service's back.
        assert!(service.decrement(&counter_id, 1).await.unwrap());
        let shard = store
            .list_shards(&counter_id, true, ShardSort::Unsorted)
            .await
            .unwrap()
            .remove(0);
        store.update_shard_status(&shard, CounterStatus::Paused).await.unwrap().unwrap();

        // The stale cached pick hits the paused shard and is rejected
        // without touching its value.
        assert!(!service.decrement(&counter_id, 1).await.unwrap());
        assert_eq!(store.read_shard(&shard.id, &counter_id).await.unwrap().unwrap().value, 49);

        // The rejection dropped the cache; a fresh view has nothing active.
        let err = service.decrement(&counter_id, 1).await.unwrap_err();
        assert!(matches!(err, CounterError::NoActiveShards { .. }));
    }

    #[tokio::test]
    async fn missing_counter_reports_no_active_shards() {
        let store = InMemoryDocumentStore::new();
        let service = DecrementService::new(store);

        let err = service.decrement("nope", 1).await.unwrap_err();
        assert!(matches!(err, CounterError::NoActiveShards { .. }));
    }

    #[tokio::test]
    async fn stale_cache_is_refreshed_after_invalidation() {
        let (service, counter_id) = service_with_counter(20, 2).await;

        // Warm the cache, then split behind the service's back.
        assert!(service.decrement(&counter_id, 1).await.unwrap());
        service.manager().split(&counter_id, 2).await.unwrap().unwrap();
        service.invalidate_cache(&counter_id);

        let shards = service.active_shards(&counter_id).await.unwrap();
        assert_eq!(shards.len(), 4);
    }

    #[tokio::test]
    async fn drained_counter_rejects_every_decrement() {
        let (service, counter_id) = service_with_counter(3, 3).await;

        let mut landed = 0;
        for _ in 0..200 {
            if service.decrement(&counter_id, 1).await.unwrap() {
                landed += 1;
            }
            if landed == 3 {
                break;
            }
            service.invalidate_cache(&counter_id);
        }
        assert_eq!(landed, 3);
        assert_eq!(service.manager().active_total(&counter_id).await.unwrap(), 0);

        // Fully drained: nothing left to take.
        assert!(!service.decrement(&counter_id, 1).await.unwrap());
    }
}
