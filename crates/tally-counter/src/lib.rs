//! Sharded distributed counter over a document store.
//!
//! A logical counter is stored as one [`PrimaryCounter`] record plus N
//! independently addressable [`CounterShard`] records whose values sum to
//! the counter's total. Decrements hit a uniformly random shard through a
//! store-side conditional increment, so no cross-process lock is ever taken;
//! contention shows up as a conditional-write rejection and is resolved by
//! resampling a different shard on the next call.
//!
//! - [`ShardStore`] - CRUD over primary and shard records
//! - [`CounterManager`] - create/activate plus split/merge rebalancing
//! - [`DecrementService`] - the client-facing decrement path with a
//!   short-lived shard cache and a best-effort low-value merge trigger
//!
//! The invariant maintained across every operation: the sum of active shard
//! values (plus values captured in tombstoned-but-not-yet-folded shards
//! mid-merge) equals the counter's logical total.

pub mod constants;
mod error;
mod model;
pub mod pure;
mod rebalance;
mod service;
mod store;

pub use error::CounterError;
pub use model::CounterShard;
pub use model::CounterStatus;
pub use model::PrimaryCounter;
pub use model::COUNTER_SHARD_DOC_TYPE;
pub use model::PRIMARY_COUNTER_DOC_TYPE;
pub use rebalance::CounterManager;
pub use service::DecrementConfig;
pub use service::DecrementService;
pub use store::ShardSort;
pub use store::ShardStore;
