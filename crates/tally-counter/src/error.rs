//! Error types for the counter services.

use snafu::Snafu;
use tally_store::DocumentStoreError;

/// Errors from counter operations.
///
/// Conditional-write rejections under contention are not errors; they come
/// back as `Ok(None)` / `Ok(false)` from the operations that expect them.
/// The variants here are the unexpected cases.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CounterError {
    /// A split created no sibling and the original shard could not be
    /// restored. The shard set may no longer conserve the counter total.
    #[snafu(display("split repair failed for shard '{shard_id}': original value not restored"))]
    SplitRepairFailed {
        /// The shard whose value was halved.
        shard_id: String,
    },

    /// A merge tombstoned its source shard but the captured value could not
    /// be folded into the target, and the source could not be un-deleted.
    #[snafu(display("merge repair failed: value from '{source_id}' not folded into '{target_id}'"))]
    MergeRepairFailed {
        /// The shard receiving the folded value.
        target_id: String,
        /// The tombstoned shard the value came from.
        source_id: String,
    },

    /// A counter has no active shards to decrement.
    #[snafu(display("counter '{counter_id}' has no active shards"))]
    NoActiveShards {
        /// The counter id.
        counter_id: String,
    },

    /// Stored record did not deserialize into the expected shape.
    #[snafu(display("corrupted counter record '{id}': {reason}"))]
    Corrupted {
        /// The record id.
        id: String,
        /// What went wrong.
        reason: String,
    },

    /// Underlying store failure (fatal; propagates).
    #[snafu(display("document store error: {source}"))]
    Storage {
        /// The underlying error.
        source: DocumentStoreError,
    },

    /// JSON serialization error.
    #[snafu(display("serialization error: {source}"))]
    Serialization {
        /// The underlying error.
        source: serde_json::Error,
    },
}

impl From<DocumentStoreError> for CounterError {
    fn from(source: DocumentStoreError) -> Self {
        CounterError::Storage { source }
    }
}

impl From<serde_json::Error> for CounterError {
    fn from(source: serde_json::Error) -> Self {
        CounterError::Serialization { source }
    }
}
