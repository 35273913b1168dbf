//! Tunables for the counter services.

use std::time::Duration;

/// A shard observed below this value after a rejected decrement triggers the
/// low-value merge maintenance routine.
pub const LOW_VALUE_MERGE_THRESHOLD: i64 = 15;

/// How long the operational service trusts its cached active-shard list.
pub const SHARD_CACHE_TTL: Duration = Duration::from_secs(30);

/// Attempts to restore a shard when the second half of a split or merge
/// fails. Exhausting these raises a consistency fault.
pub const REPAIR_RETRY_ATTEMPTS: u32 = 5;
