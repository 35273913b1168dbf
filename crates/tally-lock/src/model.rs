//! Lock and lease record types as stored in the document store.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tally_store::StoredDocument;

use crate::error::LockError;

/// Discriminator value for lock records.
pub const LOCK_DOC_TYPE: &str = "lock";
/// Discriminator value for lease records.
pub const LEASE_DOC_TYPE: &str = "lease";

/// The durable lock record: one per lock name, never expires.
///
/// Holding the record is not holding the lock. The lock is held by
/// `owner_id` only while that owner's [`Lease`] record exists; once the
/// lease lapses, any contender may take over and bump `fence_token`.
/// An empty `owner_id` means the lock is explicitly unheld.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DistributedLock {
    /// The lock name; also the partition key.
    pub id: String,
    /// Current holder, or empty when unheld.
    pub owner_id: String,
    /// Strictly increasing across ownership changes.
    pub fence_token: i64,
    /// Record kind discriminator.
    pub doc_type: String,
    /// Store-assigned version tag; empty until read back.
    #[serde(skip)]
    pub etag: String,
}

impl DistributedLock {
    /// A fresh lock record held by `owner_id` at the first fencing token.
    pub fn new(lock_name: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: lock_name.into(),
            owner_id: owner_id.into(),
            fence_token: 1,
            doc_type: LOCK_DOC_TYPE.to_string(),
            etag: String::new(),
        }
    }

    pub fn to_document(&self) -> Result<StoredDocument, LockError> {
        let body = serde_json::to_string(self)?;
        Ok(StoredDocument::new(self.id.clone(), self.id.clone(), body))
    }

    pub fn from_document(doc: &StoredDocument) -> Result<Self, LockError> {
        let mut lock: DistributedLock = serde_json::from_str(&doc.body).map_err(|e| LockError::Corrupted {
            id: doc.id.clone(),
            reason: e.to_string(),
        })?;
        lock.etag = doc.etag.clone();
        Ok(lock)
    }
}

/// Liveness proof for one owner, stored with a server-side TTL.
///
/// Its existence is the only thing that keeps a lock held; renewals simply
/// rewrite it, restarting the TTL window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    /// The owner id; also the partition key.
    pub id: String,
    /// Requested lease duration, mirrored into the document TTL.
    pub duration_secs: u32,
    /// Record kind discriminator.
    pub doc_type: String,
}

impl Lease {
    pub fn new(owner_id: impl Into<String>, duration: Duration) -> Self {
        Self {
            id: owner_id.into(),
            duration_secs: duration.as_secs().max(1) as u32,
            doc_type: LEASE_DOC_TYPE.to_string(),
        }
    }

    pub fn to_document(&self) -> Result<StoredDocument, LockError> {
        let body = serde_json::to_string(self)?;
        Ok(StoredDocument::new(self.id.clone(), self.id.clone(), body).with_ttl(self.duration_secs))
    }
}

/// The outcome of an acquire or validate call.
///
/// A valid grant names the owner currently holding the lock and the fencing
/// token minted for that ownership. Callers compare `owner` against their
/// own id to learn whether they won. A denied grant carries token `-1` and
/// an empty owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    /// Fencing token for the current ownership, or `-1` when denied.
    pub fence_token: i64,
    /// The holding owner, or empty when denied.
    pub owner: String,
}

impl LeaseGrant {
    pub fn granted(fence_token: i64, owner: impl Into<String>) -> Self {
        Self {
            fence_token,
            owner: owner.into(),
        }
    }

    /// No current holder could be established.
    pub fn denied() -> Self {
        Self {
            fence_token: -1,
            owner: String::new(),
        }
    }

    /// Whether this grant names a live holder.
    pub fn is_valid(&self) -> bool {
        self.fence_token >= 1 && !self.owner.is_empty()
    }

    /// Whether this grant means `owner_id` holds the lock.
    pub fn is_held_by(&self, owner_id: &str) -> bool {
        self.is_valid() && self.owner == owner_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_roundtrips_with_etag() {
        let lock = DistributedLock::new("jobs", "worker-1");
        let mut doc = lock.to_document().unwrap();
        doc.etag = "7".to_string();

        let read = DistributedLock::from_document(&doc).unwrap();
        assert_eq!(read.id, "jobs");
        assert_eq!(read.owner_id, "worker-1");
        assert_eq!(read.fence_token, 1);
        assert_eq!(read.etag, "7");
    }

    #[test]
    fn lease_document_carries_ttl() {
        let lease = Lease::new("worker-1", Duration::from_secs(30));
        let doc = lease.to_document().unwrap();
        assert_eq!(doc.ttl_seconds, Some(30));
        assert_eq!(doc.partition_key, "worker-1");
    }

    #[test]
    fn sub_second_lease_rounds_up_to_one_second() {
        let lease = Lease::new("worker-1", Duration::from_millis(10));
        assert_eq!(lease.duration_secs, 1);
    }

    #[test]
    fn denied_grant_is_not_valid() {
        let denied = LeaseGrant::denied();
        assert!(!denied.is_valid());
        assert!(!denied.is_held_by("anyone"));

        let granted = LeaseGrant::granted(3, "worker-2");
        assert!(granted.is_valid());
        assert!(granted.is_held_by("worker-2"));
        assert!(!granted.is_held_by("worker-1"));
    }
}
