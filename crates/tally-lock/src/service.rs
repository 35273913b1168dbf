//! Lock acquisition over single-document conditional writes.
//!
//! The protocol never blocks and never spins on the store:
//!
//! 1. Read the lock record. If there is none, write your own lease and
//!    race to create the record; the creator holds token 1.
//! 2. A live rival holder keeps the lock and is reported back. Nothing is
//!    written for the losing caller, so an owner that released its lease
//!    stays released.
//! 3. Otherwise (unheld, lapsed holder, or the caller's own record) write
//!    the lease and rewrite the record with a single etag-guarded patch
//!    that sets the owner and bumps the fencing token. Losing that patch
//!    race just means someone else got there first; re-read and report
//!    the winner.
//!
//! Every ownership change goes through the token increment, a holder's
//! own renewal included, so tokens are strictly increasing for the
//! lifetime of the lock record and downstream resources can fence out
//! stale holders by comparing tokens.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tally_store::DocumentStore;
use tally_store::DocumentStoreError;
use tally_store::PatchOp;
use tally_store::WriteCondition;
use tracing::debug;

use crate::error::LockError;
use crate::model::DistributedLock;
use crate::model::Lease;
use crate::model::LeaseGrant;

/// Acquire, validate, and release distributed locks.
pub struct LockService<S: DocumentStore + ?Sized> {
    store: Arc<S>,
}

impl<S: DocumentStore + ?Sized> Clone for LockService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: DocumentStore + ?Sized> LockService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Try to take `lock_name` for `owner_id`, with liveness bounded by
    /// `duration`.
    ///
    /// Always returns the lock's current holder: compare the grant with
    /// [`LeaseGrant::is_held_by`] to learn whether the caller won. Calling
    /// again as the current holder renews the lease and mints a fresh
    /// token. `denied()` only when no holder could be established at all.
    pub async fn acquire_lease(
        &self,
        lock_name: &str,
        owner_id: &str,
        duration: Duration,
    ) -> Result<LeaseGrant, LockError> {
        let Some(lock) = self.read_lock(lock_name).await? else {
            // No record yet: back the claim with a lease, then race to
            // create the record.
            self.renew_lease(owner_id, duration).await?;
            let candidate = DistributedLock::new(lock_name, owner_id);
            return match self.store.create(candidate.to_document()?).await {
                Ok(_) => {
                    debug!(lock_name, owner_id, fence_token = 1, "lock created");
                    Ok(LeaseGrant::granted(1, owner_id))
                }
                Err(DocumentStoreError::Conflict { .. }) => {
                    // Lost the creation race; report whoever got there first.
                    match self.read_lock(lock_name).await? {
                        Some(winner) if !winner.owner_id.is_empty() => {
                            Ok(LeaseGrant::granted(winner.fence_token, winner.owner_id))
                        }
                        _ => Ok(LeaseGrant::denied()),
                    }
                }
                Err(e) => Err(e.into()),
            };
        };

        if lock.owner_id != owner_id
            && !lock.owner_id.is_empty()
            && self.lease_exists(&lock.owner_id).await?
        {
            // Held by a live rival. Report it without writing anything, so
            // a caller that already released its lease stays released.
            return Ok(LeaseGrant::granted(lock.fence_token, lock.owner_id));
        }

        // Unheld, lapsed, or the caller's own record: claim it through the
        // guarded increment so the token moves on every ownership change.
        self.renew_lease(owner_id, duration).await?;
        self.take_over(&lock, owner_id).await
    }

    /// Check that `owner_id` still holds `lock_name` at `fence_token`.
    ///
    /// False when the lock is unheld, held by someone else, or held at a
    /// different token (the caller's view is stale either way).
    pub async fn validate_lease(
        &self,
        lock_name: &str,
        owner_id: &str,
        fence_token: i64,
    ) -> Result<bool, LockError> {
        let holder = self.current_holder(lock_name).await?;
        Ok(holder.is_held_by(owner_id) && holder.fence_token == fence_token)
    }

    /// Report who currently holds `lock_name`.
    ///
    /// When the recorded owner's lease has lapsed, the owner field is
    /// cleared as a side effect so later readers see the lock as unheld
    /// even if no contender ever shows up.
    pub async fn current_holder(&self, lock_name: &str) -> Result<LeaseGrant, LockError> {
        let Some(lock) = self.read_lock(lock_name).await? else {
            return Ok(LeaseGrant::denied());
        };
        if lock.owner_id.is_empty() {
            return Ok(LeaseGrant::denied());
        }
        if self.lease_exists(&lock.owner_id).await? {
            return Ok(LeaseGrant::granted(lock.fence_token, lock.owner_id));
        }

        // Lapsed holder: clear the owner so the record reflects reality.
        // Losing this race means a contender already rewrote the record.
        let ops = vec![PatchOp::set("owner_id", Value::from(""))];
        let condition = WriteCondition::EtagMatches {
            etag: lock.etag.clone(),
        };
        match self.store.patch(lock_name, lock_name, ops, condition).await {
            Ok(_) => {
                debug!(lock_name, lapsed_owner = %lock.owner_id, "cleared lapsed lock owner");
            }
            Err(e) if e.is_expected() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(LeaseGrant::denied())
    }

    /// Give up liveness for `owner_id` by deleting its lease record.
    ///
    /// The lock record keeps naming the owner until a validate or a
    /// contending acquire notices the lease is gone. Returns whether a
    /// lease record existed.
    pub async fn release_lease(&self, owner_id: &str) -> Result<bool, LockError> {
        let released = self.store.delete(owner_id, owner_id).await?;
        if released {
            debug!(owner_id, "lease released");
        }
        Ok(released)
    }

    /// Restart the liveness window for `owner_id` without touching any
    /// lock record.
    pub async fn renew_lease(&self, owner_id: &str, duration: Duration) -> Result<(), LockError> {
        let lease = Lease::new(owner_id, duration);
        self.store.upsert(lease.to_document()?).await?;
        Ok(())
    }

    /// Displace a lapsed holder with one guarded write.
    async fn take_over(&self, lock: &DistributedLock, owner_id: &str) -> Result<LeaseGrant, LockError> {
        let ops = vec![
            PatchOp::set("owner_id", Value::from(owner_id)),
            PatchOp::increment("fence_token", 1),
        ];
        let condition = WriteCondition::EtagMatches {
            etag: lock.etag.clone(),
        };
        match self.store.patch(&lock.id, &lock.id, ops, condition).await {
            Ok(doc) => {
                let won = DistributedLock::from_document(&doc)?;
                debug!(lock_name = %lock.id, owner_id, fence_token = won.fence_token, "lock taken over");
                Ok(LeaseGrant::granted(won.fence_token, owner_id))
            }
            Err(e) if e.is_expected() => {
                // A rival takeover landed first; report whoever won.
                match self.read_lock(&lock.id).await? {
                    Some(winner) if !winner.owner_id.is_empty() => {
                        Ok(LeaseGrant::granted(winner.fence_token, winner.owner_id))
                    }
                    _ => Ok(LeaseGrant::denied()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_lock(&self, lock_name: &str) -> Result<Option<DistributedLock>, LockError> {
        match self.store.get(lock_name, lock_name).await {
            Ok(doc) => Ok(Some(DistributedLock::from_document(&doc)?)),
            Err(DocumentStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn lease_exists(&self, owner_id: &str) -> Result<bool, LockError> {
        match self.store.get(owner_id, owner_id).await {
            Ok(_) => Ok(true),
            Err(DocumentStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
