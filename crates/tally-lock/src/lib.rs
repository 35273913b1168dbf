//! Distributed lock with fencing tokens over a document store.
//!
//! Ownership is split across two records. The [`DistributedLock`] record is
//! durable and carries the holder plus a strictly increasing fencing token;
//! the [`Lease`] record is the holder's liveness proof and expires through
//! the store's TTL machinery. A holder is displaced the moment its lease
//! record is gone, with no timestamp comparison anywhere: existence of the
//! lease is the whole liveness protocol.
//!
//! All contention resolves through single-document conditional writes, so
//! any store with create-if-absent and etag-guarded patch semantics can
//! host these locks.

mod error;
mod model;
mod service;

pub use error::LockError;
pub use model::DistributedLock;
pub use model::Lease;
pub use model::LeaseGrant;
pub use model::LEASE_DOC_TYPE;
pub use model::LOCK_DOC_TYPE;
pub use service::LockService;
