//! Document store contract for the tally coordination services.
//!
//! The counter and lock services coordinate exclusively through a document
//! store that offers atomic single-document conditional writes. This crate
//! defines that boundary:
//!
//! - [`DocumentStore`] - the async storage trait
//! - [`StoredDocument`] - a JSON document envelope with an opaque etag
//! - [`PatchOp`] / [`WriteCondition`] - structured conditional patches
//! - [`QueryRequest`] / [`FieldFilter`] / [`SortOrder`] - partition queries
//! - [`DocumentStoreError`] - the error taxonomy at the boundary
//!
//! Every write stamps a fresh etag on the document; conditional writes are
//! guarded either by an etag match or by a predicate over the document's
//! fields, evaluated atomically with the write. Documents may carry a TTL
//! after which the store deletes them on its own (used for lease records).

mod document;
mod error;
mod patch;
mod traits;

pub use document::FieldFilter;
pub use document::QueryRequest;
pub use document::SortOrder;
pub use document::StoredDocument;
pub use error::DocumentStoreError;
pub use patch::apply_patch_ops;
pub use patch::condition_holds;
pub use patch::PatchOp;
pub use patch::WriteCondition;
pub use traits::DocumentStore;
