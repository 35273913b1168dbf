//! The document store trait.

use std::sync::Arc;

use async_trait::async_trait;

use crate::document::QueryRequest;
use crate::document::StoredDocument;
use crate::error::DocumentStoreError;
use crate::patch::PatchOp;
use crate::patch::WriteCondition;

/// Async document store with single-document optimistic concurrency.
///
/// This is the only cross-process synchronization primitive the coordination
/// services rely on: a conditional patch either observes the guard and
/// applies atomically, or fails with
/// [`DocumentStoreError::PreconditionFailed`]. No ordering is guaranteed
/// across different documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point-read a document. Absent documents (including TTL-expired ones)
    /// yield [`DocumentStoreError::NotFound`].
    async fn get(&self, id: &str, partition_key: &str) -> Result<StoredDocument, DocumentStoreError>;

    /// Create a document. Fails with [`DocumentStoreError::Conflict`] if the
    /// id already exists in the partition (first-writer-wins).
    async fn create(&self, doc: StoredDocument) -> Result<StoredDocument, DocumentStoreError>;

    /// Create or replace a document unconditionally.
    async fn upsert(&self, doc: StoredDocument) -> Result<StoredDocument, DocumentStoreError>;

    /// Apply patch operations atomically, guarded by `condition`. A failed
    /// guard yields [`DocumentStoreError::PreconditionFailed`] and leaves the
    /// document untouched.
    async fn patch(
        &self,
        id: &str,
        partition_key: &str,
        ops: Vec<PatchOp>,
        condition: WriteCondition,
    ) -> Result<StoredDocument, DocumentStoreError>;

    /// Query documents in one partition. Filters are conjunctive.
    async fn query(&self, request: QueryRequest) -> Result<Vec<StoredDocument>, DocumentStoreError>;

    /// Delete a document. Returns whether it existed.
    async fn delete(&self, id: &str, partition_key: &str) -> Result<bool, DocumentStoreError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    async fn get(&self, id: &str, partition_key: &str) -> Result<StoredDocument, DocumentStoreError> {
        (**self).get(id, partition_key).await
    }

    async fn create(&self, doc: StoredDocument) -> Result<StoredDocument, DocumentStoreError> {
        (**self).create(doc).await
    }

    async fn upsert(&self, doc: StoredDocument) -> Result<StoredDocument, DocumentStoreError> {
        (**self).upsert(doc).await
    }

    async fn patch(
        &self,
        id: &str,
        partition_key: &str,
        ops: Vec<PatchOp>,
        condition: WriteCondition,
    ) -> Result<StoredDocument, DocumentStoreError> {
        (**self).patch(id, partition_key, ops, condition).await
    }

    async fn query(&self, request: QueryRequest) -> Result<Vec<StoredDocument>, DocumentStoreError> {
        (**self).query(request).await
    }

    async fn delete(&self, id: &str, partition_key: &str) -> Result<bool, DocumentStoreError> {
        (**self).delete(id, partition_key).await
    }
}
