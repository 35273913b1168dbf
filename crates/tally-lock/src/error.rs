use snafu::Snafu;
use tally_store::DocumentStoreError;

/// Failures surfaced by lock operations.
///
/// Losing a lock race is not an error; it comes back through
/// [`LeaseGrant`](crate::LeaseGrant) as a grant naming the winner.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LockError {
    /// A stored lock record failed to deserialize.
    #[snafu(display("lock record {id} is corrupted: {reason}"))]
    Corrupted { id: String, reason: String },

    /// The document store rejected or failed an operation.
    #[snafu(display("document store operation failed: {source}"))]
    Storage { source: DocumentStoreError },

    /// A lock record failed to serialize.
    #[snafu(display("lock record serialization failed: {source}"))]
    Serialization { source: serde_json::Error },
}

impl From<DocumentStoreError> for LockError {
    fn from(source: DocumentStoreError) -> Self {
        LockError::Storage { source }
    }
}

impl From<serde_json::Error> for LockError {
    fn from(source: serde_json::Error) -> Self {
        LockError::Serialization { source }
    }
}
