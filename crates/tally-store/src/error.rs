//! Error taxonomy at the document store boundary.

use snafu::Snafu;

/// Errors from document store operations.
///
/// `NotFound`, `Conflict` and `PreconditionFailed` are expected outcomes
/// under normal contention; callers handle them as signals. `Transport`
/// covers everything unexpected (network, auth, throttling past the store's
/// own retry budget) and propagates as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum DocumentStoreError {
    /// The document does not exist (or its TTL already expired).
    #[snafu(display("document '{id}' not found"))]
    NotFound {
        /// The missing document id.
        id: String,
    },

    /// A create raced with an existing document.
    #[snafu(display("document '{id}' already exists"))]
    Conflict {
        /// The contested document id.
        id: String,
    },

    /// A conditional write was rejected: etag mismatch or predicate false.
    #[snafu(display("precondition failed for document '{id}'"))]
    PreconditionFailed {
        /// The document the write targeted.
        id: String,
    },

    /// Document id or partition key was empty.
    #[snafu(display("document id and partition key must not be empty"))]
    EmptyId,

    /// Stored data is unparseable or a patch targeted a non-numeric field.
    #[snafu(display("corrupted document '{id}': {reason}"))]
    Corrupted {
        /// The offending document id.
        id: String,
        /// What went wrong.
        reason: String,
    },

    /// Unexpected store failure. Fatal; never retried by the services.
    #[snafu(display("document store transport error: {reason}"))]
    Transport {
        /// Human-readable description of the failure.
        reason: String,
    },
}

impl DocumentStoreError {
    /// True for the outcomes expected under contention, which callers treat
    /// as signals rather than failures.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            DocumentStoreError::NotFound { .. }
                | DocumentStoreError::Conflict { .. }
                | DocumentStoreError::PreconditionFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = DocumentStoreError::NotFound { id: "s1".to_string() };
        assert_eq!(err.to_string(), "document 's1' not found");
    }

    #[test]
    fn precondition_failed_display() {
        let err = DocumentStoreError::PreconditionFailed { id: "s1".to_string() };
        assert_eq!(err.to_string(), "precondition failed for document 's1'");
    }

    #[test]
    fn expected_kinds() {
        assert!(DocumentStoreError::NotFound { id: "a".into() }.is_expected());
        assert!(DocumentStoreError::Conflict { id: "a".into() }.is_expected());
        assert!(DocumentStoreError::PreconditionFailed { id: "a".into() }.is_expected());
        assert!(!DocumentStoreError::Transport { reason: "down".into() }.is_expected());
        assert!(!DocumentStoreError::EmptyId.is_expected());
    }
}
