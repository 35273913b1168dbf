//! Structured patch operations and write conditions.
//!
//! Conditional writes are expressed as data rather than query strings so any
//! backend (or the in-memory test store) can evaluate them atomically with
//! the write. The evaluation helpers here are pure; store implementations
//! call them while holding whatever write exclusion they provide.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// A single field mutation applied atomically with its siblings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PatchOp {
    /// Replace (or insert) the field with the given value.
    Set { field: String, value: Value },
    /// Add `delta` to an integer field. Fails if the field is not numeric.
    Increment { field: String, delta: i64 },
}

impl PatchOp {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        PatchOp::Set {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn increment(field: impl Into<String>, delta: i64) -> Self {
        PatchOp::Increment {
            field: field.into(),
            delta,
        }
    }
}

/// Guard evaluated atomically with a patch.
///
/// `EtagMatches` is optimistic concurrency against the version tag; the
/// field predicates guard against document state (e.g. "still active and
/// holds enough value") without a read-then-write race.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteCondition {
    /// Unconditional.
    None,
    /// The stored etag must equal the supplied one.
    EtagMatches { etag: String },
    /// The field must equal the value.
    FieldEquals { field: String, value: Value },
    /// The field must not equal the value.
    FieldNotEquals { field: String, value: Value },
    /// The integer field must be at least `min`. A missing or non-numeric
    /// field fails the condition.
    FieldAtLeast { field: String, min: i64 },
    /// All sub-conditions must hold.
    All(Vec<WriteCondition>),
}

/// Evaluate a write condition against a document's fields and etag.
pub fn condition_holds(condition: &WriteCondition, fields: &Map<String, Value>, etag: &str) -> bool {
    match condition {
        WriteCondition::None => true,
        WriteCondition::EtagMatches { etag: expected } => etag == expected,
        WriteCondition::FieldEquals { field, value } => fields.get(field) == Some(value),
        WriteCondition::FieldNotEquals { field, value } => fields.get(field) != Some(value),
        WriteCondition::FieldAtLeast { field, min } => {
            matches!(fields.get(field).and_then(Value::as_i64), Some(v) if v >= *min)
        }
        WriteCondition::All(conditions) => conditions.iter().all(|c| condition_holds(c, fields, etag)),
    }
}

/// Apply patch operations to a document's fields in place.
///
/// Returns a description of the failure when an increment targets a missing
/// or non-numeric field; the caller maps it to a corruption error.
pub fn apply_patch_ops(fields: &mut Map<String, Value>, ops: &[PatchOp]) -> Result<(), String> {
    for op in ops {
        match op {
            PatchOp::Set { field, value } => {
                fields.insert(field.clone(), value.clone());
            }
            PatchOp::Increment { field, delta } => {
                let current = fields
                    .get(field)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| format!("increment target '{field}' is not an integer"))?;
                fields.insert(field.clone(), Value::from(current.saturating_add(*delta)));
            }
        }
    }
    Ok(())
}
