use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::membership::types::NodeId;

/// Total order used for last-writer-wins.
///
/// `version` decides; `timestamp` and `origin` only break ties between writes
/// that reached the same version on different primaries during a failover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Stamp {
    pub version: u64,
    pub timestamp: u64,
    pub origin: NodeId,
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A stored document. Deletes leave a tombstone (`deleted = true`) so a late,
/// lower-versioned write cannot bring the document back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub key: String,
    pub value: Value,
    pub stamp: Stamp,
    #[serde(default)]
    pub deleted: bool,
}

impl Document {
    pub fn version(&self) -> u64 {
        self.stamp.version
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// What happened when a document was offered to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The stored copy already carries an equal or newer stamp.
    Superseded,
}

/// Last-writer-wins: `incoming` replaces `existing` only with a strictly
/// greater stamp, which makes re-applying the same write a no-op.
pub fn wins_over(incoming: &Document, existing: Option<&Document>) -> bool {
    match existing {
        Some(existing) => incoming.stamp > existing.stamp,
        None => true,
    }
}

/// Shallow merge used by updates: top-level fields of `patch` overwrite those
/// of `base`. A non-object on either side replaces the value wholesale.
pub fn merge_patch(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged = base.clone();
            for (field, value) in patch {
                merged.insert(field.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}
