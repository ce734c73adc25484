use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::membership::types::NodeId;
use crate::sharding::types::{CollectionId, ShardId, ShardRef};
use crate::storage::types::{Document, Stamp};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

/// One committed write, as shipped to the other holders of its shard.
///
/// `payload` is the full resulting document value (not a patch), so applying
/// an operation never depends on the receiver's previous state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationOperation {
    /// Monotonic per origin node, across all shards.
    pub op_id: u64,
    /// Previous op id of the same (origin, shard) stream; 0 for the first.
    pub prev_op_id: u64,
    pub database: String,
    pub collection: String,
    pub shard_id: ShardId,
    pub op_type: OpType,
    pub key: String,
    pub payload: Value,
    pub version: u64,
    pub origin_node: NodeId,
    /// Hybrid logical timestamp from the origin's [`HybridClock`].
    pub timestamp: u64,
}

impl ReplicationOperation {
    pub fn collection_id(&self) -> CollectionId {
        CollectionId::new(self.database.clone(), self.collection.clone())
    }

    pub fn shard_ref(&self) -> ShardRef {
        ShardRef::new(self.collection_id(), self.shard_id)
    }

    pub fn stream(&self) -> StreamId {
        StreamId {
            origin: self.origin_node.clone(),
            shard: self.shard_ref(),
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp {
            version: self.version,
            timestamp: self.timestamp,
            origin: self.origin_node.clone(),
        }
    }

    pub fn to_document(&self) -> Document {
        let deleted = self.op_type == OpType::Delete;
        Document {
            key: self.key.clone(),
            value: if deleted {
                Value::Null
            } else {
                self.payload.clone()
            },
            stamp: self.stamp(),
            deleted,
        }
    }
}

/// One ordered replication stream: the writes a single origin committed on a
/// single shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    pub origin: NodeId,
    pub shard: ShardRef,
}

/// Last op id applied contiguously for one origin on a shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamPosition {
    pub origin: NodeId,
    pub op_id: u64,
}

/// Result of offering an operation to the replication log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequencing {
    /// Extends the stream; the watermark advanced.
    InOrder,
    /// Already at or below the watermark.
    Duplicate,
    /// `prev_op_id` is ahead of the watermark: something was missed.
    Gap,
    /// The key belongs to another shard under the local layout (a reshard is
    /// in flight); the document was applied there, outside any stream.
    Rerouted,
}

/// Consistent copy of one shard: documents (tombstones included) plus the
/// stream positions they reflect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub shard: ShardRef,
    pub documents: Vec<Document>,
    pub positions: Vec<StreamPosition>,
}

/// Bits of a hybrid timestamp holding the logical counter.
const LOGICAL_BITS: u32 = 16;

/// Hybrid logical clock packed into a `u64`: wall-clock milliseconds in the
/// high bits, a logical counter in the low [`LOGICAL_BITS`].
///
/// Every timestamp it issues is greater than any it issued or observed
/// before, so a write stamped after seeing another one always orders after
/// it, whatever the two nodes' wall clocks say.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> u64 {
        let physical = wall_clock_ms() << LOGICAL_BITS;
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = physical.max(current + 1);
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Folds in a timestamp carried by a remote write.
    pub fn observe(&self, remote: u64) {
        self.last.fetch_max(remote, Ordering::SeqCst);
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
