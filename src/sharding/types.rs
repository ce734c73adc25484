use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::membership::types::NodeId;

pub type ShardId = u32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId {
    pub database: String,
    pub collection: String,
}

impl CollectionId {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.database, self.collection)
    }
}

/// A single shard of a collection; the unit of locking, replication streams
/// and snapshot transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardRef {
    pub collection: CollectionId,
    pub shard_id: ShardId,
}

impl ShardRef {
    pub fn new(collection: CollectionId, shard_id: ShardId) -> Self {
        Self {
            collection,
            shard_id,
        }
    }
}

impl fmt::Display for ShardRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.collection, self.shard_id)
    }
}

/// Ordered owners of one shard. `owners[0]` is the primary.
///
/// `pending` holds replacement owners whose snapshot is still streaming: they
/// receive replicated writes but do not serve reads until promoted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardAssignment {
    pub owners: Vec<NodeId>,
    #[serde(default)]
    pub pending: Vec<NodeId>,
}

impl ShardAssignment {
    pub fn primary(&self) -> Option<&NodeId> {
        self.owners.first()
    }

    pub fn holds(&self, node: &NodeId) -> bool {
        self.owners.contains(node) || self.pending.contains(node)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardMapEntry {
    pub collection: CollectionId,
    pub num_shards: u32,
    pub replication_factor: usize,
    /// Bumped on every change; the higher generation wins when two nodes
    /// exchange entries.
    pub generation: u64,
    pub assignment: BTreeMap<ShardId, ShardAssignment>,
}

impl ShardMapEntry {
    pub fn shard(&self, shard_id: ShardId) -> Option<&ShardAssignment> {
        self.assignment.get(&shard_id)
    }

    pub fn shard_ref(&self, shard_id: ShardId) -> ShardRef {
        ShardRef::new(self.collection.clone(), shard_id)
    }

    pub fn shards_held_by<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = ShardId> + 'a {
        self.assignment
            .iter()
            .filter(move |(_, assignment)| assignment.holds(node))
            .map(|(shard_id, _)| *shard_id)
    }

    /// Content fingerprint used to break ties between equal generations.
    pub fn fingerprint(&self) -> u64 {
        let mut canonical = format!(
            "{}|{}|{}|",
            self.collection, self.num_shards, self.replication_factor
        );
        for (shard_id, assignment) in &self.assignment {
            canonical.push_str(&shard_id.to_string());
            for owner in &assignment.owners {
                canonical.push(':');
                canonical.push_str(owner.as_str());
            }
            canonical.push('+');
            for pending in &assignment.pending {
                canonical.push(':');
                canonical.push_str(pending.as_str());
            }
            canonical.push(';');
        }
        stable_hash(canonical.as_bytes())
    }

    /// Whether `self` should replace `other` during map convergence.
    pub fn supersedes(&self, other: &ShardMapEntry) -> bool {
        (self.generation, self.fingerprint()) > (other.generation, other.fingerprint())
    }
}

/// Transient move list computed by the rebalancer for one shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebalancePlan {
    pub collection: CollectionId,
    pub shard_id: ShardId,
    pub moves: Vec<ShardMove>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardMove {
    /// Existing owner that streams the snapshot; `None` when every previous
    /// owner is gone and the shard restarts empty.
    pub from_node: Option<NodeId>,
    pub to_node: NodeId,
}

/// 64-bit FNV-1a. Unlike `DefaultHasher` its output is fixed across builds and
/// platforms, which the key -> shard mapping relies on.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

pub fn shard_for_key(key: &str, num_shards: u32) -> ShardId {
    if num_shards == 0 {
        return 0;
    }
    (stable_hash(key.as_bytes()) % u64::from(num_shards)) as ShardId
}
