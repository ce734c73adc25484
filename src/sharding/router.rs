use std::sync::Arc;

use super::map::ShardMap;
use super::types::{CollectionId, ShardAssignment, ShardId, ShardMapEntry, shard_for_key};
use crate::error::{ClusterError, ClusterResult};
use crate::membership::{service::MembershipService, types::NodeId};

/// Where a key lives under one shard-map entry.
#[derive(Debug, Clone)]
pub struct Route {
    pub collection: CollectionId,
    pub shard_id: ShardId,
    pub owners: Vec<NodeId>,
    pub pending: Vec<NodeId>,
    pub generation: u64,
}

/// Pure key -> (shard, owners) resolution against a single entry.
pub fn route_in(entry: &ShardMapEntry, key: &str) -> Route {
    let shard_id = shard_for_key(key, entry.num_shards);
    let assignment = entry.shard(shard_id).cloned().unwrap_or_default();
    Route {
        collection: entry.collection.clone(),
        shard_id,
        owners: assignment.owners,
        pending: assignment.pending,
        generation: entry.generation,
    }
}

pub struct Router {
    map: Arc<ShardMap>,
    membership: Arc<MembershipService>,
}

impl Router {
    pub fn new(map: Arc<ShardMap>, membership: Arc<MembershipService>) -> Self {
        Self { map, membership }
    }

    pub fn map(&self) -> &Arc<ShardMap> {
        &self.map
    }

    pub fn local_id(&self) -> &NodeId {
        self.membership.local_id()
    }

    /// Current entry for a collection, distinguishing an unknown database from
    /// an unconfigured collection.
    pub fn entry(&self, collection: &CollectionId) -> ClusterResult<Arc<ShardMapEntry>> {
        let snapshot = self.map.snapshot();
        if let Some(entry) = snapshot.entry(collection) {
            return Ok(entry.clone());
        }
        if !snapshot.databases.contains(&collection.database) {
            return Err(ClusterError::DatabaseNotFound(collection.database.clone()));
        }
        Err(ClusterError::CollectionNotConfigured(collection.to_string()))
    }

    pub fn route(&self, database: &str, collection: &str, key: &str) -> ClusterResult<Route> {
        let collection = CollectionId::new(database, collection);
        let entry = self.entry(&collection)?;
        Ok(route_in(&entry, key))
    }

    /// First alive owner. Falls back down the list when the listed primary is
    /// suspected.
    pub fn write_primary(&self, route: &Route) -> ClusterResult<NodeId> {
        route
            .owners
            .iter()
            .find(|owner| self.membership.is_alive(owner))
            .cloned()
            .ok_or_else(|| ClusterError::ShardUnavailable {
                collection: route.collection.to_string(),
                shard: route.shard_id,
            })
    }

    /// Owners in the order reads should try them: alive ones first, primary
    /// first, then suspected ones as a last resort. Pending owners never
    /// serve reads.
    pub fn read_candidates(&self, owners: &[NodeId]) -> Vec<NodeId> {
        let (mut alive, suspected): (Vec<NodeId>, Vec<NodeId>) = owners
            .iter()
            .filter(|owner| !self.membership.is_removed(owner))
            .cloned()
            .partition(|owner| self.membership.is_alive(owner));
        alive.extend(suspected);
        alive
    }

    /// Every other holder of the shard, pending owners included, that should
    /// receive replicated operations.
    pub fn replica_targets(&self, assignment: &ShardAssignment) -> Vec<NodeId> {
        let local = self.membership.local_id();
        assignment
            .owners
            .iter()
            .chain(assignment.pending.iter())
            .filter(|node| *node != local && !self.membership.is_removed(node))
            .cloned()
            .collect()
    }

    /// Shards of a collection this node owns or is receiving.
    pub fn local_shards(&self, entry: &ShardMapEntry) -> Vec<ShardId> {
        entry.shards_held_by(self.membership.local_id()).collect()
    }
}
