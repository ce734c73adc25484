//! Client API
//!
//! Routes served on the client listener and their request/response bodies.
//! Collection topology bodies accept the camelCase field names the admin
//! tooling sends (`numShards`, `replicationFactor`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;

use crate::membership::types::{Node, NodeId, NodeStatus};
use crate::replication::protocol::BatchItemOutcome;
use crate::sharding::types::{ShardId, ShardMapEntry};

// --- API Endpoints ---

pub const ENDPOINT_HEALTH: &str = "/_api/health";
pub const ENDPOINT_CLUSTER_STATUS: &str = "/_api/cluster/status";
pub const ENDPOINT_REMOVE_NODE: &str = "/_api/cluster/remove-node";
pub const ENDPOINT_REBALANCE: &str = "/_api/cluster/rebalance";
pub const ENDPOINT_DATABASE: &str = "/_api/database";
/// `POST /_api/database/:db/collection`
pub const ENDPOINT_COLLECTION: &str = "/_api/database/:db/collection";
pub const ENDPOINT_COLLECTION_PROPERTIES: &str = "/_api/database/:db/collection/:coll/properties";
pub const ENDPOINT_COLLECTION_RESHARD: &str = "/_api/database/:db/collection/:coll/reshard";
pub const ENDPOINT_COLLECTION_SHARDING: &str = "/_api/database/:db/collection/:coll/sharding";
pub const ENDPOINT_COLLECTION_COUNT: &str = "/_api/database/:db/collection/:coll/count";
pub const ENDPOINT_COLLECTION_LOCAL_COUNT: &str = "/_api/database/:db/collection/:coll/local-count";
/// `POST` inserts one document, `PUT` writes a batch.
pub const ENDPOINT_DOCUMENTS: &str = "/_api/document/:db/:coll";
/// `GET` reads, `PUT` upserts, `PATCH` updates, `DELETE` deletes.
pub const ENDPOINT_DOCUMENT: &str = "/_api/document/:db/:coll/:key";
pub const ENDPOINT_QUERY: &str = "/_api/query/:db/:coll";

// --- Data Transfer Objects ---

/// Defaults for collections created without explicit topology.
#[derive(Debug, Clone, Copy)]
pub struct CollectionDefaults {
    pub num_shards: u32,
    pub replication_factor: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberStatus {
    pub id: NodeId,
    pub client_addr: SocketAddr,
    pub replication_addr: SocketAddr,
    pub status: NodeStatus,
    pub incarnation: u64,
}

impl From<Node> for MemberStatus {
    fn from(node: Node) -> Self {
        Self {
            id: node.id,
            client_addr: node.client_addr,
            replication_addr: node.replication_addr,
            status: node.status,
            incarnation: node.incarnation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStatus {
    pub shard_id: ShardId,
    pub owners: Vec<NodeId>,
    pub pending: Vec<NodeId>,
    /// Live documents in this node's copy, if it has one.
    pub local_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub database: String,
    pub collection: String,
    pub num_shards: u32,
    pub replication_factor: usize,
    pub generation: u64,
    pub resharding: bool,
    pub shards: Vec<ShardStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatusResponse {
    pub node_id: NodeId,
    pub map_version: u64,
    pub members: Vec<MemberStatus>,
    pub databases: Vec<String>,
    pub collections: Vec<CollectionStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveNodeRequest {
    /// Client or replication address of the node; a node id also works.
    pub node_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveNodeResponse {
    pub node_id: NodeId,
    pub newly_removed: bool,
    /// Members still part of the cluster after the removal.
    pub remaining: Vec<MemberStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceResponse {
    pub plans: usize,
    pub moves: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCollectionRequest {
    pub name: String,
    #[serde(default, alias = "numShards")]
    pub num_shards: Option<u32>,
    #[serde(default, alias = "replicationFactor")]
    pub replication_factor: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionPropertiesRequest {
    pub num_shards: u32,
    pub replication_factor: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReshardRequest {
    pub num_shards: u32,
    #[serde(default)]
    pub replication_factor: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
    pub partial: bool,
    pub missing_shards: Vec<ShardId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCountResponse {
    pub node_id: NodeId,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertDocumentRequest {
    #[serde(alias = "_key")]
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDocument {
    /// Generated when omitted.
    #[serde(default, alias = "_key")]
    pub key: Option<String>,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchWriteRequest {
    pub documents: Vec<BatchDocument>,
    /// Replace existing documents instead of rejecting them.
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchWriteResponse {
    pub written: usize,
    pub failed: usize,
    pub results: Vec<BatchItemOutcome>,
}

impl CollectionStatus {
    pub fn from_entry(entry: &ShardMapEntry, resharding: bool, local_count: impl Fn(ShardId) -> usize) -> Self {
        Self {
            database: entry.collection.database.clone(),
            collection: entry.collection.collection.clone(),
            num_shards: entry.num_shards,
            replication_factor: entry.replication_factor,
            generation: entry.generation,
            resharding,
            shards: entry
                .assignment
                .iter()
                .map(|(shard_id, assignment)| ShardStatus {
                    shard_id: *shard_id,
                    owners: assignment.owners.clone(),
                    pending: assignment.pending.clone(),
                    local_count: local_count(*shard_id),
                })
                .collect(),
        }
    }
}
