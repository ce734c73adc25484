//! Rebalance Network Protocol
//!
//! Internal endpoints that keep shard maps converged and move documents
//! between layouts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::membership::types::NodeId;
use crate::sharding::types::{ShardMapEntry, ShardRef};
use crate::storage::types::Document;

// --- API Endpoints ---

/// `GET` returns the full local map, `POST` offers entries to install.
pub const ENDPOINT_SHARD_MAP: &str = "/internal/shard-map";
/// Propagates a newly created database.
pub const ENDPOINT_DATABASE: &str = "/internal/database";
/// Documents re-homed by a reshard, sent to an owner of their new shard.
pub const ENDPOINT_MIGRATE: &str = "/internal/migrate";
/// Administrative removal relayed to peers that missed the gossip.
pub const ENDPOINT_NODE_REMOVED: &str = "/internal/node-removed";

// --- Data Transfer Objects ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMapDump {
    pub databases: BTreeSet<String>,
    pub entries: Vec<ShardMapEntry>,
    pub removed_nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMapPush {
    pub from: NodeId,
    pub entries: Vec<ShardMapEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMapPushResponse {
    /// Entries that superseded the receiver's copy.
    pub installed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseResponse {
    pub name: String,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateRequest {
    pub shard: ShardRef,
    /// Shard count of the layout the sender computed `shard` under.
    pub num_shards: u32,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateResponse {
    pub adopted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRemovedNotice {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRemovedResponse {
    pub newly_removed: bool,
}
