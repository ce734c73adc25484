//! Replication Network Protocol
//!
//! Endpoints served on the replication listener and the DTOs exchanged over
//! them. All bodies are JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{ReplicationOperation, StreamPosition};
use crate::error::{ClusterError, ClusterResult};
use crate::membership::types::NodeId;
use crate::sharding::types::{ShardId, ShardRef};
use crate::storage::types::Document;

// --- API Endpoints ---

/// Batch of operations from one (origin, shard) stream.
pub const ENDPOINT_REPLICATE: &str = "/internal/replicate";
/// Write handed to an owner by a node that is not the acting primary.
pub const ENDPOINT_FORWARD_WRITE: &str = "/internal/forward-write";
/// Several writes for one shard, handed to an owner in one request.
pub const ENDPOINT_FORWARD_BATCH: &str = "/internal/forward-batch";
/// Missing operations for a shard, or a request to fall back to a snapshot.
pub const ENDPOINT_CATCH_UP: &str = "/internal/catch-up";
/// Consistent copy of a shard: `/internal/snapshot/:db/:coll/:shard`.
pub const ENDPOINT_SNAPSHOT: &str = "/internal/snapshot";
/// Direct read of one local copy: `/internal/read/:db/:coll/:shard/:key`.
pub const ENDPOINT_READ: &str = "/internal/read";

// --- Data Transfer Objects ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub from: NodeId,
    pub ops: Vec<ReplicationOperation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateResponse {
    /// Receiver's positions on the shard after applying the batch; they double
    /// as acknowledgements for log GC.
    pub positions: Vec<StreamPosition>,
    /// Set when the receiver saw a break in the stream and will heal.
    pub gap: bool,
}

/// Client-side intent of a keyed write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Mutation {
    Insert { value: Value },
    /// Replaces the whole value, creating the document when it is missing.
    Upsert { value: Value },
    /// Shallow merge of top-level fields into the current value.
    Update { patch: Value },
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardWriteRequest {
    pub database: String,
    pub collection: String,
    pub key: String,
    pub mutation: Mutation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub key: String,
    pub shard_id: ShardId,
    pub version: u64,
    pub served_by: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub key: String,
    pub mutation: Mutation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardBatchRequest {
    pub database: String,
    pub collection: String,
    pub items: Vec<BatchItem>,
}

/// Per-key result of a batch write. Exactly one of `version` and `error` is
/// set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchItemOutcome {
    pub key: String,
    pub shard_id: ShardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub served_by: Option<NodeId>,
    /// Error kind, as in error response bodies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItemOutcome {
    pub fn from_result(key: String, shard_id: ShardId, result: ClusterResult<WriteResponse>) -> Self {
        match result {
            Ok(write) => Self {
                key,
                shard_id,
                version: Some(write.version),
                served_by: Some(write.served_by),
                error: None,
            },
            Err(e) => Self::failed(key, shard_id, &e),
        }
    }

    pub fn failed(key: String, shard_id: ShardId, error: &ClusterError) -> Self {
        Self {
            key,
            shard_id,
            version: None,
            served_by: None,
            error: Some(error.kind().to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchUpRequest {
    pub requester: NodeId,
    pub shard: ShardRef,
    pub positions: Vec<StreamPosition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CatchUpResponse {
    Operations {
        ops: Vec<ReplicationOperation>,
        /// Server's own positions, so the requester can tell when it has
        /// caught up.
        positions: Vec<StreamPosition>,
    },
    SnapshotRequired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalReadResponse {
    pub document: Option<Document>,
    pub served_by: NodeId,
}

/// Keyed read as returned to clients. Reads may come from any owner, so the
/// response says who answered and whether the copy may lag the primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub served_by: NodeId,
    pub possibly_stale: bool,
}
