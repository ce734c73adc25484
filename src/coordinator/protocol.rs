use serde::{Deserialize, Serialize};

use super::types::ShardQuery;
use crate::sharding::types::ShardRef;

/// Runs a `ShardQuery` against the receiver's copy of one shard.
pub const ENDPOINT_QUERY: &str = "/internal/query";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardQueryRequest {
    pub shard: ShardRef,
    pub query: ShardQuery,
}
