//! Cluster failure taxonomy.
//!
//! Peer communication failures are recoverable: `NodeUnreachable` is retried by
//! the caller, `ShardUnavailable` is surfaced only when no owner of a shard can
//! be reached, and `RebalanceIncomplete` is logged and retried on the next
//! topology change or healing cycle. Stale reads and resolved conflicts are not
//! errors at all.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sharding::types::ShardId;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node {node} unreachable: {reason}")]
    NodeUnreachable { node: String, reason: String },

    #[error("shard {shard} of {collection} unavailable: no reachable owner")]
    ShardUnavailable { collection: String, shard: ShardId },

    #[error("rebalance of {collection} incomplete: {reason}")]
    RebalanceIncomplete { collection: String, reason: String },

    #[error("database {0} not found")]
    DatabaseNotFound(String),

    #[error("collection {0} is not configured")]
    CollectionNotConfigured(String),

    #[error("document {0} not found")]
    DocumentNotFound(String),

    #[error("document {0} already exists")]
    DocumentExists(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    pub fn unreachable(node: impl ToString, reason: impl ToString) -> Self {
        ClusterError::NodeUnreachable {
            node: node.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Stable machine-readable kind, also used on the wire between nodes.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::NodeUnreachable { .. } => "node_unreachable",
            ClusterError::ShardUnavailable { .. } => "shard_unavailable",
            ClusterError::RebalanceIncomplete { .. } => "rebalance_incomplete",
            ClusterError::DatabaseNotFound(_) => "database_not_found",
            ClusterError::CollectionNotConfigured(_) => "collection_not_configured",
            ClusterError::DocumentNotFound(_) => "document_not_found",
            ClusterError::DocumentExists(_) => "document_exists",
            ClusterError::InvalidRequest(_) => "invalid_request",
            ClusterError::UnknownNode(_) => "unknown_node",
            ClusterError::Storage(_) => "storage",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ClusterError::DatabaseNotFound(_)
            | ClusterError::CollectionNotConfigured(_)
            | ClusterError::DocumentNotFound(_)
            | ClusterError::UnknownNode(_) => StatusCode::NOT_FOUND,
            ClusterError::DocumentExists(_) => StatusCode::CONFLICT,
            ClusterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ClusterError::NodeUnreachable { .. }
            | ClusterError::ShardUnavailable { .. }
            | ClusterError::RebalanceIncomplete { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Rebuilds a request error relayed by a peer so forwarded calls keep
    /// their original meaning.
    pub fn from_body(body: ErrorBody) -> Self {
        match body.error.as_str() {
            "database_not_found" => ClusterError::DatabaseNotFound(body.message),
            "collection_not_configured" => ClusterError::CollectionNotConfigured(body.message),
            "document_not_found" => ClusterError::DocumentNotFound(body.message),
            "document_exists" => ClusterError::DocumentExists(body.message),
            "invalid_request" => ClusterError::InvalidRequest(body.message),
            "unknown_node" => ClusterError::UnknownNode(body.message),
            "storage" => ClusterError::Storage(body.message),
            _ => ClusterError::unreachable("peer", body.message),
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::InvalidRequest(err.to_string())
    }
}

/// JSON body returned for every failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind().to_string(),
            message: match &self {
                ClusterError::DatabaseNotFound(name)
                | ClusterError::CollectionNotConfigured(name)
                | ClusterError::DocumentNotFound(name)
                | ClusterError::DocumentExists(name)
                | ClusterError::UnknownNode(name)
                | ClusterError::InvalidRequest(name)
                | ClusterError::Storage(name) => name.clone(),
                other => other.to_string(),
            },
        };

        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests;
