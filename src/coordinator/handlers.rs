use axum::{Json, extract::Extension};
use std::sync::Arc;

use super::protocol::ShardQueryRequest;
use super::service::ScatterGatherCoordinator;
use super::types::PartialResult;
use crate::error::ClusterResult;

pub async fn handle_shard_query(
    Extension(coordinator): Extension<Arc<ScatterGatherCoordinator>>,
    Json(req): Json<ShardQueryRequest>,
) -> ClusterResult<Json<PartialResult>> {
    tracing::debug!("Shard query on {}", req.shard);
    coordinator.execute_local(&req).await.map(Json)
}
