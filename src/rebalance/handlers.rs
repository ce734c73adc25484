use axum::{Json, extract::Extension};
use std::sync::Arc;

use super::protocol::{
    DatabaseRequest, DatabaseResponse, MigrateRequest, MigrateResponse, NodeRemovedNotice,
    NodeRemovedResponse, ShardMapDump, ShardMapPush, ShardMapPushResponse,
};
use super::service::Rebalancer;
use crate::error::ClusterResult;
use crate::membership::service::MembershipService;

pub async fn handle_get_shard_map(
    Extension(rebalancer): Extension<Arc<Rebalancer>>,
) -> Json<ShardMapDump> {
    Json(rebalancer.dump())
}

pub async fn handle_push_shard_map(
    Extension(rebalancer): Extension<Arc<Rebalancer>>,
    Json(push): Json<ShardMapPush>,
) -> Json<ShardMapPushResponse> {
    tracing::debug!("Received {} shard map entries from {}", push.entries.len(), push.from);
    let installed = rebalancer.merge_entries(push.entries);
    Json(ShardMapPushResponse { installed })
}

pub async fn handle_create_database(
    Extension(rebalancer): Extension<Arc<Rebalancer>>,
    Json(req): Json<DatabaseRequest>,
) -> ClusterResult<Json<DatabaseResponse>> {
    let created = rebalancer.create_database(&req.name)?;
    Ok(Json(DatabaseResponse {
        name: req.name,
        created,
    }))
}

pub async fn handle_migrate(
    Extension(rebalancer): Extension<Arc<Rebalancer>>,
    Json(req): Json<MigrateRequest>,
) -> ClusterResult<Json<MigrateResponse>> {
    tracing::debug!("Migration of {} documents into {}", req.documents.len(), req.shard);
    let adopted = rebalancer.accept_migration(req)?;
    Ok(Json(MigrateResponse { adopted }))
}

pub async fn handle_node_removed(
    Extension(membership): Extension<Arc<MembershipService>>,
    Json(notice): Json<NodeRemovedNotice>,
) -> Json<NodeRemovedResponse> {
    Json(NodeRemovedResponse {
        newly_removed: membership.mark_removed(&notice.node_id),
    })
}
