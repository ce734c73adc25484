use axum::{
    Json,
    extract::{Extension, Path},
};
use std::sync::Arc;

use super::engine::ReplicationEngine;
use super::protocol::{
    BatchItemOutcome, CatchUpRequest, CatchUpResponse, ForwardBatchRequest, ForwardWriteRequest,
    LocalReadResponse, ReplicateRequest, ReplicateResponse, WriteResponse,
};
use super::types::ShardSnapshot;
use crate::error::{ClusterError, ClusterResult};
use crate::sharding::types::{CollectionId, ShardId, ShardRef};

pub async fn handle_replicate(
    Extension(engine): Extension<Arc<ReplicationEngine>>,
    Json(req): Json<ReplicateRequest>,
) -> ClusterResult<Json<ReplicateResponse>> {
    tracing::debug!("Received {} ops from {}", req.ops.len(), req.from);

    if let Some(first) = req.ops.first() {
        let shard = first.shard_ref();
        if req.ops.iter().any(|op| op.shard_ref() != shard) {
            return Err(ClusterError::InvalidRequest(
                "a replicate batch must target a single shard".to_string(),
            ));
        }
    }

    let response = engine.apply_batch(&req.ops)?;
    Ok(Json(response))
}

pub async fn handle_forward_write(
    Extension(engine): Extension<Arc<ReplicationEngine>>,
    Json(req): Json<ForwardWriteRequest>,
) -> ClusterResult<Json<WriteResponse>> {
    tracing::debug!(
        "Forwarded write for {}/{}/{}",
        req.database,
        req.collection,
        req.key
    );
    engine.accept_forwarded(req).map(Json)
}

pub async fn handle_forward_batch(
    Extension(engine): Extension<Arc<ReplicationEngine>>,
    Json(req): Json<ForwardBatchRequest>,
) -> ClusterResult<Json<Vec<BatchItemOutcome>>> {
    tracing::debug!(
        "Forwarded batch of {} writes for {}/{}",
        req.items.len(),
        req.database,
        req.collection
    );
    engine.accept_forwarded_batch(req).map(Json)
}

pub async fn handle_catch_up(
    Extension(engine): Extension<Arc<ReplicationEngine>>,
    Json(req): Json<CatchUpRequest>,
) -> Json<CatchUpResponse> {
    tracing::debug!("Catch-up request from {} for {}", req.requester, req.shard);
    Json(engine.serve_catch_up(&req))
}

pub async fn handle_snapshot(
    Extension(engine): Extension<Arc<ReplicationEngine>>,
    Path((database, collection, shard_id)): Path<(String, String, ShardId)>,
) -> Json<ShardSnapshot> {
    let shard = ShardRef::new(CollectionId::new(database, collection), shard_id);
    let snapshot = engine.snapshot(&shard);
    tracing::info!(
        "Serving snapshot of {} ({} documents)",
        shard,
        snapshot.documents.len()
    );
    Json(snapshot)
}

pub async fn handle_local_read(
    Extension(engine): Extension<Arc<ReplicationEngine>>,
    Path((database, collection, shard_id, key)): Path<(String, String, ShardId, String)>,
) -> Json<LocalReadResponse> {
    let shard = ShardRef::new(CollectionId::new(database, collection), shard_id);
    Json(engine.local_read(&shard, &key))
}
