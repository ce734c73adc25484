use axum::{
    Json,
    extract::{Extension, Path},
};
use serde_json::Value;
use std::sync::Arc;

use super::ClusterNode;
use super::protocol::{
    BatchWriteRequest, BatchWriteResponse, ClusterStatusResponse, CollectionPropertiesRequest,
    CollectionStatus, CountResponse, CreateCollectionRequest, HealthResponse,
    InsertDocumentRequest, LocalCountResponse, MemberStatus, RebalanceResponse,
    RemoveNodeRequest, RemoveNodeResponse, ReshardRequest,
};
use crate::coordinator::types::{QueryOutput, QueryResult, ShardQuery};
use crate::error::{ClusterError, ClusterResult};
use crate::rebalance::protocol::{DatabaseRequest, DatabaseResponse};
use crate::replication::protocol::{BatchItem, Mutation, ReadResponse, WriteResponse};
use crate::sharding::types::{CollectionId, ShardMapEntry};

fn collection_status(node: &ClusterNode, entry: &ShardMapEntry) -> CollectionStatus {
    let store = node.engine().store();
    CollectionStatus::from_entry(
        entry,
        node.rebalancer().is_resharding(&entry.collection),
        |shard_id| store.live_count(&entry.shard_ref(shard_id)),
    )
}

// --- Cluster ---

pub async fn handle_health(Extension(node): Extension<Arc<ClusterNode>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        node_id: node.local_id().clone(),
    })
}

pub async fn handle_cluster_status(
    Extension(node): Extension<Arc<ClusterNode>>,
) -> Json<ClusterStatusResponse> {
    let snapshot = node.router().map().snapshot();
    let collections = snapshot
        .entries
        .values()
        .map(|entry| collection_status(&node, entry))
        .collect();

    Json(ClusterStatusResponse {
        node_id: node.local_id().clone(),
        map_version: snapshot.version,
        members: node
            .membership()
            .members()
            .into_iter()
            .map(MemberStatus::from)
            .collect(),
        databases: snapshot.databases.iter().cloned().collect(),
        collections,
    })
}

pub async fn handle_remove_node(
    Extension(node): Extension<Arc<ClusterNode>>,
    Json(req): Json<RemoveNodeRequest>,
) -> ClusterResult<Json<RemoveNodeResponse>> {
    tracing::info!("Removal requested for {}", req.node_address);
    let (node_id, newly_removed) = node.rebalancer().remove_node(&req.node_address).await?;
    let remaining = node
        .membership()
        .list_active()
        .into_iter()
        .map(MemberStatus::from)
        .collect();
    Ok(Json(RemoveNodeResponse {
        node_id,
        newly_removed,
        remaining,
    }))
}

pub async fn handle_rebalance(
    Extension(node): Extension<Arc<ClusterNode>>,
) -> Json<RebalanceResponse> {
    let plans = node.rebalancer().reconcile();
    node.rebalancer().drive_pending();
    Json(RebalanceResponse {
        plans: plans.len(),
        moves: plans.iter().map(|plan| plan.moves.len()).sum(),
    })
}

pub async fn handle_create_database(
    Extension(node): Extension<Arc<ClusterNode>>,
    Json(req): Json<DatabaseRequest>,
) -> ClusterResult<Json<DatabaseResponse>> {
    let created = node.rebalancer().create_database_everywhere(&req.name)?;
    Ok(Json(DatabaseResponse {
        name: req.name,
        created,
    }))
}

// --- Collections ---

pub async fn handle_create_collection(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path(database): Path<String>,
    Json(req): Json<CreateCollectionRequest>,
) -> ClusterResult<Json<CollectionStatus>> {
    let defaults = node.defaults();
    let collection = CollectionId::new(database, req.name);
    let entry = node.rebalancer().configure(
        &collection,
        req.num_shards.unwrap_or(defaults.num_shards),
        req.replication_factor.unwrap_or(defaults.replication_factor),
    )?;
    Ok(Json(collection_status(&node, &entry)))
}

pub async fn handle_collection_properties(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path((database, collection)): Path<(String, String)>,
    Json(req): Json<CollectionPropertiesRequest>,
) -> ClusterResult<Json<CollectionStatus>> {
    let collection = CollectionId::new(database, collection);
    let entry = node
        .rebalancer()
        .configure(&collection, req.num_shards, req.replication_factor)?;
    Ok(Json(collection_status(&node, &entry)))
}

pub async fn handle_reshard(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path((database, collection)): Path<(String, String)>,
    Json(req): Json<ReshardRequest>,
) -> ClusterResult<Json<CollectionStatus>> {
    let collection = CollectionId::new(database, collection);
    let entry = node
        .rebalancer()
        .reshard(&collection, req.num_shards, req.replication_factor)?;
    Ok(Json(collection_status(&node, &entry)))
}

pub async fn handle_sharding(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path((database, collection)): Path<(String, String)>,
) -> ClusterResult<Json<CollectionStatus>> {
    let entry = node
        .router()
        .entry(&CollectionId::new(database, collection))?;
    Ok(Json(collection_status(&node, &entry)))
}

pub async fn handle_count(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path((database, collection)): Path<(String, String)>,
) -> ClusterResult<Json<CountResponse>> {
    let result = node
        .coordinator()
        .query(&database, &collection, ShardQuery::Count)
        .await?;
    let QueryOutput::Count { count } = result.output else {
        return Err(ClusterError::InvalidRequest(
            "count query returned a non-count result".to_string(),
        ));
    };
    Ok(Json(CountResponse {
        count,
        partial: result.partial,
        missing_shards: result.missing_shards,
    }))
}

pub async fn handle_local_count(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path((database, collection)): Path<(String, String)>,
) -> ClusterResult<Json<LocalCountResponse>> {
    let collection = CollectionId::new(database, collection);
    node.router().entry(&collection)?;
    Ok(Json(LocalCountResponse {
        node_id: node.local_id().clone(),
        count: node.engine().store().collection_count(&collection),
    }))
}

// --- Documents ---

pub async fn handle_insert(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path((database, collection)): Path<(String, String)>,
    Json(req): Json<InsertDocumentRequest>,
) -> ClusterResult<Json<WriteResponse>> {
    node.engine()
        .write(&database, &collection, &req.key, Mutation::Insert { value: req.value })
        .await
        .map(Json)
}

pub async fn handle_batch_write(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path((database, collection)): Path<(String, String)>,
    Json(req): Json<BatchWriteRequest>,
) -> ClusterResult<Json<BatchWriteResponse>> {
    let overwrite = req.overwrite;
    let items = req
        .documents
        .into_iter()
        .map(|doc| BatchItem {
            key: doc.key.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            mutation: if overwrite {
                Mutation::Upsert { value: doc.value }
            } else {
                Mutation::Insert { value: doc.value }
            },
        })
        .collect();

    let results = node
        .engine()
        .write_batch(&database, &collection, items)
        .await?;
    let written = results.iter().filter(|outcome| outcome.is_ok()).count();
    tracing::debug!(
        "Batch write on {}/{}: {} written, {} failed",
        database,
        collection,
        written,
        results.len() - written
    );

    Ok(Json(BatchWriteResponse {
        written,
        failed: results.len() - written,
        results,
    }))
}

pub async fn handle_read(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path((database, collection, key)): Path<(String, String, String)>,
) -> ClusterResult<Json<ReadResponse>> {
    node.engine().read(&database, &collection, &key).await.map(Json)
}

pub async fn handle_upsert(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path((database, collection, key)): Path<(String, String, String)>,
    Json(value): Json<Value>,
) -> ClusterResult<Json<WriteResponse>> {
    node.engine()
        .write(&database, &collection, &key, Mutation::Upsert { value })
        .await
        .map(Json)
}

pub async fn handle_update(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path((database, collection, key)): Path<(String, String, String)>,
    Json(patch): Json<Value>,
) -> ClusterResult<Json<WriteResponse>> {
    if !patch.is_object() {
        return Err(ClusterError::InvalidRequest(
            "an update body must be a JSON object".to_string(),
        ));
    }
    node.engine()
        .write(&database, &collection, &key, Mutation::Update { patch })
        .await
        .map(Json)
}

pub async fn handle_delete(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path((database, collection, key)): Path<(String, String, String)>,
) -> ClusterResult<Json<WriteResponse>> {
    node.engine()
        .write(&database, &collection, &key, Mutation::Delete)
        .await
        .map(Json)
}

pub async fn handle_query(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path((database, collection)): Path<(String, String)>,
    Json(query): Json<ShardQuery>,
) -> ClusterResult<Json<QueryResult>> {
    tracing::debug!("Query on {}/{}: {:?}", database, collection, query);
    node.coordinator()
        .query(&database, &collection, query)
        .await
        .map(Json)
}
