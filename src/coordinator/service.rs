use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::executor::QueryExecutor;
use super::protocol::{ENDPOINT_QUERY, ShardQueryRequest};
use super::types::{
    PartialAggregate, PartialResult, QueryOutput, QueryResult, QueryRow, ShardQuery,
};
use crate::error::{ClusterError, ClusterResult};
use crate::membership::types::NodeId;
use crate::replication::client::PeerClient;
use crate::sharding::router::Router;
use crate::sharding::types::{CollectionId, ShardId, ShardRef};
use crate::storage::types::Document;

/// Fans a non-keyed query out to one owner per shard and merges the answers.
///
/// Owners are tried in read-candidate order (primary first). Each attempt is
/// bounded by `timeout`; a shard whose owners all fail contributes nothing and
/// is reported in `missing_shards`.
pub struct ScatterGatherCoordinator {
    router: Arc<Router>,
    client: PeerClient,
    local: Arc<dyn QueryExecutor>,
    timeout: Duration,
}

impl ScatterGatherCoordinator {
    pub fn new(
        router: Arc<Router>,
        client: PeerClient,
        local: Arc<dyn QueryExecutor>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            client,
            local,
            timeout,
        })
    }

    fn local_id(&self) -> &NodeId {
        self.router.local_id()
    }

    pub async fn query(
        &self,
        database: &str,
        collection: &str,
        query: ShardQuery,
    ) -> ClusterResult<QueryResult> {
        let collection = CollectionId::new(database, collection);
        let entry = self.router.entry(&collection)?;

        let calls = (0..entry.num_shards).map(|shard_id| {
            let owners = entry
                .shard(shard_id)
                .map(|assignment| assignment.owners.clone())
                .unwrap_or_default();
            let shard = entry.shard_ref(shard_id);
            let query = &query;
            async move {
                let partial = self.query_shard(&shard, &owners, query).await;
                (shard_id, partial)
            }
        });

        let answers = join_all(calls).await;

        let shards_total = answers.len();
        let mut missing_shards: Vec<ShardId> = Vec::new();
        let mut partials = Vec::with_capacity(shards_total);
        for (shard_id, partial) in answers {
            match partial {
                Some(partial) => partials.push(partial),
                None => missing_shards.push(shard_id),
            }
        }

        if !missing_shards.is_empty() {
            warn!(
                "Query on {} is partial: no owner answered for shards {:?}",
                collection, missing_shards
            );
        }

        let output = merge(&query, partials)?;
        Ok(QueryResult {
            output,
            shards_total,
            shards_answered: shards_total - missing_shards.len(),
            partial: !missing_shards.is_empty(),
            missing_shards,
            coordinator: self.local_id().clone(),
        })
    }

    /// First owner that answers within the timeout, or `None`.
    async fn query_shard(
        &self,
        shard: &ShardRef,
        owners: &[NodeId],
        query: &ShardQuery,
    ) -> Option<PartialResult> {
        for candidate in self.router.read_candidates(owners) {
            let result = if &candidate == self.local_id() {
                match tokio::time::timeout(self.timeout, self.local.execute(shard, query)).await {
                    Ok(result) => result,
                    Err(_) => Err(ClusterError::unreachable(&candidate, "local query timed out")),
                }
            } else {
                let request = ShardQueryRequest {
                    shard: shard.clone(),
                    query: query.clone(),
                };
                self.client
                    .post_with_timeout(&candidate, ENDPOINT_QUERY, &request, self.timeout)
                    .await
            };

            match result {
                Ok(partial) => return Some(partial),
                Err(e) => debug!("Query of {} on {} failed: {}", shard, candidate, e),
            }
        }
        None
    }

    /// Serves one shard of a scatter-gather query on behalf of a peer.
    pub async fn execute_local(&self, request: &ShardQueryRequest) -> ClusterResult<PartialResult> {
        let entry = self.router.entry(&request.shard.collection)?;
        let owns = entry
            .shard(request.shard.shard_id)
            .is_some_and(|assignment| assignment.owners.contains(self.local_id()));
        if !owns {
            return Err(ClusterError::ShardUnavailable {
                collection: request.shard.collection.to_string(),
                shard: request.shard.shard_id,
            });
        }
        self.local.execute(&request.shard, &request.query).await
    }
}

/// Second pass over per-shard answers.
pub fn merge(query: &ShardQuery, partials: Vec<PartialResult>) -> ClusterResult<QueryOutput> {
    match query {
        ShardQuery::Documents { limit, .. } => {
            let mut latest: BTreeMap<String, Document> = BTreeMap::new();
            for partial in partials {
                let PartialResult::Documents { documents } = partial else {
                    return Err(mismatch("documents"));
                };
                for doc in documents {
                    match latest.get(&doc.key) {
                        Some(existing) if existing.stamp >= doc.stamp => {}
                        _ => {
                            latest.insert(doc.key.clone(), doc);
                        }
                    }
                }
            }

            let rows = latest
                .into_values()
                .take(limit.unwrap_or(usize::MAX))
                .map(|doc| QueryRow {
                    version: doc.stamp.version,
                    key: doc.key,
                    value: doc.value,
                })
                .collect();
            Ok(QueryOutput::Documents { documents: rows })
        }
        ShardQuery::Count => {
            let mut count = 0;
            for partial in partials {
                let PartialResult::Count { count: shard_count } = partial else {
                    return Err(mismatch("count"));
                };
                count += shard_count;
            }
            Ok(QueryOutput::Count { count })
        }
        ShardQuery::Aggregate { function, .. } => {
            let mut total = PartialAggregate::default();
            for partial in partials {
                let PartialResult::Aggregate(aggregate) = partial else {
                    return Err(mismatch("aggregate"));
                };
                total.combine(&aggregate);
            }
            Ok(QueryOutput::Aggregate {
                function: *function,
                value: total.finish(*function),
            })
        }
    }
}

fn mismatch(expected: &str) -> ClusterError {
    ClusterError::InvalidRequest(format!("shard answered with a non-{} result", expected))
}
