use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::types::{PartialAggregate, PartialResult, ShardQuery};
use crate::error::ClusterResult;
use crate::sharding::types::ShardRef;
use crate::storage::store::ShardStore;
use crate::storage::types::Document;

/// Evaluates a query against one shard copy held by this node.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, shard: &ShardRef, query: &ShardQuery) -> ClusterResult<PartialResult>;
}

pub struct LocalQueryExecutor {
    store: Arc<ShardStore>,
}

impl LocalQueryExecutor {
    pub fn new(store: Arc<ShardStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QueryExecutor for LocalQueryExecutor {
    async fn execute(&self, shard: &ShardRef, query: &ShardQuery) -> ClusterResult<PartialResult> {
        let documents = self.store.live_documents(shard);

        let result = match query {
            ShardQuery::Documents { filter, limit } => {
                let mut matching: Vec<Document> = documents
                    .into_iter()
                    .filter(|doc| matches_filter(doc, filter))
                    .collect();
                if let Some(limit) = limit {
                    matching.truncate(*limit);
                }
                PartialResult::Documents {
                    documents: matching,
                }
            }
            ShardQuery::Count => PartialResult::Count {
                count: documents.len() as u64,
            },
            ShardQuery::Aggregate { field, .. } => {
                let mut partial = PartialAggregate::default();
                for value in documents
                    .iter()
                    .filter_map(|doc| doc.value.get(field).and_then(Value::as_f64))
                {
                    partial.add(value);
                }
                PartialResult::Aggregate(partial)
            }
        };

        Ok(result)
    }
}

pub fn matches_filter(doc: &Document, filter: &BTreeMap<String, Value>) -> bool {
    filter.iter().all(|(field, expected)| {
        if field == "_key" {
            return expected.as_str() == Some(doc.key.as_str());
        }
        doc.value.get(field) == Some(expected)
    })
}
