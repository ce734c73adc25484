use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::membership::types::NodeId;
use crate::sharding::types::ShardId;
use crate::storage::types::Document;

/// Structured form of a non-keyed query, as handed over by the query layer.
///
/// - `Documents`: `FOR doc IN coll FILTER doc.a == x ... RETURN doc`
/// - `Count`: `RETURN COLLECTION_COUNT(coll)`
/// - `Aggregate`: `RETURN SUM(...)` and friends over one numeric field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardQuery {
    Documents {
        /// Top-level field equality; `_key` matches the document key.
        #[serde(default)]
        filter: BTreeMap<String, Value>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Count,
    Aggregate {
        function: AggregateFunction,
        field: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Sum,
    Min,
    Max,
    Avg,
}

/// What one shard owner returns. Aggregates travel as partial state so the
/// coordinator can combine them in a second pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartialResult {
    Documents { documents: Vec<Document> },
    Count { count: u64 },
    Aggregate(PartialAggregate),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PartialAggregate {
    pub sum: f64,
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl PartialAggregate {
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
    }

    pub fn combine(&mut self, other: &PartialAggregate) {
        self.sum += other.sum;
        self.count += other.count;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn finish(&self, function: AggregateFunction) -> Option<f64> {
        if self.count == 0 {
            return match function {
                AggregateFunction::Sum => Some(0.0),
                _ => None,
            };
        }
        match function {
            AggregateFunction::Sum => Some(self.sum),
            AggregateFunction::Min => self.min,
            AggregateFunction::Max => self.max,
            AggregateFunction::Avg => Some(self.sum / self.count as f64),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRow {
    pub key: String,
    pub value: Value,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryOutput {
    Documents { documents: Vec<QueryRow> },
    Count { count: u64 },
    Aggregate {
        function: AggregateFunction,
        value: Option<f64>,
    },
}

/// Merged answer of a scatter-gather query. `partial` is set when at least one
/// shard had no reachable owner; those shards are listed in `missing_shards`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    #[serde(flatten)]
    pub output: QueryOutput,
    pub shards_total: usize,
    pub shards_answered: usize,
    pub missing_shards: Vec<ShardId>,
    pub partial: bool,
    pub coordinator: NodeId,
}
