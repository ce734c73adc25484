//! # Scatter-Gather Coordinator
//!
//! Executes queries that are not keyed to a single shard. The coordinator
//! picks one owner per shard, asks all of them in parallel and merges what
//! comes back:
//!
//! 1. **Documents**: concatenated, then de-duplicated by key keeping the
//!    highest stamp. A document can sit in two shards while a reshard moves it.
//! 2. **Count**: summed.
//! 3. **Aggregates**: each shard returns `(sum, count, min, max)`; the final
//!    value is computed once all partials are in.
//!
//! Evaluating a query against local data goes through the `QueryExecutor`
//! trait, so the query language itself stays outside this crate.

pub mod executor;
pub mod handlers;
pub mod protocol;
pub mod service;
pub mod types;
