//! Shardline Cluster Library
//!
//! Topology, sharding and replication for a distributed document store. The
//! binary (`main.rs`) only parses configuration and starts a [`node::ClusterNode`].
//!
//! ## Architecture Modules
//!
//! - **`membership`**: UDP gossip (SWIM-like) for discovery, failure detection
//!   and administrative removal.
//! - **`sharding`**: the versioned shard map, the deterministic placement
//!   function and key routing.
//! - **`storage`**: the local key/value collaborator with per-shard locking,
//!   last-writer-wins apply and the write-ahead log.
//! - **`replication`**: operation streams, asynchronous shipping, catch-up and
//!   snapshot transfer.
//! - **`rebalance`**: owner repairs, resharding, migrations and orphan cleanup.
//! - **`healing`**: the periodic loop that catches lagging copies up and keeps
//!   shard maps converged.
//! - **`coordinator`**: scatter-gather execution of non-keyed queries.
//! - **`node`**: wiring, HTTP listeners and background task lifecycle.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod healing;
pub mod membership;
pub mod node;
pub mod rebalance;
pub mod replication;
pub mod sharding;
pub mod storage;
