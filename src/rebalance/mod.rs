//! Rebalancer
//!
//! Keeps every shard at its owner target as the topology changes.
//!
//! ## Core Mechanisms
//! - **Repairs**: removed nodes are stripped from the map and replacement owners
//!   are drawn from alive nodes, least loaded first. A replacement stays
//!   *pending* until it has copied the shard (snapshot, then catch-up) and
//!   promotes itself.
//! - **Resharding**: a new shard count builds a fresh layout; each node then
//!   hands its documents to the acting primary of their new shard, which
//!   re-issues them on its own replication stream.
//! - **Convergence**: entries carry a generation and are pushed to peers on every
//!   change; the highest generation wins everywhere.
//! - **Orphan cleanup**: copies a node no longer holds are handed off and dropped
//!   once the shard is fully replicated.

pub mod handlers;
pub mod protocol;
pub mod service;
