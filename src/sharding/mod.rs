//! Shard Map & Router
//!
//! Maps every (database, collection) to a fixed number of shards and every shard
//! to an ordered owner list (primary first).
//!
//! ## Core Concepts
//! - **Stable hashing**: `shard = fnv1a(key) % num_shards`, identical on every node.
//! - **Deterministic placement**: round-robin over sorted node ids, so nodes that
//!   configure the same collection independently agree on the assignment.
//! - **Versioned snapshots**: the map is swapped atomically; each entry carries a
//!   generation used to converge maps across nodes.

pub mod map;
pub mod placement;
pub mod router;
pub mod types;

#[cfg(test)]
mod tests;
