//! Local Storage Module
//!
//! The single-node side of the store: the key/value primitives the cluster
//! layer is built on, plus what it adds on top of them.
//!
//! ## Core Concepts
//! - **LocalStore**: get/put/delete/scan per shard; `MemoryStore` is the bundled implementation.
//! - **Per-shard locking**: `ShardStore` serialises mutations of a shard and lets reads share it.
//! - **Last-writer-wins**: documents carry a `Stamp`; only a strictly newer stamp replaces a copy.
//! - **Durability**: every applied change is framed into the write-ahead log and replayed on start.

pub mod store;
pub mod types;
pub mod wal;

#[cfg(test)]
mod tests;
