//! Catch-up / Healing Sync
//!
//! A periodic background loop. Each cycle pulls peers' shard maps, catches up
//! the shards flagged by gap detection (all owned shards on every few cycles)
//! from the other alive owners, and gives the rebalancer a chance to retry
//! unfinished work.
//!
//! A copy is served while it heals: reads may be stale until the cycle that
//! covers its shard completes.

pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
