//! Replication Engine
//!
//! Propagates every committed write to the other holders of its shard and
//! brings lagging copies back in line.
//!
//! ## Core Mechanisms
//! - **Ordered streams**: one bounded channel per (target, shard); a slow or dead
//!   replica never blocks the write that produced the operation.
//! - **Watermarks**: receivers track the last contiguous op id per (origin, shard)
//!   and detect gaps through `prev_op_id`.
//! - **Catch-up**: missing operations are replayed from a peer's log; when the log no
//!   longer covers the range, a consistent shard snapshot is transferred instead.
//! - **Log GC**: operations are discarded once every other holder acknowledged them.

pub mod client;
pub mod engine;
pub mod handlers;
pub mod log;
pub mod protocol;
pub mod types;
