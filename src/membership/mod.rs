//! Membership & Discovery Module
//!
//! Gossip-based membership (SWIM-flavoured) over UDP on each node's
//! replication address. Nodes find each other through a static peer list and
//! keep a shared view of who is alive.
//!
//! ## Core Mechanisms
//! - **Heartbeats**: every interval each node pings the others and merges the
//!   member list carried by their acks.
//! - **Failure Detection**: a peer silent for longer than the suspect timeout is
//!   marked `Suspected`. Suspicion is reversible; only an explicit administrative
//!   removal makes a node `Removed`, and that state is terminal.
//! - **Incarnation Numbers**: a node refutes a false suspicion by bumping its
//!   own incarnation.
//! - **Events**: joins, recoveries, suspicions and removals are published on a
//!   broadcast channel for the rebalancer and the healing loop.

pub mod service;
pub mod types;
