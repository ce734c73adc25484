use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle of a peer.
///
/// `Suspected` is reversible (a heartbeat brings the node back), `Removed` is
/// terminal: a removed id is never accepted back into the cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    Alive,
    Suspected,
    Removed,
}

/// A single member in the cluster.
///
/// The `incarnation` field is a logical clock owned by the node itself; it is
/// bumped to refute a false suspicion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub client_addr: SocketAddr,
    pub replication_addr: SocketAddr,
    pub status: NodeStatus,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
}

impl Node {
    pub fn is_alive(&self) -> bool {
        self.status == NodeStatus::Alive
    }

    pub fn is_removed(&self) -> bool {
        self.status == NodeStatus::Removed
    }

    /// Matches either advertised address; operators may name a node by the
    /// address they know it by.
    pub fn has_address(&self, addr: &str) -> bool {
        let addr = addr.trim();
        let addr = addr
            .strip_prefix("http://")
            .or_else(|| addr.strip_prefix("https://"))
            .unwrap_or(addr)
            .trim_end_matches('/');
        self.client_addr.to_string() == addr || self.replication_addr.to_string() == addr
    }
}

/// The gossip wire protocol, exchanged over UDP on the replication address.
///
/// - `Heartbeat/Ack`: liveness and member list exchange.
/// - `Join`: sent to the static peer list until the peer is known.
/// - `Suspect/Alive`: disseminate health changes.
/// - `Removed`: explicit administrative removal, terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Heartbeat {
        from: Node,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        node: Node,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },

    Removed {
        node_id: NodeId,
    },
}

/// Topology changes published to the rest of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeId),
    Recovered(NodeId),
    Suspected(NodeId),
    Removed(NodeId),
}
