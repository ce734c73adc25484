//! Startup configuration.
//!
//! `NodeArgs` is the command-line/environment surface; the library itself only
//! ever sees the plain `NodeConfig` it converts into.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::membership::types::NodeId;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub suspect_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            suspect_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReplicationConfig {
    /// Per-request timeout for peer calls.
    pub request_timeout: Duration,
    /// Operations buffered per (target, shard) channel before new ones are
    /// dropped and left to healing.
    pub queue_capacity: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Above this many missing operations a catch-up falls back to a snapshot.
    pub max_catch_up_ops: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            queue_capacity: 10_000,
            initial_backoff: Duration::from_millis(150),
            max_backoff: Duration::from_secs(2),
            max_catch_up_ops: 5_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub client_bind: SocketAddr,
    pub replication_bind: SocketAddr,
    pub data_dir: PathBuf,
    pub peers: Vec<SocketAddr>,
    pub heartbeat: HeartbeatConfig,
    pub replication: ReplicationConfig,
    pub healing_interval: Duration,
    pub query_timeout: Duration,
    pub default_shards: u32,
    pub default_replication_factor: usize,
    /// fsync the write-ahead log after every append.
    pub sync_writes: bool,
    /// Compact the write-ahead log at startup once replay reads more records
    /// than this.
    pub wal_compact_after: usize,
}

impl NodeConfig {
    /// Loopback configuration with ephemeral ports, mostly for tests and
    /// embedding.
    pub fn local(node_id: &str, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: NodeId(node_id.to_string()),
            client_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            replication_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            data_dir: data_dir.into(),
            peers: Vec::new(),
            heartbeat: HeartbeatConfig::default(),
            replication: ReplicationConfig::default(),
            healing_interval: Duration::from_secs(2),
            query_timeout: Duration::from_secs(2),
            default_shards: 3,
            default_replication_factor: 2,
            sync_writes: false,
            wal_compact_after: 50_000,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "shardline", about = "Sharded, replicated document store node")]
pub struct NodeArgs {
    /// Stable identifier of this node; generated when omitted.
    #[arg(long, env = "SHARDLINE_NODE_ID")]
    pub node_id: Option<String>,

    /// Client-facing HTTP address.
    #[arg(long, env = "SHARDLINE_BIND", default_value = "127.0.0.1:6745")]
    pub bind: SocketAddr,

    /// Replication address (internal HTTP over TCP, gossip over UDP).
    #[arg(long, env = "SHARDLINE_REPLICATION_BIND", default_value = "127.0.0.1:6746")]
    pub replication_bind: SocketAddr,

    #[arg(long, env = "SHARDLINE_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Replication address of a peer; repeat the flag for several peers.
    #[arg(long = "peer", env = "SHARDLINE_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    #[arg(long, env = "SHARDLINE_HEARTBEAT_INTERVAL_MS", default_value_t = 500)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, env = "SHARDLINE_SUSPECT_TIMEOUT_MS", default_value_t = 3000)]
    pub suspect_timeout_ms: u64,

    #[arg(long, env = "SHARDLINE_HEALING_INTERVAL_MS", default_value_t = 2000)]
    pub healing_interval_ms: u64,

    #[arg(long, env = "SHARDLINE_QUERY_TIMEOUT_MS", default_value_t = 2000)]
    pub query_timeout_ms: u64,

    #[arg(long, env = "SHARDLINE_DEFAULT_SHARDS", default_value_t = 3)]
    pub default_shards: u32,

    #[arg(long, env = "SHARDLINE_DEFAULT_REPLICATION_FACTOR", default_value_t = 2)]
    pub default_replication_factor: usize,

    #[arg(long, env = "SHARDLINE_SYNC_WRITES", default_value_t = false)]
    pub sync_writes: bool,

    #[arg(long, env = "SHARDLINE_WAL_COMPACT_AFTER", default_value_t = 50_000)]
    pub wal_compact_after: usize,
}

impl NodeArgs {
    pub fn into_config(self) -> anyhow::Result<NodeConfig> {
        let peers = self
            .peers
            .iter()
            .filter(|peer| !peer.trim().is_empty())
            .map(|peer| parse_peer(peer))
            .collect::<anyhow::Result<Vec<_>>>()?;

        if self.default_shards == 0 {
            anyhow::bail!("--default-shards must be at least 1");
        }
        if self.default_replication_factor == 0 {
            anyhow::bail!("--default-replication-factor must be at least 1");
        }
        for (flag, millis) in [
            ("--heartbeat-interval-ms", self.heartbeat_interval_ms),
            ("--suspect-timeout-ms", self.suspect_timeout_ms),
            ("--healing-interval-ms", self.healing_interval_ms),
            ("--query-timeout-ms", self.query_timeout_ms),
        ] {
            if millis == 0 {
                anyhow::bail!("{} must be at least 1", flag);
            }
        }
        if self.suspect_timeout_ms <= self.heartbeat_interval_ms {
            anyhow::bail!("--suspect-timeout-ms must exceed --heartbeat-interval-ms");
        }

        Ok(NodeConfig {
            node_id: self.node_id.map(NodeId).unwrap_or_default(),
            client_bind: self.bind,
            replication_bind: self.replication_bind,
            data_dir: self.data_dir,
            peers,
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(self.heartbeat_interval_ms),
                suspect_timeout: Duration::from_millis(self.suspect_timeout_ms),
            },
            replication: ReplicationConfig::default(),
            healing_interval: Duration::from_millis(self.healing_interval_ms),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            default_shards: self.default_shards,
            default_replication_factor: self.default_replication_factor,
            sync_writes: self.sync_writes,
            wal_compact_after: self.wal_compact_after,
        })
    }
}

/// Accepts `host:port`, tolerating copy-pasted `http://` prefixes.
pub fn parse_peer(raw: &str) -> anyhow::Result<SocketAddr> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/');

    if let Ok(addr) = stripped.parse() {
        return Ok(addr);
    }

    use std::net::ToSocketAddrs;
    stripped
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("peer address {} did not resolve", raw))
}

#[cfg(test)]
mod tests;
