//! Configuration Tests
//!
//! ## Test Scopes
//! - **Peer parsing**: scheme and trailing-slash tolerance.
//! - **Argument conversion**: defaults, generated ids and rejected values.

#[cfg(test)]
mod tests {
    use clap::Parser;
    use std::net::SocketAddr;
    use std::time::Duration;

    use crate::config::{NodeArgs, parse_peer};
    use crate::membership::types::NodeId;

    #[test]
    fn test_parse_peer_strips_scheme() {
        let addr = parse_peer("http://127.0.0.1:7001/").unwrap();
        assert_eq!(addr, "127.0.0.1:7001".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_args_into_config() {
        let args = NodeArgs::parse_from([
            "shardline",
            "--node-id",
            "node-a",
            "--peer",
            "127.0.0.1:7002",
            "--peer",
            "127.0.0.1:7003",
            "--default-shards",
            "4",
        ]);
        let config = args.into_config().unwrap();

        assert_eq!(config.node_id, NodeId("node-a".to_string()));
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.default_shards, 4);
        assert_eq!(config.default_replication_factor, 2);
        assert_eq!(config.heartbeat.interval, Duration::from_millis(500));
    }

    #[test]
    fn test_zero_shards_rejected() {
        let args = NodeArgs::parse_from(["shardline", "--default-shards", "0"]);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for flag in [
            "--heartbeat-interval-ms",
            "--suspect-timeout-ms",
            "--healing-interval-ms",
            "--query-timeout-ms",
        ] {
            let args = NodeArgs::parse_from(["shardline", flag, "0"]);
            let err = args.into_config().unwrap_err();
            assert!(err.to_string().contains(flag), "{flag}: {err}");
        }
    }

    #[test]
    fn test_suspect_timeout_must_exceed_heartbeat() {
        let args = NodeArgs::parse_from([
            "shardline",
            "--heartbeat-interval-ms",
            "500",
            "--suspect-timeout-ms",
            "500",
        ]);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_generated_node_ids_differ() {
        let a = NodeArgs::parse_from(["shardline"]).into_config().unwrap();
        let b = NodeArgs::parse_from(["shardline"]).into_config().unwrap();
        assert_ne!(a.node_id, b.node_id);
    }
}
