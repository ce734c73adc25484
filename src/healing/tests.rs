//! Healing Module Tests
//!
//! ## Test Scopes
//! - **Report**: merging and the "anything happened" predicate.
//! - **Scheduling**: which shards a peer event queues, and which ones a cycle
//!   drops from the queue without contacting anyone.
//!
//! *Catch-up between live nodes is covered by the integration tests.*

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::config::{HeartbeatConfig, ReplicationConfig};
    use crate::healing::service::HealingService;
    use crate::healing::types::HealReport;
    use crate::membership::service::MembershipService;
    use crate::membership::types::{Node, NodeId, NodeStatus};
    use crate::rebalance::service::Rebalancer;
    use crate::replication::engine::ReplicationEngine;
    use crate::sharding::map::ShardMap;
    use crate::sharding::placement::build_entry;
    use crate::sharding::router::Router;
    use crate::sharding::types::{CollectionId, ShardRef};
    use crate::storage::store::ShardStore;

    fn users() -> CollectionId {
        CollectionId::new("shop", "users")
    }

    async fn healing_node(peers: &[&str]) -> (Arc<ReplicationEngine>, Arc<HealingService>) {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let membership = MembershipService::new(
            NodeId::from("n1"),
            bind,
            bind,
            vec![],
            HeartbeatConfig::default(),
        )
        .await
        .unwrap();

        let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();
        for peer in peers {
            membership.members.insert(
                NodeId::from(*peer),
                Node {
                    id: NodeId::from(*peer),
                    client_addr: unreachable,
                    replication_addr: unreachable,
                    status: NodeStatus::Alive,
                    incarnation: 1,
                    last_heartbeat: Some(Instant::now()),
                },
            );
        }

        let router = Arc::new(Router::new(Arc::new(ShardMap::new()), membership.clone()));
        let engine = ReplicationEngine::new(
            membership.clone(),
            router,
            Arc::new(ShardStore::in_memory()),
            None,
            ReplicationConfig::default(),
        );
        let rebalancer = Rebalancer::new(membership.clone(), engine.clone());
        let healing = HealingService::new(
            membership,
            engine.clone(),
            rebalancer,
            Duration::from_millis(100),
        );
        (engine, healing)
    }

    // ============================================================
    // REPORT TESTS
    // ============================================================

    #[test]
    fn test_report_merge() {
        let mut total = HealReport::default();
        assert!(!total.changed_anything());

        total.merge(&HealReport {
            shards_checked: 2,
            ..HealReport::default()
        });
        assert!(!total.changed_anything(), "checks alone change nothing");

        total.merge(&HealReport {
            shards_checked: 1,
            ops_applied: 4,
            ..HealReport::default()
        });
        assert_eq!(total.shards_checked, 3);
        assert_eq!(total.ops_applied, 4);
        assert!(total.changed_anything());
    }

    // ============================================================
    // SCHEDULING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_owned_shards_and_peer_scheduling() {
        let (engine, healing) = healing_node(&["n2", "n3"]).await;
        let nodes = [NodeId::from("n1"), NodeId::from("n2"), NodeId::from("n3")];
        // Shard i is owned by nodes i and i+1: n1 owns 0 and 2.
        engine.router().map().install(build_entry(users(), &nodes, 3, 2, 1));

        let owned = healing.owned_shards();
        assert_eq!(
            owned,
            vec![ShardRef::new(users(), 0), ShardRef::new(users(), 2)]
        );

        healing.schedule_for_peer(&NodeId::from("n2"));
        assert_eq!(engine.needs_healing(), vec![ShardRef::new(users(), 0)]);
    }

    #[tokio::test]
    async fn test_heal_shard_forgets_shards_not_owned() {
        let (engine, healing) = healing_node(&["n2"]).await;
        engine
            .router()
            .map()
            .install(build_entry(users(), &[NodeId::from("n2")], 2, 1, 1));

        let shard = ShardRef::new(users(), 1);
        engine.mark_needs_healing(shard.clone());

        let report = healing.heal_shard(&shard).await;
        assert_eq!(report, HealReport::default());
        assert!(engine.needs_healing().is_empty());
    }

    #[tokio::test]
    async fn test_failed_heal_is_retried() {
        let (engine, healing) = healing_node(&["n2"]).await;
        let nodes = [NodeId::from("n1"), NodeId::from("n2")];
        engine.router().map().install(build_entry(users(), &nodes, 1, 2, 1));

        let shard = ShardRef::new(users(), 0);
        let report = healing.heal_shard(&shard).await;

        assert_eq!(report.shards_checked, 1);
        assert_eq!(report.failures, 1);
        assert_eq!(engine.needs_healing(), vec![shard]);
    }
}
