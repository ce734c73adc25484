//! Sharding Module Tests
//!
//! ## Test Scopes
//! - **Hashing**: key -> shard mapping is stable and in range.
//! - **Placement**: round-robin assignment, repair planning and promotion.
//! - **Shard Map**: generation-based convergence and atomic snapshot swaps.
//! - **Router**: primary selection with failover, read candidates, replica targets.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Instant;

    use crate::config::HeartbeatConfig;
    use crate::membership::service::MembershipService;
    use crate::membership::types::{Node, NodeId, NodeStatus};
    use crate::sharding::map::{InstallOutcome, ShardMap};
    use crate::sharding::placement::{
        apply_plans, build_entry, initial_assignment, plan_repairs, promote, shard_loads,
        strip_node,
    };
    use crate::sharding::router::{Router, route_in};
    use crate::sharding::types::{CollectionId, shard_for_key, stable_hash};

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|name| NodeId::from(*name)).collect()
    }

    fn users() -> CollectionId {
        CollectionId::new("shop", "users")
    }

    // ============================================================
    // HASHING TESTS
    // ============================================================

    #[test]
    fn test_stable_hash_known_values() {
        // FNV-1a reference vectors.
        assert_eq!(stable_hash(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(stable_hash(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_shard_for_key_in_range_and_deterministic() {
        for i in 0..500 {
            let key = format!("doc-{}", i);
            let shard = shard_for_key(&key, 7);
            assert!(shard < 7);
            assert_eq!(shard, shard_for_key(&key, 7));
        }
    }

    #[test]
    fn test_keys_spread_over_all_shards() {
        let mut seen = [0usize; 4];
        for i in 0..400 {
            seen[shard_for_key(&format!("k{}", i), 4) as usize] += 1;
        }
        assert!(seen.iter().all(|count| *count > 0), "{:?}", seen);
    }

    // ============================================================
    // PLACEMENT TESTS
    // ============================================================

    #[test]
    fn test_initial_assignment_is_round_robin() {
        let nodes = ids(&["c", "a", "b", "d"]);
        let assignment = initial_assignment(&nodes, 3, 2);

        assert_eq!(assignment[&0].owners, ids(&["a", "b"]));
        assert_eq!(assignment[&1].owners, ids(&["b", "c"]));
        assert_eq!(assignment[&2].owners, ids(&["c", "d"]));
    }

    #[test]
    fn test_initial_assignment_independent_of_input_order() {
        let a = initial_assignment(&ids(&["n3", "n1", "n2"]), 5, 2);
        let b = initial_assignment(&ids(&["n2", "n3", "n1"]), 5, 2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_replication_factor_capped_by_node_count() {
        let assignment = initial_assignment(&ids(&["a", "b"]), 4, 3);
        for shard in assignment.values() {
            assert_eq!(shard.owners.len(), 2);
            assert_ne!(shard.owners[0], shard.owners[1]);
        }
    }

    #[test]
    fn test_repairs_restore_replication_factor() {
        let members = ids(&["a", "b", "c", "d"]);
        let entry = build_entry(users(), &members, 3, 2, 1);

        let stripped = strip_node(&entry, &NodeId::from("b")).unwrap();
        assert_eq!(stripped.generation, 2);

        let remaining = ids(&["a", "c", "d"]);
        let mut loads = shard_loads([&stripped]);
        let plans = plan_repairs(&stripped, &remaining, &remaining, &mut loads);

        // Shards 0 (a,b) and 1 (b,c) lost a copy.
        assert_eq!(plans.len(), 2);
        for plan in &plans {
            let assignment = &stripped.assignment[&plan.shard_id];
            assert_eq!(plan.moves.len(), 1);
            let shard_move = &plan.moves[0];
            assert!(!assignment.owners.contains(&shard_move.to_node));
            assert!(assignment.owners.contains(shard_move.from_node.as_ref().unwrap()));
        }

        let next = apply_plans(&stripped, &plans);
        for (shard_id, assignment) in &next.assignment {
            assert_eq!(
                assignment.owners.len() + assignment.pending.len(),
                2,
                "shard {}",
                shard_id
            );
        }
    }

    #[test]
    fn test_repairs_prefer_least_loaded_node() {
        let collection = users();
        let mut assignment = BTreeMap::new();
        assignment.insert(
            0,
            crate::sharding::types::ShardAssignment {
                owners: ids(&["a"]),
                pending: vec![],
            },
        );
        let entry = crate::sharding::types::ShardMapEntry {
            collection,
            num_shards: 1,
            replication_factor: 2,
            generation: 1,
            assignment,
        };

        let members = ids(&["a", "b", "c"]);
        let mut loads = BTreeMap::new();
        loads.insert(NodeId::from("b"), 5);
        loads.insert(NodeId::from("c"), 1);

        let plans = plan_repairs(&entry, &members, &members, &mut loads);
        assert_eq!(plans[0].moves[0].to_node, NodeId::from("c"));
        assert_eq!(loads[&NodeId::from("c")], 2);
    }

    #[test]
    fn test_repairs_skip_suspected_candidates() {
        let entry = build_entry(users(), &ids(&["a", "b"]), 2, 2, 1);
        let stripped = strip_node(&entry, &NodeId::from("b")).unwrap();

        let members = ids(&["a", "c", "d"]);
        let alive = ids(&["a", "d"]);
        let mut loads = shard_loads([&stripped]);
        let plans = plan_repairs(&stripped, &members, &alive, &mut loads);

        for plan in plans {
            assert_eq!(plan.moves[0].to_node, NodeId::from("d"));
        }
    }

    #[test]
    fn test_shards_that_lost_every_owner_restart_empty() {
        let entry = build_entry(users(), &ids(&["a"]), 1, 1, 1);
        let stripped = strip_node(&entry, &NodeId::from("a")).unwrap();

        let members = ids(&["b"]);
        let mut loads = shard_loads([&stripped]);
        let plans = plan_repairs(&stripped, &members, &members, &mut loads);
        assert_eq!(plans[0].moves[0].from_node, None);

        let next = apply_plans(&stripped, &plans);
        assert_eq!(next.assignment[&0].owners, ids(&["b"]));
        assert!(next.assignment[&0].pending.is_empty());
    }

    #[test]
    fn test_promote_moves_pending_to_owners() {
        let mut entry = build_entry(users(), &ids(&["a"]), 1, 2, 1);
        entry.assignment.get_mut(&0).unwrap().pending.push(NodeId::from("b"));

        let promoted = promote(&entry, 0, &NodeId::from("b")).unwrap();
        assert_eq!(promoted.assignment[&0].owners, ids(&["a", "b"]));
        assert!(promoted.assignment[&0].pending.is_empty());
        assert_eq!(promoted.generation, entry.generation + 1);

        assert!(promote(&promoted, 0, &NodeId::from("b")).is_none());
    }

    #[test]
    fn test_strip_untouched_entry_is_noop() {
        let entry = build_entry(users(), &ids(&["a", "b"]), 2, 2, 1);
        assert!(strip_node(&entry, &NodeId::from("z")).is_none());
    }

    // ============================================================
    // SHARD MAP TESTS
    // ============================================================

    #[test]
    fn test_install_prefers_higher_generation() {
        let map = ShardMap::new();
        let nodes = ids(&["a", "b"]);

        let newer = build_entry(users(), &nodes, 2, 2, 5);
        let older = build_entry(users(), &nodes, 4, 2, 3);

        assert!(matches!(map.install(newer.clone()), InstallOutcome::Installed { .. }));
        assert!(matches!(map.install(older), InstallOutcome::Stale));
        assert_eq!(map.entry(&users()).unwrap().num_shards, 2);
        assert!(map.has_database("shop"));
    }

    #[test]
    fn test_equal_generation_tie_break_is_symmetric() {
        let x = build_entry(users(), &ids(&["a", "b"]), 2, 2, 4);
        let y = build_entry(users(), &ids(&["a", "c"]), 2, 2, 4);

        // Exactly one of the two wins regardless of arrival order.
        assert_ne!(x.supersedes(&y), y.supersedes(&x));

        let first = ShardMap::new();
        first.install(x.clone());
        first.install(y.clone());

        let second = ShardMap::new();
        second.install(y);
        second.install(x);

        assert_eq!(first.entry(&users()), second.entry(&users()));
    }

    #[test]
    fn test_reinstalling_same_entry_is_stale() {
        let map = ShardMap::new();
        let entry = build_entry(users(), &ids(&["a"]), 2, 1, 1);
        map.install(entry.clone());
        let version = map.version();

        assert!(matches!(map.install(entry), InstallOutcome::Stale));
        assert_eq!(map.version(), version);
    }

    #[test]
    fn test_snapshot_is_immutable_across_updates() {
        let map = ShardMap::new();
        map.install(build_entry(users(), &ids(&["a", "b"]), 2, 2, 1));

        let before = map.snapshot();
        let stripped = strip_node(&map.entry(&users()).unwrap(), &NodeId::from("b")).unwrap();
        assert!(matches!(map.install(stripped), InstallOutcome::Installed { .. }));

        let old = before.entry(&users()).unwrap();
        assert!(old.assignment[&0].owners.contains(&NodeId::from("b")));
        let new = map.entry(&users()).unwrap();
        assert!(!new.assignment[&0].owners.contains(&NodeId::from("b")));
        assert!(map.version() > before.version);
    }

    #[test]
    fn test_create_database_once() {
        let map = ShardMap::new();
        assert!(map.create_database("shop"));
        assert!(!map.create_database("shop"));
    }

    // ============================================================
    // ROUTER TESTS
    // ============================================================

    async fn router_with_peers(peers: &[(&str, NodeStatus)]) -> (Router, Arc<MembershipService>) {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let membership = MembershipService::new(
            NodeId::from("a"),
            bind,
            bind,
            vec![],
            HeartbeatConfig::default(),
        )
        .await
        .unwrap();

        for (name, status) in peers {
            membership.members.insert(
                NodeId::from(*name),
                Node {
                    id: NodeId::from(*name),
                    client_addr: bind,
                    replication_addr: bind,
                    status: *status,
                    incarnation: 1,
                    last_heartbeat: Some(Instant::now()),
                },
            );
        }

        let map = Arc::new(ShardMap::new());
        (Router::new(map, membership.clone()), membership)
    }

    #[tokio::test]
    async fn test_route_matches_pure_function() {
        let (router, _) =
            router_with_peers(&[("b", NodeStatus::Alive), ("c", NodeStatus::Alive)]).await;
        let entry = build_entry(users(), &ids(&["a", "b", "c"]), 3, 2, 1);
        router.map().install(entry.clone());

        for i in 0..50 {
            let key = format!("user-{}", i);
            let route = router.route("shop", "users", &key).unwrap();
            let pure = route_in(&entry, &key);
            assert_eq!(route.shard_id, pure.shard_id);
            assert_eq!(route.owners, pure.owners);
        }
    }

    #[tokio::test]
    async fn test_route_errors_distinguish_database_and_collection() {
        let (router, _) = router_with_peers(&[]).await;

        assert!(matches!(
            router.route("nope", "users", "k"),
            Err(crate::error::ClusterError::DatabaseNotFound(_))
        ));

        router.map().create_database("shop");
        assert!(matches!(
            router.route("shop", "users", "k"),
            Err(crate::error::ClusterError::CollectionNotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_write_primary_fails_over_past_suspected_owner() {
        let (router, _) =
            router_with_peers(&[("b", NodeStatus::Suspected), ("c", NodeStatus::Alive)]).await;

        let route = crate::sharding::router::Route {
            collection: users(),
            shard_id: 0,
            owners: ids(&["b", "c"]),
            pending: vec![],
            generation: 1,
        };
        assert_eq!(router.write_primary(&route).unwrap(), NodeId::from("c"));
        assert_eq!(router.read_candidates(&route.owners), ids(&["c", "b"]));
    }

    #[tokio::test]
    async fn test_write_primary_unavailable_when_no_owner_alive() {
        let (router, _) = router_with_peers(&[("b", NodeStatus::Suspected)]).await;
        let route = crate::sharding::router::Route {
            collection: users(),
            shard_id: 1,
            owners: ids(&["b"]),
            pending: vec![],
            generation: 1,
        };
        assert!(matches!(
            router.write_primary(&route),
            Err(crate::error::ClusterError::ShardUnavailable { shard: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_replica_targets_include_pending_exclude_self() {
        let (router, membership) =
            router_with_peers(&[("b", NodeStatus::Alive), ("c", NodeStatus::Alive)]).await;
        membership.mark_removed(&NodeId::from("c"));

        let assignment = crate::sharding::types::ShardAssignment {
            owners: ids(&["a", "b", "c"]),
            pending: ids(&["d"]),
        };
        assert_eq!(router.replica_targets(&assignment), ids(&["b", "d"]));
    }
}
