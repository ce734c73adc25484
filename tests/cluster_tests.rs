//! Cluster Integration Tests
//!
//! Several real nodes in one process, talking over loopback HTTP and UDP.
//! Every node uses ephemeral ports and its own temporary data directory; a
//! restarted node reopens the same directory under the same id.

use serde_json::{Value, json};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use shardline::config::NodeConfig;
use shardline::coordinator::types::{QueryOutput, ShardQuery};
use shardline::node::ClusterNode;
use shardline::replication::protocol::{BatchItem, ENDPOINT_REPLICATE, Mutation, ReplicateRequest};
use shardline::replication::types::{OpType, ReplicationOperation};
use shardline::sharding::types::{CollectionId, ShardRef};

const WAIT: Duration = Duration::from_secs(20);

fn users() -> CollectionId {
    CollectionId::new("shop", "users")
}

fn node_config(id: &str, dir: &TempDir, seed: Option<SocketAddr>) -> NodeConfig {
    let mut config = NodeConfig::local(id, dir.path());
    config.peers = seed.into_iter().collect();
    config.heartbeat.interval = Duration::from_millis(50);
    config.heartbeat.suspect_timeout = Duration::from_millis(600);
    config.healing_interval = Duration::from_millis(200);
    config.query_timeout = Duration::from_millis(800);
    config.replication.request_timeout = Duration::from_millis(800);
    config.replication.max_backoff = Duration::from_millis(400);
    config
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

struct Cluster {
    nodes: Vec<Option<Arc<ClusterNode>>>,
    dirs: Vec<TempDir>,
}

impl Cluster {
    async fn start(size: usize) -> Self {
        let mut cluster = Self {
            nodes: Vec::new(),
            dirs: Vec::new(),
        };
        for i in 0..size {
            let dir = tempfile::tempdir().unwrap();
            let seed = cluster.nodes.first().and_then(|n| n.as_ref()).map(|n| n.replication_addr());
            let node = ClusterNode::start(node_config(&Self::id(i), &dir, seed))
                .await
                .unwrap();
            cluster.nodes.push(Some(node));
            cluster.dirs.push(dir);
        }
        cluster.wait_for_alive(size).await;
        cluster
    }

    fn id(i: usize) -> String {
        format!("node-{i}")
    }

    fn node(&self, i: usize) -> &Arc<ClusterNode> {
        self.nodes[i].as_ref().expect("node is stopped")
    }

    fn running(&self) -> impl Iterator<Item = &Arc<ClusterNode>> {
        self.nodes.iter().flatten()
    }

    async fn wait_for_alive(&self, count: usize) {
        wait_until("membership to converge", || async move {
            self.running()
                .all(|node| node.membership().list_alive().len() == count)
        })
        .await;
    }

    fn stop(&mut self, i: usize) {
        if let Some(node) = self.nodes[i].take() {
            node.shutdown();
        }
    }

    async fn restart(&mut self, i: usize) {
        let seed = self.node(0).replication_addr();
        let node = ClusterNode::start(node_config(&Self::id(i), &self.dirs[i], Some(seed)))
            .await
            .unwrap();
        self.nodes[i] = Some(node);
    }

    /// Creates `shop/users` on node 0 and waits until every node has it.
    async fn configure(&self, num_shards: u32, replication_factor: usize) {
        let first = self.node(0);
        first
            .rebalancer()
            .create_database_everywhere("shop")
            .unwrap();
        first
            .rebalancer()
            .configure(&users(), num_shards, replication_factor)
            .unwrap();

        wait_until("the shard map to reach every node", || async move {
            self.running()
                .all(|node| node.router().entry(&users()).is_ok())
        })
        .await;
    }

    async fn insert(&self, via: usize, key: &str, value: Value) {
        self.node(via)
            .engine()
            .write("shop", "users", key, Mutation::Insert { value })
            .await
            .unwrap();
    }

    fn local_count(&self, i: usize) -> usize {
        self.node(i).engine().store().collection_count(&users())
    }
}

async fn count_via(node: &ClusterNode) -> Option<u64> {
    let result = node
        .coordinator()
        .query("shop", "users", ShardQuery::Count)
        .await
        .ok()?;
    match result.output {
        QueryOutput::Count { count } => Some(count),
        _ => None,
    }
}

async fn distinct_documents_via(node: &ClusterNode) -> usize {
    let query = ShardQuery::Documents {
        filter: Default::default(),
        limit: None,
    };
    match node.coordinator().query("shop", "users", query).await {
        Ok(result) => match result.output {
            QueryOutput::Documents { documents } => documents.len(),
            _ => 0,
        },
        Err(_) => 0,
    }
}

// ============================================================
// PLACEMENT
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_shard_has_replication_factor_owners() {
    let cluster = Cluster::start(4).await;
    cluster.configure(6, 3).await;

    for node in cluster.running() {
        let entry = node.router().entry(&users()).unwrap();
        assert_eq!(entry.assignment.len(), 6);
        for assignment in entry.assignment.values() {
            let mut owners = assignment.owners.clone();
            owners.sort();
            owners.dedup();
            assert_eq!(owners.len(), 3, "shard owners must be distinct");
        }
    }

    for node in cluster.running() {
        node.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_write_is_committed_by_each_shard_primary() {
    let cluster = Cluster::start(3).await;
    cluster.configure(3, 1).await;

    let items: Vec<BatchItem> = (0..30)
        .map(|i| BatchItem {
            key: format!("batch-{i}"),
            mutation: Mutation::Upsert { value: json!({ "i": i }) },
        })
        .collect();
    let outcomes = cluster
        .node(1)
        .engine()
        .write_batch("shop", "users", items)
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 30);
    assert!(outcomes.iter().all(|outcome| outcome.is_ok()), "{outcomes:?}");

    // With one owner per shard, every write landed on that shard's owner.
    let entry = cluster.node(0).router().entry(&users()).unwrap();
    for outcome in &outcomes {
        let owner = &entry.shard(outcome.shard_id).unwrap().owners[0];
        assert_eq!(outcome.served_by.as_ref(), Some(owner));
    }
    let primaries: std::collections::BTreeSet<_> =
        outcomes.iter().filter_map(|outcome| outcome.served_by.clone()).collect();
    assert!(primaries.len() > 1);

    let c = &cluster;
    wait_until("the batch to be countable", || async move {
        count_via(c.node(0)).await == Some(30)
    })
    .await;

    for node in cluster.running() {
        node.shutdown();
    }
}

// ============================================================
// RESHARDING & REMOVAL
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reshard_then_node_removal_keeps_every_document() {
    let mut cluster = Cluster::start(4).await;
    cluster.configure(2, 2).await;

    for i in 0..30 {
        cluster
            .insert(i % 4, &format!("doc-{i}"), json!({ "n": i }))
            .await;
    }

    cluster
        .node(0)
        .rebalancer()
        .reshard(&users(), 3, None)
        .unwrap();

    let c = &cluster;
    wait_until("redistribution into three shards", || async move {
        let settled = c
            .running()
            .all(|node| !node.rebalancer().is_resharding(&users()));
        let layout = c
            .running()
            .all(|node| node.router().entry(&users()).is_ok_and(|e| e.num_shards == 3));
        settled && layout && distinct_documents_via(c.node(0)).await == 30
    })
    .await;

    // Remove node-3 through the client API of node-0, then stop it.
    let http = reqwest::Client::new();
    let response = http
        .post(format!(
            "http://{}/_api/cluster/remove-node",
            cluster.node(0).client_addr()
        ))
        .json(&json!({ "node_address": cluster.node(3).client_addr().to_string() }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["node_id"], "node-3");
    let remaining: Vec<&str> = body["remaining"]
        .as_array()
        .unwrap()
        .iter()
        .map(|member| member["id"].as_str().unwrap())
        .collect();
    assert_eq!(remaining, vec!["node-0", "node-1", "node-2"]);
    cluster.stop(3);

    let c = &cluster;
    wait_until("documents to stay reachable after removal", || async move {
        distinct_documents_via(c.node(1)).await >= 30
    })
    .await;

    wait_until("removed node to leave every assignment", || async move {
        c.running().all(|node| {
            let entry = node.router().entry(&users()).unwrap();
            let removed = shardline::membership::types::NodeId::from("node-3");
            entry.assignment.values().all(|a| !a.holds(&removed))
        })
    })
    .await;

    for node in cluster.running() {
        node.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_node_lists_remaining_members() {
    let mut cluster = Cluster::start(3).await;

    let http = reqwest::Client::new();
    let body: Value = http
        .post(format!(
            "http://{}/_api/cluster/remove-node",
            cluster.node(0).client_addr()
        ))
        .json(&json!({ "node_address": cluster.node(2).replication_addr().to_string() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["node_id"], "node-2");
    assert_eq!(body["newly_removed"], true);
    let remaining: Vec<&str> = body["remaining"]
        .as_array()
        .unwrap()
        .iter()
        .map(|member| member["id"].as_str().unwrap())
        .collect();
    assert_eq!(remaining, vec!["node-0", "node-1"]);

    cluster.stop(2);
    for node in cluster.running() {
        node.shutdown();
    }
}

// ============================================================
// HEALING
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restarted_node_catches_up_on_missed_writes() {
    let mut cluster = Cluster::start(3).await;
    cluster.configure(3, 3).await;

    for i in 0..10 {
        cluster.insert(0, &format!("early-{i}"), json!({ "i": i })).await;
    }
    let c = &cluster;
    wait_until("initial replication", || async move {
        (0..3).all(|i| c.local_count(i) == 10)
    })
    .await;

    cluster.stop(2);
    for i in 0..10 {
        cluster.insert(0, &format!("late-{i}"), json!({ "i": i })).await;
    }

    cluster.restart(2).await;
    let c = &cluster;
    wait_until("the restarted node to heal", || async move {
        c.local_count(2) == 20
    })
    .await;
    assert_eq!(cluster.local_count(0), 20);
    assert_eq!(cluster.local_count(1), 20);

    for node in cluster.running() {
        node.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_updates_made_during_downtime_reach_the_replica() {
    let mut cluster = Cluster::start(3).await;
    cluster.configure(3, 3).await;

    let keys: Vec<String> = (0..5).map(|i| format!("user-{i}")).collect();
    for key in &keys {
        cluster.insert(0, key, json!({ "status": "active" })).await;
    }
    let c = &cluster;
    wait_until("initial replication", || async move {
        c.local_count(2) == 5
    })
    .await;

    cluster.stop(2);
    for key in &keys {
        let response = cluster
            .node(1)
            .engine()
            .write(
                "shop",
                "users",
                key,
                Mutation::Update {
                    patch: json!({ "status": "inactive" }),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.version, 2);
    }

    cluster.restart(2).await;
    let restarted = cluster.node(2).clone();
    let (keys, restarted) = (&keys, &restarted);
    wait_until("updated versions on the restarted replica", || async move {
        keys.iter().all(|key| {
            let Ok(route) = restarted.router().route("shop", "users", key) else {
                return false;
            };
            let shard = ShardRef::new(users(), route.shard_id);
            restarted
                .engine()
                .store()
                .get_live(&shard, key)
                .is_some_and(|doc| doc.version() == 2 && doc.value["status"] == "inactive")
        })
    })
    .await;

    for node in cluster.running() {
        node.shutdown();
    }
}

// ============================================================
// SCATTER-GATHER
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_query_survives_losing_the_coordinator() {
    let mut cluster = Cluster::start(4).await;
    cluster.configure(4, 2).await;

    for i in 0..20 {
        cluster.insert(0, &format!("item-{i}"), json!({ "i": i })).await;
    }
    let c = &cluster;
    wait_until("every node to see all documents", || async move {
        let mut all = true;
        for node in c.running() {
            all &= count_via(node).await == Some(20);
        }
        all
    })
    .await;

    cluster.stop(0);

    let count = count_via(cluster.node(1)).await.unwrap_or(0);
    assert!(count > 0, "remaining nodes must still answer");

    let c = &cluster;
    wait_until("full answers without the stopped node", || async move {
        count_via(c.node(2)).await == Some(20)
    })
    .await;

    for node in cluster.running() {
        node.shutdown();
    }
}

// ============================================================
// REPLAY
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_operation_delivered_twice_applies_once() {
    let cluster = Cluster::start(1).await;
    cluster.configure(2, 1).await;
    let node = cluster.node(0);

    let route = node.router().route("shop", "users", "dup").unwrap();
    let op = ReplicationOperation {
        op_id: 1,
        prev_op_id: 0,
        database: "shop".to_string(),
        collection: "users".to_string(),
        shard_id: route.shard_id,
        op_type: OpType::Insert,
        key: "dup".to_string(),
        payload: json!({ "n": 1 }),
        version: 1,
        origin_node: shardline::membership::types::NodeId::from("elsewhere"),
        timestamp: 1_000,
    };
    let request = ReplicateRequest {
        from: op.origin_node.clone(),
        ops: vec![op],
    };

    let http = reqwest::Client::new();
    let url = format!("http://{}{}", node.replication_addr(), ENDPOINT_REPLICATE);
    for _ in 0..2 {
        let response = http.post(&url).json(&request).send().await.unwrap();
        assert!(response.status().is_success());
    }

    let read = node.engine().read("shop", "users", "dup").await.unwrap();
    assert_eq!(read.value, json!({ "n": 1 }));
    assert_eq!(read.version, 1);
    assert_eq!(node.engine().store().collection_count(&users()), 1);

    node.shutdown();
}
