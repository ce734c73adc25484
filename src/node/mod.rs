//! # Cluster Node
//!
//! Wires every component of one process together and owns its background
//! tasks:
//!
//! - **Client listener**: the `/_api/*` routes in [`handlers`].
//! - **Replication listener**: the `/internal/*` routes used between nodes.
//! - **Gossip**: the membership service's UDP socket, on the replication port.
//! - **Event loop**: turns membership events into healing and rebalancing.
//! - **Healing loop**: periodic catch-up and map anti-entropy.
//!
//! On startup the write-ahead log is replayed in order before any listener
//! accepts traffic, so a restarted node comes back with its documents, logs,
//! shard map and removed-node tombstones.

pub mod handlers;
pub mod protocol;


use anyhow::Context;
use axum::{
    Router as HttpRouter,
    extract::Extension,
    routing::{get, post, put},
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::coordinator::executor::LocalQueryExecutor;
use crate::coordinator::service::ScatterGatherCoordinator;
use crate::healing::service::HealingService;
use crate::membership::service::MembershipService;
use crate::membership::types::{MembershipEvent, NodeId};
use crate::rebalance::service::Rebalancer;
use crate::replication::engine::ReplicationEngine;
use crate::sharding::map::ShardMap;
use crate::sharding::router::Router;
use crate::storage::store::ShardStore;
use crate::storage::wal::{Wal, WalRecord};
use protocol::CollectionDefaults;

const WAL_FILE: &str = "shardline.wal";

pub struct ClusterNode {
    config: NodeConfig,
    client_addr: SocketAddr,
    membership: Arc<MembershipService>,
    router: Arc<Router>,
    engine: Arc<ReplicationEngine>,
    rebalancer: Arc<Rebalancer>,
    healing: Arc<HealingService>,
    coordinator: Arc<ScatterGatherCoordinator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl ClusterNode {
    pub async fn start(config: NodeConfig) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data directory {:?}", config.data_dir))?;

        // 1. Listeners and membership. Gossip binds the replication address
        //    first; the internal HTTP listener then takes the same port on TCP.
        let client_listener = TcpListener::bind(config.client_bind)
            .await
            .with_context(|| format!("binding client listener on {}", config.client_bind))?;
        let client_addr = client_listener.local_addr()?;

        let membership = MembershipService::new(
            config.node_id.clone(),
            client_addr,
            config.replication_bind,
            config.peers.clone(),
            config.heartbeat,
        )
        .await
        .context("starting membership")?;
        let replication_addr = membership.local_node.replication_addr;
        let replication_listener = TcpListener::bind(replication_addr)
            .await
            .with_context(|| format!("binding replication listener on {}", replication_addr))?;

        info!(
            "Node {} serving clients on {} and peers on {}",
            config.node_id, client_addr, replication_addr
        );

        // 2. Durable state.
        let (wal, records) = Wal::open(config.data_dir.join(WAL_FILE), config.sync_writes)
            .context("opening write-ahead log")?;

        let map = Arc::new(ShardMap::new());
        let router = Arc::new(Router::new(map.clone(), membership.clone()));
        let store = Arc::new(ShardStore::in_memory());
        let engine = ReplicationEngine::new(
            membership.clone(),
            router.clone(),
            store.clone(),
            Some(Arc::new(wal)),
            config.replication,
        );

        let replayed = records.len();
        let mut removed: Vec<NodeId> = Vec::new();
        for record in records {
            match record {
                WalRecord::ShardMap(entry) => {
                    map.install(entry);
                }
                WalRecord::Database { name } => {
                    map.create_database(&name);
                }
                WalRecord::NodeRemoved { node_id } => removed.push(node_id),
                other => engine.replay(&other)?,
            }
        }
        membership.preload_removed(removed.clone());
        engine.restore_op_counter();
        if replayed > 0 {
            info!(
                "Recovered {} WAL records: {} shards, {} collections",
                replayed,
                store.shards().len(),
                map.snapshot().entries.len()
            );
        }

        if replayed > config.wal_compact_after {
            let snapshot = map.snapshot();
            let mut state: Vec<WalRecord> = snapshot
                .databases
                .iter()
                .map(|name| WalRecord::Database { name: name.clone() })
                .collect();
            state.extend(
                snapshot
                    .entries
                    .values()
                    .map(|entry| WalRecord::ShardMap(entry.as_ref().clone())),
            );
            removed.sort();
            removed.dedup();
            state.extend(removed.into_iter().map(|node_id| WalRecord::NodeRemoved { node_id }));
            engine
                .compact_wal(state)
                .context("compacting write-ahead log")?;
        }

        // 3. Services.
        let rebalancer = Rebalancer::new(membership.clone(), engine.clone());
        let healing = HealingService::new(
            membership.clone(),
            engine.clone(),
            rebalancer.clone(),
            config.healing_interval,
        );
        let coordinator = ScatterGatherCoordinator::new(
            router.clone(),
            engine.client().clone(),
            Arc::new(LocalQueryExecutor::new(store)),
            config.query_timeout,
        );

        let node = Arc::new(Self {
            client_addr,
            membership: membership.clone(),
            router,
            engine: engine.clone(),
            rebalancer: rebalancer.clone(),
            healing: healing.clone(),
            coordinator: coordinator.clone(),
            config,
            tasks: Mutex::new(Vec::new()),
            stop: watch::channel(false).0,
        });

        // 4. Background tasks. Subscribe before gossip starts so no join is missed.
        let events = membership.subscribe();
        let mut tasks = membership.clone().start();

        let client_app = client_routes().layer(Extension(node.clone()));
        serve("client", client_listener, client_app, node.stop.subscribe());

        let replication_app = replication_routes()
            .layer(Extension(engine))
            .layer(Extension(rebalancer.clone()))
            .layer(Extension(membership))
            .layer(Extension(coordinator));
        serve(
            "replication",
            replication_listener,
            replication_app,
            node.stop.subscribe(),
        );

        tasks.push(tokio::spawn(node.clone().event_loop(events)));
        tasks.push(healing.start());

        rebalancer.resume_interrupted_layout_moves();
        node.tasks.lock().extend(tasks);

        Ok(node)
    }

    async fn event_loop(self: Arc<Self>, mut events: tokio::sync::broadcast::Receiver<MembershipEvent>) {
        loop {
            match events.recv().await {
                Ok(MembershipEvent::Removed(id)) => {
                    info!("Node {} removed; repairing shard ownership", id);
                    if let Err(e) = self.engine.persist(&WalRecord::NodeRemoved { node_id: id }) {
                        warn!("Failed to persist node removal: {}", e);
                    }
                    self.rebalancer.reconcile();
                }
                Ok(MembershipEvent::Joined(id)) => {
                    self.healing.schedule_for_peer(&id);
                    self.rebalancer.reconcile();
                }
                Ok(MembershipEvent::Recovered(id)) => self.healing.schedule_for_peer(&id),
                Ok(MembershipEvent::Suspected(_)) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!("Missed {} membership events; reconciling", missed);
                    self.rebalancer.reconcile();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    pub fn local_id(&self) -> &NodeId {
        self.membership.local_id()
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn replication_addr(&self) -> SocketAddr {
        self.membership.local_node.replication_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn defaults(&self) -> CollectionDefaults {
        CollectionDefaults {
            num_shards: self.config.default_shards,
            replication_factor: self.config.default_replication_factor,
        }
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn engine(&self) -> &Arc<ReplicationEngine> {
        &self.engine
    }

    pub fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    pub fn healing(&self) -> &Arc<HealingService> {
        &self.healing
    }

    pub fn coordinator(&self) -> &Arc<ScatterGatherCoordinator> {
        &self.coordinator
    }

    /// Stops every background task and closes both listeners, idle
    /// keep-alive connections included. Peers see the node go silent and
    /// suspect it; its data directory can be reopened by a new `start`.
    pub fn shutdown(&self) {
        info!("Shutting down node {}", self.local_id());
        self.stop.send_replace(true);
        self.engine.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn client_routes() -> HttpRouter {
    use protocol::*;

    HttpRouter::new()
        .route(ENDPOINT_HEALTH, get(handlers::handle_health))
        .route(ENDPOINT_CLUSTER_STATUS, get(handlers::handle_cluster_status))
        .route(ENDPOINT_REMOVE_NODE, post(handlers::handle_remove_node))
        .route(ENDPOINT_REBALANCE, post(handlers::handle_rebalance))
        .route(ENDPOINT_DATABASE, post(handlers::handle_create_database))
        .route(ENDPOINT_COLLECTION, post(handlers::handle_create_collection))
        .route(ENDPOINT_COLLECTION_PROPERTIES, put(handlers::handle_collection_properties))
        .route(ENDPOINT_COLLECTION_RESHARD, post(handlers::handle_reshard))
        .route(ENDPOINT_COLLECTION_SHARDING, get(handlers::handle_sharding))
        .route(ENDPOINT_COLLECTION_COUNT, get(handlers::handle_count))
        .route(ENDPOINT_COLLECTION_LOCAL_COUNT, get(handlers::handle_local_count))
        .route(
            ENDPOINT_DOCUMENTS,
            post(handlers::handle_insert).put(handlers::handle_batch_write),
        )
        .route(
            ENDPOINT_DOCUMENT,
            get(handlers::handle_read)
                .put(handlers::handle_upsert)
                .patch(handlers::handle_update)
                .delete(handlers::handle_delete),
        )
        .route(ENDPOINT_QUERY, post(handlers::handle_query))
}

fn replication_routes() -> HttpRouter {
    use crate::coordinator::handlers::handle_shard_query;
    use crate::coordinator::protocol::ENDPOINT_QUERY;
    use crate::rebalance::handlers::*;
    use crate::rebalance::protocol::*;
    use crate::replication::handlers::*;
    use crate::replication::protocol::*;

    HttpRouter::new()
        .route(ENDPOINT_REPLICATE, post(handle_replicate))
        .route(ENDPOINT_FORWARD_WRITE, post(handle_forward_write))
        .route(ENDPOINT_FORWARD_BATCH, post(handle_forward_batch))
        .route(ENDPOINT_CATCH_UP, post(handle_catch_up))
        .route(
            &format!("{}/:db/:coll/:shard", ENDPOINT_SNAPSHOT),
            get(handle_snapshot),
        )
        .route(
            &format!("{}/:db/:coll/:shard/:key", ENDPOINT_READ),
            get(handle_local_read),
        )
        .route(ENDPOINT_QUERY, post(handle_shard_query))
        .route(
            ENDPOINT_SHARD_MAP,
            get(handle_get_shard_map).post(handle_push_shard_map),
        )
        .route(ENDPOINT_DATABASE, post(handle_create_database))
        .route(ENDPOINT_MIGRATE, post(handle_migrate))
        .route(ENDPOINT_NODE_REMOVED, post(handle_node_removed))
}

fn serve(
    name: &'static str,
    listener: TcpListener,
    app: HttpRouter,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stopped = async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(stopped)
            .await
        {
            warn!("{} listener stopped: {}", name, e);
        }
    })
}
