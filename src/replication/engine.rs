use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::client::{Backoff, PeerClient};
use super::log::{CatchUp, OperationLog};
use super::protocol::{
    BatchItem, BatchItemOutcome, CatchUpRequest, CatchUpResponse, ENDPOINT_CATCH_UP,
    ENDPOINT_FORWARD_BATCH, ENDPOINT_FORWARD_WRITE, ENDPOINT_READ, ENDPOINT_REPLICATE,
    ENDPOINT_SNAPSHOT, ForwardBatchRequest, ForwardWriteRequest, LocalReadResponse, Mutation,
    ReadResponse, ReplicateRequest, ReplicateResponse, WriteResponse,
};
use super::types::{
    HybridClock, OpType, ReplicationOperation, Sequencing, ShardSnapshot, StreamId,
    StreamPosition,
};
use crate::config::ReplicationConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::membership::{service::MembershipService, types::NodeId};
use crate::sharding::router::{Route, Router, route_in};
use crate::sharding::types::{CollectionId, ShardId, ShardRef, shard_for_key};
use crate::storage::store::{ShardStore, apply_in};
use crate::storage::types::{ApplyOutcome, Document, merge_patch, wins_over};
use crate::storage::wal::{Wal, WalRecord};

/// Operations shipped per replicate request.
const MAX_BATCH: usize = 128;

/// Result of bringing one shard in line with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate,
    CaughtUp { applied: usize },
    Snapshot { documents: usize, applied: usize },
    /// The peer cannot serve the missing range from its log.
    SnapshotRequired,
}

pub struct ReplicationEngine {
    membership: Arc<MembershipService>,
    router: Arc<Router>,
    store: Arc<ShardStore>,
    log: Arc<OperationLog>,
    wal: Option<Arc<Wal>>,
    client: PeerClient,
    next_op_id: AtomicU64,
    clock: HybridClock,
    shippers: DashMap<(NodeId, ShardRef), mpsc::Sender<ReplicationOperation>>,
    needs_healing: DashSet<ShardRef>,
    closed: Arc<AtomicBool>,
}

impl ReplicationEngine {
    pub fn new(
        membership: Arc<MembershipService>,
        router: Arc<Router>,
        store: Arc<ShardStore>,
        wal: Option<Arc<Wal>>,
        config: ReplicationConfig,
    ) -> Arc<Self> {
        let client = PeerClient::new(membership.clone(), config);
        Arc::new(Self {
            membership,
            router,
            store,
            log: Arc::new(OperationLog::new()),
            wal,
            client,
            next_op_id: AtomicU64::new(0),
            clock: HybridClock::new(),
            shippers: DashMap::new(),
            needs_healing: DashSet::new(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_id(&self) -> &NodeId {
        self.membership.local_id()
    }

    pub fn store(&self) -> &Arc<ShardStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<OperationLog> {
        &self.log
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn client(&self) -> &PeerClient {
        &self.client
    }

    pub fn persist(&self, record: &WalRecord) -> ClusterResult<()> {
        match &self.wal {
            Some(wal) => wal.append(record),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------
    // Keyed writes
    // ------------------------------------------------------------

    /// Entry point for client writes: commits here when this node is the
    /// acting primary, forwards otherwise.
    pub async fn write(
        &self,
        database: &str,
        collection: &str,
        key: &str,
        mutation: Mutation,
    ) -> ClusterResult<WriteResponse> {
        let route = self.router.route(database, collection, key)?;
        let primary = self.router.write_primary(&route)?;

        if &primary == self.local_id() {
            return self.commit(&route, key, mutation);
        }
        self.forward(&route, key, mutation).await
    }

    /// A write forwarded by a peer. Any owner accepts it: the sender already
    /// decided this node is the best primary it can reach.
    pub fn accept_forwarded(&self, req: ForwardWriteRequest) -> ClusterResult<WriteResponse> {
        let route = self.router.route(&req.database, &req.collection, &req.key)?;
        if !route.owners.contains(self.local_id()) {
            return Err(ClusterError::ShardUnavailable {
                collection: route.collection.to_string(),
                shard: route.shard_id,
            });
        }
        self.commit(&route, &req.key, req.mutation)
    }

    async fn forward(&self, route: &Route, key: &str, mutation: Mutation) -> ClusterResult<WriteResponse> {
        let request = ForwardWriteRequest {
            database: route.collection.database.clone(),
            collection: route.collection.collection.clone(),
            key: key.to_string(),
            mutation,
        };

        for owner in route
            .owners
            .iter()
            .filter(|owner| self.membership.is_alive(owner))
        {
            if owner == self.local_id() {
                return self.commit(route, key, request.mutation);
            }

            match self
                .client
                .post::<_, WriteResponse>(owner, ENDPOINT_FORWARD_WRITE, &request)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e @ ClusterError::NodeUnreachable { .. }) => {
                    warn!("Forwarding write for {} to {} failed: {}", key, owner, e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClusterError::ShardUnavailable {
            collection: route.collection.to_string(),
            shard: route.shard_id,
        })
    }

    // ------------------------------------------------------------
    // Batch writes
    // ------------------------------------------------------------

    /// Groups `items` by shard and commits every group at its acting primary,
    /// locally or with one forwarded request per shard. A failure only marks
    /// the keys it affected; outcomes come back in shard order.
    pub async fn write_batch(
        &self,
        database: &str,
        collection: &str,
        items: Vec<BatchItem>,
    ) -> ClusterResult<Vec<BatchItemOutcome>> {
        let entry = self.router.entry(&CollectionId::new(database, collection))?;

        let mut groups: BTreeMap<ShardId, (Route, Vec<BatchItem>)> = BTreeMap::new();
        for item in items {
            let route = route_in(&entry, &item.key);
            groups
                .entry(route.shard_id)
                .or_insert_with(|| (route, Vec::new()))
                .1
                .push(item);
        }

        let outcomes = join_all(
            groups
                .into_values()
                .map(|(route, items)| self.write_group(route, items)),
        )
        .await;
        Ok(outcomes.into_iter().flatten().collect())
    }

    async fn write_group(&self, route: Route, items: Vec<BatchItem>) -> Vec<BatchItemOutcome> {
        let primary = match self.router.write_primary(&route) {
            Ok(primary) => primary,
            Err(e) => return Self::fail_all(&route, items, &e),
        };
        if &primary == self.local_id() {
            return self.commit_group(&route, items);
        }

        let request = ForwardBatchRequest {
            database: route.collection.database.clone(),
            collection: route.collection.collection.clone(),
            items,
        };
        for owner in route
            .owners
            .iter()
            .filter(|owner| self.membership.is_alive(owner))
        {
            if owner == self.local_id() {
                return self.commit_group(&route, request.items);
            }

            match self
                .client
                .post::<_, Vec<BatchItemOutcome>>(owner, ENDPOINT_FORWARD_BATCH, &request)
                .await
            {
                Ok(outcomes) => return outcomes,
                Err(e @ ClusterError::NodeUnreachable { .. }) => {
                    warn!(
                        "Forwarding {} writes for {} to {} failed: {}",
                        request.items.len(),
                        route.collection,
                        owner,
                        e
                    );
                }
                Err(e) => return Self::fail_all(&route, request.items, &e),
            }
        }

        let unavailable = ClusterError::ShardUnavailable {
            collection: route.collection.to_string(),
            shard: route.shard_id,
        };
        Self::fail_all(&route, request.items, &unavailable)
    }

    /// A batch forwarded by a peer. Items are re-routed against the local
    /// layout; those of shards this node does not own are refused one by one.
    pub fn accept_forwarded_batch(&self, req: ForwardBatchRequest) -> ClusterResult<Vec<BatchItemOutcome>> {
        let entry = self
            .router
            .entry(&CollectionId::new(req.database, req.collection))?;

        Ok(req
            .items
            .into_iter()
            .map(|item| {
                let route = route_in(&entry, &item.key);
                let result = if route.owners.contains(self.local_id()) {
                    self.commit(&route, &item.key, item.mutation)
                } else {
                    Err(ClusterError::ShardUnavailable {
                        collection: route.collection.to_string(),
                        shard: route.shard_id,
                    })
                };
                BatchItemOutcome::from_result(item.key, route.shard_id, result)
            })
            .collect())
    }

    fn commit_group(&self, route: &Route, items: Vec<BatchItem>) -> Vec<BatchItemOutcome> {
        items
            .into_iter()
            .map(|item| {
                let result = self.commit(route, &item.key, item.mutation);
                BatchItemOutcome::from_result(item.key, route.shard_id, result)
            })
            .collect()
    }

    fn fail_all(route: &Route, items: Vec<BatchItem>, error: &ClusterError) -> Vec<BatchItemOutcome> {
        items
            .into_iter()
            .map(|item| BatchItemOutcome::failed(item.key, route.shard_id, error))
            .collect()
    }

    /// Local commit under the shard write lock, then asynchronous shipping to
    /// the other holders. The caller is acknowledged without waiting for them.
    fn commit(&self, route: &Route, key: &str, mutation: Mutation) -> ClusterResult<WriteResponse> {
        let shard = ShardRef::new(route.collection.clone(), route.shard_id);
        let local = self.local_id().clone();

        let op = self.store.write(&shard, |store| {
            let existing = store.get(&shard, key);
            if let Some(doc) = &existing {
                self.clock.observe(doc.stamp.timestamp);
            }
            let live = existing.as_ref().filter(|doc| doc.is_live());

            let (op_type, payload, version) = match mutation {
                Mutation::Insert { value } => {
                    if live.is_some() {
                        return Err(ClusterError::DocumentExists(key.to_string()));
                    }
                    let version = existing.as_ref().map(|doc| doc.version() + 1).unwrap_or(1);
                    (OpType::Insert, value, version)
                }
                Mutation::Upsert { value } => {
                    let version = existing.as_ref().map(|doc| doc.version() + 1).unwrap_or(1);
                    let op_type = if live.is_some() {
                        OpType::Update
                    } else {
                        OpType::Insert
                    };
                    (op_type, value, version)
                }
                Mutation::Update { patch } => {
                    let current =
                        live.ok_or_else(|| ClusterError::DocumentNotFound(key.to_string()))?;
                    (
                        OpType::Update,
                        merge_patch(&current.value, &patch),
                        current.version() + 1,
                    )
                }
                Mutation::Delete => {
                    let current =
                        live.ok_or_else(|| ClusterError::DocumentNotFound(key.to_string()))?;
                    (OpType::Delete, Value::Null, current.version() + 1)
                }
            };

            let stream = StreamId {
                origin: local.clone(),
                shard: shard.clone(),
            };
            let op = ReplicationOperation {
                op_id: self.next_op_id.fetch_add(1, Ordering::SeqCst) + 1,
                prev_op_id: self.log.watermark(&stream),
                database: route.collection.database.clone(),
                collection: route.collection.collection.clone(),
                shard_id: route.shard_id,
                op_type,
                key: key.to_string(),
                payload,
                version,
                origin_node: local.clone(),
                timestamp: self.clock.tick(),
            };

            self.persist(&WalRecord::Operation(op.clone()))?;
            apply_in(store, &shard, op.to_document());
            self.log.record(&op);
            Ok(op)
        })?;

        debug!(
            "Committed {:?} {} v{} on {} (op {})",
            op.op_type, op.key, op.version, shard, op.op_id
        );
        self.ship(&op);

        Ok(WriteResponse {
            key: op.key,
            shard_id: op.shard_id,
            version: op.version,
            served_by: local,
        })
    }

    // ------------------------------------------------------------
    // Shipping
    // ------------------------------------------------------------

    /// Queues `op` for every other holder of its shard.
    pub fn ship(&self, op: &ReplicationOperation) {
        let Some(entry) = self.router.map().entry(&op.collection_id()) else {
            return;
        };
        let Some(assignment) = entry.shard(op.shard_id) else {
            return;
        };

        for target in self.router.replica_targets(assignment) {
            self.enqueue(target, op.clone());
        }
    }

    fn enqueue(&self, target: NodeId, op: ReplicationOperation) {
        let key = (target, op.shard_ref());
        let sender = self
            .shippers
            .entry(key.clone())
            .or_insert_with(|| self.spawn_shipper(key.0.clone(), key.1.clone()))
            .clone();

        match sender.try_send(op) {
            Ok(()) => {}
            Err(TrySendError::Full(op)) => {
                warn!(
                    "Replication queue to {} for {} is full; op {} left to healing",
                    key.0, key.1, op.op_id
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.shippers.remove(&key);
            }
        }
    }

    fn spawn_shipper(&self, target: NodeId, shard: ShardRef) -> mpsc::Sender<ReplicationOperation> {
        let (tx, rx) = mpsc::channel(self.client.config().queue_capacity);
        let shipper = Shipper {
            local: self.local_id().clone(),
            target,
            shard,
            client: self.client.clone(),
            membership: self.membership.clone(),
            log: self.log.clone(),
            closed: self.closed.clone(),
            rx,
        };
        tokio::spawn(shipper.run());
        tx
    }

    /// Stops every shipper; queued operations are left to healing.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shippers.clear();
    }

    // ------------------------------------------------------------
    // Applying remote operations
    // ------------------------------------------------------------

    pub fn apply_batch(&self, ops: &[ReplicationOperation]) -> ClusterResult<ReplicateResponse> {
        let mut gap = false;
        for op in ops {
            if self.apply_operation(op, true)? == Sequencing::Gap {
                gap = true;
            }
        }

        let positions = ops
            .first()
            .map(|op| self.log.positions(&op.shard_ref()))
            .unwrap_or_default();
        Ok(ReplicateResponse { positions, gap })
    }

    /// Applies one replicated operation under last-writer-wins. Re-applying an
    /// operation is a no-op.
    pub fn apply_operation(&self, op: &ReplicationOperation, persist: bool) -> ClusterResult<Sequencing> {
        let collection = op.collection_id();
        if let Some(entry) = self.router.map().entry(&collection) {
            let expected = shard_for_key(&op.key, entry.num_shards);
            if expected != op.shard_id {
                debug!(
                    "Op {} for {} routed to shard {} but layout says {}; re-routing",
                    op.op_id, op.key, op.shard_id, expected
                );
                let shard = ShardRef::new(collection, expected);
                self.apply_document(&shard, op.to_document(), persist)?;
                return Ok(Sequencing::Rerouted);
            }
        }

        self.clock.observe(op.timestamp);
        let shard = op.shard_ref();
        let sequencing = self.store.write(&shard, |store| -> ClusterResult<Sequencing> {
            let sequencing = self.log.classify(op);
            if sequencing == Sequencing::Duplicate {
                // At or below the stream watermark is usually a re-delivery,
                // but an origin whose op counter went backwards (torn WAL
                // tail, wiped data directory) reuses ids for new writes.
                // Last-writer-wins still decides; only the log is skipped.
                let document = op.to_document();
                if wins_over(&document, store.get(&shard, &op.key).as_ref()) {
                    if persist {
                        self.persist(&WalRecord::Document {
                            shard: shard.clone(),
                            document: document.clone(),
                        })?;
                    }
                    debug!(
                        "Op {} from {} on {} reuses a seen id but carries a newer {}",
                        op.op_id, op.origin_node, shard, op.key
                    );
                    store.put(&shard, document);
                }
                return Ok(sequencing);
            }

            if persist {
                self.persist(&WalRecord::Operation(op.clone()))?;
            }
            if apply_in(store, &shard, op.to_document()) == ApplyOutcome::Superseded {
                debug!(
                    "Op {} from {} on {} superseded by stored copy of {}",
                    op.op_id, op.origin_node, shard, op.key
                );
            }
            if sequencing == Sequencing::InOrder {
                self.log.record(op);
            }
            Ok(sequencing)
        })?;

        if sequencing == Sequencing::Gap && self.needs_healing.insert(shard.clone()) {
            info!(
                "Gap in stream {} -> {} (prev {} unseen); scheduling heal",
                op.origin_node, shard, op.prev_op_id
            );
        }

        Ok(sequencing)
    }

    /// Applies a document outside any stream (migration, re-routing).
    pub fn apply_document(&self, shard: &ShardRef, doc: Document, persist: bool) -> ClusterResult<ApplyOutcome> {
        self.store.write(shard, |store| {
            if !wins_over(&doc, store.get(shard, &doc.key).as_ref()) {
                return Ok(ApplyOutcome::Superseded);
            }
            if persist {
                self.persist(&WalRecord::Document {
                    shard: shard.clone(),
                    document: doc.clone(),
                })?;
            }
            store.put(shard, doc);
            Ok(ApplyOutcome::Applied)
        })
    }

    /// Physically removes documents that now live in another shard.
    pub fn evict(&self, shard: &ShardRef, keys: &[String], persist: bool) -> ClusterResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.store.write(shard, |store| {
            if persist {
                self.persist(&WalRecord::Evict {
                    shard: shard.clone(),
                    keys: keys.to_vec(),
                })?;
            }
            for key in keys {
                store.delete(shard, key);
            }
            Ok(())
        })
    }

    /// Evicts moved documents, skipping any key whose stored copy changed
    /// since it was handed to its new shard.
    pub fn evict_moved(&self, shard: &ShardRef, moved: &[Document]) -> ClusterResult<usize> {
        let keys: Vec<String> = self.store.read(shard, |store| {
            moved
                .iter()
                .filter(|doc| {
                    store
                        .get(shard, &doc.key)
                        .is_some_and(|current| current.stamp == doc.stamp)
                })
                .map(|doc| doc.key.clone())
                .collect()
        });
        let evicted = keys.len();
        self.evict(shard, &keys, true)?;
        Ok(evicted)
    }

    /// Takes over documents migrated into `shard` from another layout. Each
    /// one that wins locally is re-issued as an operation of this node's own
    /// stream, so the other holders receive it and catch-up can replay it.
    pub fn adopt(&self, shard: &ShardRef, documents: Vec<Document>) -> ClusterResult<usize> {
        let local = self.local_id().clone();
        let stream = StreamId {
            origin: local.clone(),
            shard: shard.clone(),
        };

        let ops = self.store.write(shard, |store| -> ClusterResult<Vec<ReplicationOperation>> {
            let mut ops = Vec::new();
            for doc in documents {
                if !wins_over(&doc, store.get(shard, &doc.key).as_ref()) {
                    continue;
                }
                let op = ReplicationOperation {
                    op_id: self.next_op_id.fetch_add(1, Ordering::SeqCst) + 1,
                    prev_op_id: self.log.watermark(&stream),
                    database: shard.collection.database.clone(),
                    collection: shard.collection.collection.clone(),
                    shard_id: shard.shard_id,
                    op_type: if doc.deleted { OpType::Delete } else { OpType::Insert },
                    key: doc.key,
                    payload: doc.value,
                    version: doc.stamp.version,
                    origin_node: local.clone(),
                    timestamp: doc.stamp.timestamp,
                };
                self.persist(&WalRecord::Operation(op.clone()))?;
                apply_in(store, shard, op.to_document());
                self.log.record(&op);
                ops.push(op);
            }
            Ok(ops)
        })?;

        for op in &ops {
            self.ship(op);
        }
        Ok(ops.len())
    }

    /// Drops a shard this node no longer holds.
    pub fn drop_shard(&self, shard: &ShardRef, persist: bool) -> ClusterResult<usize> {
        let local = self.local_id().clone();
        let dropped = self.store.write(shard, |store| -> ClusterResult<usize> {
            if persist {
                self.persist(&WalRecord::ShardDropped {
                    shard: shard.clone(),
                })?;
            }
            let dropped = store.drop_shard(shard);
            self.log.forget_shard(shard, &local);
            Ok(dropped)
        })?;
        self.needs_healing.remove(shard);
        Ok(dropped)
    }

    // ------------------------------------------------------------
    // Snapshots & catch-up
    // ------------------------------------------------------------

    /// Documents and stream positions of a shard, taken under its read lock so
    /// the two agree.
    pub fn snapshot(&self, shard: &ShardRef) -> ShardSnapshot {
        self.store.read(shard, |store| ShardSnapshot {
            shard: shard.clone(),
            documents: store.scan(shard),
            positions: self.log.positions(shard),
        })
    }

    pub fn install_snapshot(&self, snapshot: &ShardSnapshot, persist: bool) -> ClusterResult<usize> {
        let shard = &snapshot.shard;
        self.store.write(shard, |store| {
            if persist {
                self.persist(&WalRecord::Snapshot(snapshot.clone()))?;
            }
            let applied = snapshot
                .documents
                .iter()
                .filter(|doc| apply_in(store, shard, (*doc).clone()) == ApplyOutcome::Applied)
                .count();
            self.log.fast_forward(shard, &snapshot.positions);
            Ok(applied)
        })
    }

    pub async fn pull_snapshot(&self, source: &NodeId, shard: &ShardRef) -> ClusterResult<usize> {
        let path = format!(
            "{}/{}/{}/{}",
            ENDPOINT_SNAPSHOT, shard.collection.database, shard.collection.collection, shard.shard_id
        );
        let timeout = self.client.config().request_timeout * 5;
        let snapshot: ShardSnapshot = self.client.get_with_retry(source, &path, timeout, 3).await?;

        self.log
            .record_positions(source, shard, &snapshot.positions);
        let applied = self.install_snapshot(&snapshot, true)?;
        info!(
            "Installed snapshot of {} from {}: {} documents, {} applied",
            shard,
            source,
            snapshot.documents.len(),
            applied
        );
        Ok(snapshot.documents.len())
    }

    pub fn serve_catch_up(&self, req: &CatchUpRequest) -> CatchUpResponse {
        self.log
            .record_positions(&req.requester, &req.shard, &req.positions);
        let max_ops = self.client.config().max_catch_up_ops;

        let (catch_up, positions) = self.store.read(&req.shard, |_| {
            (
                self.log.ops_after(&req.shard, &req.positions, max_ops),
                self.log.positions(&req.shard),
            )
        });

        match catch_up {
            CatchUp::Operations(ops) => CatchUpResponse::Operations { ops, positions },
            CatchUp::SnapshotRequired => CatchUpResponse::SnapshotRequired,
        }
    }

    /// Requests every operation `peer` has on `shard` beyond the local stream
    /// positions and applies them in order.
    pub async fn catch_up(&self, shard: &ShardRef, peer: &NodeId) -> ClusterResult<SyncOutcome> {
        let request = CatchUpRequest {
            requester: self.local_id().clone(),
            shard: shard.clone(),
            positions: self.log.positions(shard),
        };

        let response: CatchUpResponse = self.client.post(peer, ENDPOINT_CATCH_UP, &request).await?;
        let (ops, peer_positions) = match response {
            CatchUpResponse::SnapshotRequired => return Ok(SyncOutcome::SnapshotRequired),
            CatchUpResponse::Operations { ops, positions } => (ops, positions),
        };

        self.log.record_positions(peer, shard, &peer_positions);

        let mut applied = 0;
        for op in &ops {
            if self.apply_operation(op, true)? == Sequencing::InOrder {
                applied += 1;
            }
        }

        if !self.covers(shard, &peer_positions) {
            debug!("Catch-up of {} from {} left a hole; snapshot needed", shard, peer);
            return Ok(SyncOutcome::SnapshotRequired);
        }

        if applied == 0 {
            Ok(SyncOutcome::UpToDate)
        } else {
            Ok(SyncOutcome::CaughtUp { applied })
        }
    }

    fn covers(&self, shard: &ShardRef, positions: &[StreamPosition]) -> bool {
        positions.iter().all(|position| {
            let stream = StreamId {
                origin: position.origin.clone(),
                shard: shard.clone(),
            };
            self.log.watermark(&stream) >= position.op_id
        })
    }

    /// Catch-up with snapshot fallback; the mechanism shared by healing and
    /// rebalance migrations.
    pub async fn sync_shard(&self, shard: &ShardRef, source: &NodeId) -> ClusterResult<SyncOutcome> {
        let outcome = match self.catch_up(shard, source).await? {
            SyncOutcome::SnapshotRequired => {
                let documents = self.pull_snapshot(source, shard).await?;
                match self.catch_up(shard, source).await? {
                    SyncOutcome::SnapshotRequired => {
                        return Err(ClusterError::RebalanceIncomplete {
                            collection: shard.collection.to_string(),
                            reason: format!(
                                "log of {} on {} moved past the snapshot",
                                shard, source
                            ),
                        });
                    }
                    SyncOutcome::CaughtUp { applied } => SyncOutcome::Snapshot { documents, applied },
                    _ => SyncOutcome::Snapshot {
                        documents,
                        applied: 0,
                    },
                }
            }
            other => other,
        };

        self.needs_healing.remove(shard);
        Ok(outcome)
    }

    /// Full copy for a node that is about to become an owner: snapshot first,
    /// then whatever the source committed while the snapshot was in flight.
    pub async fn transfer_shard(&self, shard: &ShardRef, source: &NodeId) -> ClusterResult<SyncOutcome> {
        let documents = self.pull_snapshot(source, shard).await?;
        let applied = match self.catch_up(shard, source).await? {
            SyncOutcome::CaughtUp { applied } => applied,
            SyncOutcome::SnapshotRequired => {
                return Err(ClusterError::RebalanceIncomplete {
                    collection: shard.collection.to_string(),
                    reason: format!("log of {} on {} moved past the snapshot", shard, source),
                });
            }
            _ => 0,
        };
        self.needs_healing.remove(shard);
        Ok(SyncOutcome::Snapshot { documents, applied })
    }

    pub fn needs_healing(&self) -> Vec<ShardRef> {
        self.needs_healing.iter().map(|shard| shard.key().clone()).collect()
    }

    pub fn mark_needs_healing(&self, shard: ShardRef) {
        self.needs_healing.insert(shard);
    }

    pub fn clear_needs_healing(&self, shard: &ShardRef) {
        self.needs_healing.remove(shard);
    }

    // ------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------

    pub fn local_read(&self, shard: &ShardRef, key: &str) -> LocalReadResponse {
        LocalReadResponse {
            document: self.store.read(shard, |store| store.get(shard, key)),
            served_by: self.local_id().clone(),
        }
    }

    /// Keyed read from any owner, local copy first. Non-primary answers are
    /// flagged as possibly stale.
    pub async fn read(&self, database: &str, collection: &str, key: &str) -> ClusterResult<ReadResponse> {
        let route = self.router.route(database, collection, key)?;
        let shard = ShardRef::new(route.collection.clone(), route.shard_id);
        let primary = self.router.write_primary(&route).ok();

        let mut candidates = self.router.read_candidates(&route.owners);
        if let Some(idx) = candidates.iter().position(|node| node == self.local_id()) {
            let local = candidates.remove(idx);
            candidates.insert(0, local);
        }

        let path = format!(
            "{}/{}/{}/{}/{}",
            ENDPOINT_READ, database, collection, route.shard_id, key
        );
        let timeout = self.client.config().request_timeout;

        for candidate in candidates {
            let result = if &candidate == self.local_id() {
                Ok(self.local_read(&shard, key))
            } else {
                self.client
                    .get::<LocalReadResponse>(&candidate, &path, timeout)
                    .await
            };

            match result {
                Ok(response) => {
                    let possibly_stale = primary.as_ref() != Some(&response.served_by);
                    return match response.document.filter(Document::is_live) {
                        Some(doc) => Ok(ReadResponse {
                            key: doc.key,
                            value: doc.value,
                            version: doc.stamp.version,
                            served_by: response.served_by,
                            possibly_stale,
                        }),
                        None => Err(ClusterError::DocumentNotFound(key.to_string())),
                    };
                }
                Err(e) => debug!("Read of {} from {} failed: {}", key, candidate, e),
            }
        }

        Err(ClusterError::ShardUnavailable {
            collection: route.collection.to_string(),
            shard: route.shard_id,
        })
    }

    // ------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------

    /// Discards log prefixes every other holder has confirmed.
    pub fn collect_garbage(&self) -> usize {
        let snapshot = self.router.map().snapshot();
        let mut dropped = 0;

        for entry in snapshot.entries.values() {
            for shard_id in self.router.local_shards(entry) {
                let Some(assignment) = entry.shard(shard_id) else {
                    continue;
                };
                let holders = self.router.replica_targets(assignment);
                dropped += self
                    .log
                    .collect_garbage(&entry.shard_ref(shard_id), &holders);
            }
        }

        if dropped > 0 {
            debug!("Log GC discarded {} operations", dropped);
        }
        dropped
    }

    /// Re-applies a record recovered from the write-ahead log. Records that
    /// belong to other components are ignored.
    pub fn replay(&self, record: &WalRecord) -> ClusterResult<()> {
        match record {
            WalRecord::Operation(op) => {
                self.apply_operation(op, false)?;
            }
            WalRecord::Document { shard, document } => {
                self.apply_document(shard, document.clone(), false)?;
            }
            WalRecord::Evict { shard, keys } => self.evict(shard, keys, false)?,
            WalRecord::Snapshot(snapshot) => {
                self.install_snapshot(snapshot, false)?;
            }
            WalRecord::ShardDropped { shard } => {
                self.drop_shard(shard, false)?;
            }
            WalRecord::OpCounter { op_id } => {
                self.next_op_id.fetch_max(*op_id, Ordering::SeqCst);
            }
            WalRecord::ShardMap(_) | WalRecord::Database { .. } | WalRecord::NodeRemoved { .. } => {}
        }
        Ok(())
    }

    /// Rewrites the write-ahead log as `state` followed by one snapshot per
    /// local shard and the op counter. Operation history below the snapshot
    /// positions is gone afterwards; peers further behind get a snapshot.
    /// Must run before the node takes traffic.
    pub fn compact_wal(&self, state: Vec<WalRecord>) -> ClusterResult<usize> {
        let Some(wal) = &self.wal else {
            return Ok(0);
        };

        let mut records = state;
        for shard in self.store.shards() {
            records.push(WalRecord::Snapshot(self.snapshot(&shard)));
        }
        records.push(WalRecord::OpCounter {
            op_id: self.next_op_id.load(Ordering::SeqCst),
        });

        wal.compact(&records)?;
        Ok(records.len())
    }

    /// Resumes the op-id counter after replay.
    pub fn restore_op_counter(&self) {
        let last = self.log.max_op_id(self.local_id());
        self.next_op_id.fetch_max(last, Ordering::SeqCst);
    }
}

/// Ordered delivery of one (target, shard) stream. Retries until the batch
/// is accepted or the target is removed from the cluster.
struct Shipper {
    local: NodeId,
    target: NodeId,
    shard: ShardRef,
    client: PeerClient,
    membership: Arc<MembershipService>,
    log: Arc<OperationLog>,
    closed: Arc<AtomicBool>,
    rx: mpsc::Receiver<ReplicationOperation>,
}

impl Shipper {
    async fn run(mut self) {
        let config = *self.client.config();
        let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);

        while let Some(first) = self.rx.recv().await {
            let mut ops = vec![first];
            while ops.len() < MAX_BATCH {
                match self.rx.try_recv() {
                    Ok(op) => ops.push(op),
                    Err(_) => break,
                }
            }

            let request = ReplicateRequest {
                from: self.local.clone(),
                ops,
            };

            let mut failures = 0u32;
            loop {
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                if self.membership.is_removed(&self.target) {
                    debug!("Stopping shipper to removed node {} for {}", self.target, self.shard);
                    return;
                }

                match self
                    .client
                    .post::<_, ReplicateResponse>(&self.target, ENDPOINT_REPLICATE, &request)
                    .await
                {
                    Ok(response) => {
                        self.log
                            .record_positions(&self.target, &self.shard, &response.positions);
                        if failures > 0 {
                            info!(
                                "Replication to {} for {} resumed after {} failed attempts",
                                self.target, self.shard, failures
                            );
                        }
                        backoff.reset();
                        break;
                    }
                    Err(e @ ClusterError::NodeUnreachable { .. }) => {
                        if failures == 0 {
                            warn!("Shipping {} to {} failed: {}; retrying", self.shard, self.target, e);
                        }
                        failures += 1;
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} rejected {} ops for {}: {}; left to healing",
                            self.target,
                            request.ops.len(),
                            self.shard,
                            e
                        );
                        break;
                    }
                }
            }
        }
    }
}
