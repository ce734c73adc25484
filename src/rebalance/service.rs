use dashmap::DashSet;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::protocol::{
    DatabaseRequest, ENDPOINT_DATABASE, ENDPOINT_MIGRATE, ENDPOINT_NODE_REMOVED,
    ENDPOINT_SHARD_MAP, MigrateRequest, MigrateResponse, NodeRemovedNotice, ShardMapDump,
    ShardMapPush,
};
use crate::error::{ClusterError, ClusterResult};
use crate::membership::{service::MembershipService, types::NodeId};
use crate::replication::client::PeerClient;
use crate::replication::engine::ReplicationEngine;
use crate::sharding::map::{InstallOutcome, ShardMap};
use crate::sharding::placement::{
    apply_plans, build_entry, plan_repairs, promote, shard_loads, strip_node, target_owner_count,
};
use crate::sharding::types::{
    CollectionId, RebalancePlan, ShardId, ShardMapEntry, ShardRef, shard_for_key,
};
use crate::storage::types::Document;
use crate::storage::wal::WalRecord;

/// Documents per migrate request.
const MIGRATE_BATCH: usize = 500;

/// Background work that must not run twice at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Task {
    Transfer(ShardRef),
    Redistribute(CollectionId),
}

/// Owns every change to the shard map: configuration, resharding, repairs
/// after a removal, promotion of pending owners and cleanup of copies this
/// node no longer needs.
///
/// Each node runs its own rebalancer. They agree because they feed the same
/// deterministic placement functions and exchange the resulting entries.
pub struct Rebalancer {
    membership: Arc<MembershipService>,
    map: Arc<ShardMap>,
    engine: Arc<ReplicationEngine>,
    resharding: DashSet<CollectionId>,
    in_flight: DashSet<Task>,
}

impl Rebalancer {
    pub fn new(membership: Arc<MembershipService>, engine: Arc<ReplicationEngine>) -> Arc<Self> {
        Arc::new(Self {
            map: engine.router().map().clone(),
            membership,
            engine,
            resharding: DashSet::new(),
            in_flight: DashSet::new(),
        })
    }

    fn local_id(&self) -> &NodeId {
        self.membership.local_id()
    }

    fn client(&self) -> &PeerClient {
        self.engine.client()
    }

    fn alive_ids(&self) -> Vec<NodeId> {
        self.membership
            .list_alive()
            .into_iter()
            .map(|node| node.id)
            .collect()
    }

    fn active_ids(&self) -> Vec<NodeId> {
        self.membership
            .list_active()
            .into_iter()
            .map(|node| node.id)
            .collect()
    }

    fn peers(&self) -> Vec<NodeId> {
        self.alive_ids()
            .into_iter()
            .filter(|id| id != self.local_id())
            .collect()
    }

    pub fn is_resharding(&self, collection: &CollectionId) -> bool {
        self.resharding.contains(collection)
    }

    /// Fire-and-forget delivery of `body` to every alive peer.
    fn broadcast<T>(&self, path: &'static str, body: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        for peer in self.peers() {
            let client = self.client().clone();
            let body = body.clone();
            tokio::spawn(async move {
                if let Err(e) = client
                    .post_with_retry::<T, serde_json::Value>(&peer, path, body.as_ref(), 3)
                    .await
                {
                    debug!("Broadcast to {} on {} failed: {}", peer, path, e);
                }
            });
        }
    }

    // ------------------------------------------------------------
    // Map installation
    // ------------------------------------------------------------

    /// Installs `entry` if it supersedes the local copy, persisting it first.
    /// Locally produced entries are announced to the alive peers.
    pub fn offer(
        self: &Arc<Self>,
        entry: ShardMapEntry,
        announce: bool,
    ) -> ClusterResult<Option<Arc<ShardMapEntry>>> {
        if let Some(current) = self.map.entry(&entry.collection)
            && !entry.supersedes(&current)
        {
            return Ok(None);
        }

        self.engine.persist(&WalRecord::ShardMap(entry.clone()))?;
        match self.map.install(entry) {
            InstallOutcome::Installed { previous, current } => {
                self.on_installed(previous.as_deref(), &current);
                if announce {
                    self.broadcast(
                        ENDPOINT_SHARD_MAP,
                        ShardMapPush {
                            from: self.local_id().clone(),
                            entries: vec![(*current).clone()],
                        },
                    );
                }
                Ok(Some(current))
            }
            InstallOutcome::Stale => Ok(None),
        }
    }

    fn on_installed(self: &Arc<Self>, previous: Option<&ShardMapEntry>, current: &Arc<ShardMapEntry>) {
        info!(
            "Installed {} generation {} ({} shards, rf {})",
            current.collection, current.generation, current.num_shards, current.replication_factor
        );

        let local = self.local_id().clone();
        match previous {
            Some(previous) if previous.num_shards != current.num_shards => {
                info!(
                    "Layout of {} changed from {} to {} shards; redistributing local documents",
                    current.collection, previous.num_shards, current.num_shards
                );
                self.engine.log().seal_collection(&current.collection);
                self.resharding.insert(current.collection.clone());
                self.spawn_redistribute(current.collection.clone());
            }
            Some(previous) => {
                // Ownership handed over without a transfer: pull what the
                // other owners have.
                for (shard_id, assignment) in &current.assignment {
                    let held_before = previous
                        .shard(*shard_id)
                        .is_some_and(|before| before.holds(&local));
                    if assignment.owners.contains(&local) && !held_before {
                        self.engine
                            .mark_needs_healing(current.shard_ref(*shard_id));
                    }
                }
            }
            None => {}
        }

        if current
            .assignment
            .values()
            .any(|assignment| assignment.pending.contains(&local))
        {
            self.drive_pending();
        }
    }

    pub fn dump(&self) -> ShardMapDump {
        let snapshot = self.map.snapshot();
        ShardMapDump {
            databases: snapshot.databases.clone(),
            entries: snapshot
                .entries
                .values()
                .map(|entry| (**entry).clone())
                .collect(),
            removed_nodes: self
                .membership
                .members()
                .into_iter()
                .filter(|node| node.is_removed())
                .map(|node| node.id)
                .collect(),
        }
    }

    /// Folds a peer's map into the local one. Returns how many entries
    /// superseded local copies.
    pub fn merge_dump(self: &Arc<Self>, dump: ShardMapDump) -> usize {
        for database in &dump.databases {
            if let Err(e) = self.create_database(database) {
                warn!("Failed to record database {}: {}", database, e);
            }
        }
        for node_id in &dump.removed_nodes {
            self.membership.mark_removed(node_id);
        }
        self.merge_entries(dump.entries)
    }

    pub fn merge_entries(self: &Arc<Self>, entries: Vec<ShardMapEntry>) -> usize {
        let mut installed = 0;
        for entry in entries {
            match self.offer(entry, false) {
                Ok(Some(_)) => installed += 1,
                Ok(None) => {}
                Err(e) => warn!("Failed to install shard map entry: {}", e),
            }
        }
        installed
    }

    /// Anti-entropy: pulls every alive peer's map and installs newer entries.
    pub async fn pull_shard_maps(self: &Arc<Self>) -> usize {
        let timeout = self.client().config().request_timeout;
        let mut installed = 0;
        for peer in self.peers() {
            match self
                .client()
                .get::<ShardMapDump>(&peer, ENDPOINT_SHARD_MAP, timeout)
                .await
            {
                Ok(dump) => installed += self.merge_dump(dump),
                Err(e) => debug!("Shard map pull from {} failed: {}", peer, e),
            }
        }
        if installed > 0 {
            info!("Shard map anti-entropy installed {} newer entries", installed);
        }
        installed
    }

    // ------------------------------------------------------------
    // Databases & collection configuration
    // ------------------------------------------------------------

    /// Returns `true` when the database is new to this node.
    pub fn create_database(&self, name: &str) -> ClusterResult<bool> {
        validate_name("database", name)?;
        if self.map.has_database(name) {
            return Ok(false);
        }
        self.engine.persist(&WalRecord::Database {
            name: name.to_string(),
        })?;
        let created = self.map.create_database(name);
        if created {
            info!("Created database {}", name);
        }
        Ok(created)
    }

    /// Creates the database here and on every alive peer.
    pub fn create_database_everywhere(&self, name: &str) -> ClusterResult<bool> {
        let created = self.create_database(name)?;
        self.broadcast(
            ENDPOINT_DATABASE,
            DatabaseRequest {
                name: name.to_string(),
            },
        );
        Ok(created)
    }

    /// Installs or adjusts the topology of a collection. Re-applying the
    /// current `(num_shards, replication_factor)` is a no-op, so the call can
    /// be repeated on every node.
    pub fn configure(
        self: &Arc<Self>,
        collection: &CollectionId,
        num_shards: u32,
        replication_factor: usize,
    ) -> ClusterResult<Arc<ShardMapEntry>> {
        validate_name("collection", &collection.collection)?;
        if num_shards == 0 || replication_factor == 0 {
            return Err(ClusterError::InvalidRequest(
                "numShards and replicationFactor must be at least 1".to_string(),
            ));
        }
        if !self.map.has_database(&collection.database) {
            return Err(ClusterError::DatabaseNotFound(collection.database.clone()));
        }

        let Some(existing) = self.map.entry(collection) else {
            let entry = build_entry(
                collection.clone(),
                &self.alive_ids(),
                num_shards,
                replication_factor,
                1,
            );
            info!(
                "Configuring {} with {} shards, rf {}",
                collection, num_shards, replication_factor
            );
            return self.installed_or_current(collection, entry);
        };

        if existing.num_shards == num_shards && existing.replication_factor == replication_factor {
            return Ok(existing);
        }
        if existing.num_shards != num_shards {
            return self.reshard(collection, num_shards, Some(replication_factor));
        }
        self.change_replication_factor(&existing, replication_factor)
    }

    fn installed_or_current(
        self: &Arc<Self>,
        collection: &CollectionId,
        entry: ShardMapEntry,
    ) -> ClusterResult<Arc<ShardMapEntry>> {
        match self.offer(entry, true)? {
            Some(current) => Ok(current),
            None => self.engine.router().entry(collection),
        }
    }

    fn change_replication_factor(
        self: &Arc<Self>,
        existing: &ShardMapEntry,
        replication_factor: usize,
    ) -> ClusterResult<Arc<ShardMapEntry>> {
        info!(
            "Changing replication factor of {} from {} to {}",
            existing.collection, existing.replication_factor, replication_factor
        );

        let mut next = existing.clone();
        next.replication_factor = replication_factor;
        next.generation += 1;
        for assignment in next.assignment.values_mut() {
            assignment.owners.truncate(replication_factor);
            let room = replication_factor.saturating_sub(assignment.owners.len());
            assignment.pending.truncate(room);
        }

        let snapshot = self.map.snapshot();
        let mut loads = shard_loads(
            snapshot
                .entries
                .values()
                .filter(|entry| entry.collection != existing.collection)
                .map(|entry| entry.as_ref())
                .chain(std::iter::once(&next)),
        );
        let plans = plan_repairs(&next, &self.active_ids(), &self.alive_ids(), &mut loads);
        if !plans.is_empty() {
            next = apply_plans(&next, &plans);
        }

        self.installed_or_current(&existing.collection, next)
    }

    /// Changes the shard count. Every document is re-homed under the new
    /// layout; this is never a mere reassignment.
    pub fn reshard(
        self: &Arc<Self>,
        collection: &CollectionId,
        num_shards: u32,
        replication_factor: Option<usize>,
    ) -> ClusterResult<Arc<ShardMapEntry>> {
        if num_shards == 0 {
            return Err(ClusterError::InvalidRequest(
                "numShards must be at least 1".to_string(),
            ));
        }
        let existing = self.engine.router().entry(collection)?;
        let replication_factor = replication_factor.unwrap_or(existing.replication_factor);

        if existing.num_shards == num_shards {
            if existing.replication_factor == replication_factor {
                return Ok(existing);
            }
            return self.change_replication_factor(&existing, replication_factor);
        }

        let alive = self.alive_ids();
        let active = self.membership.list_active().len();
        if alive.len() * 2 < active {
            return Err(ClusterError::RebalanceIncomplete {
                collection: collection.to_string(),
                reason: format!(
                    "only {} of {} members are alive; refusing to reshard",
                    alive.len(),
                    active
                ),
            });
        }

        info!(
            "Resharding {} from {} to {} shards over {} nodes",
            collection,
            existing.num_shards,
            num_shards,
            alive.len()
        );
        let entry = build_entry(
            collection.clone(),
            &alive,
            num_shards,
            replication_factor,
            existing.generation + 1,
        );
        self.installed_or_current(collection, entry)
    }

    // ------------------------------------------------------------
    // Topology changes
    // ------------------------------------------------------------

    /// Administrative removal by client or replication address (or node id).
    pub async fn remove_node(&self, address: &str) -> ClusterResult<(NodeId, bool)> {
        let node = self
            .membership
            .find_by_address(address)
            .or_else(|| self.membership.get_member(&NodeId::from(address)))
            .ok_or_else(|| ClusterError::UnknownNode(address.to_string()))?;

        let newly_removed = self.membership.remove(&node.id).await?;
        if newly_removed {
            self.broadcast(
                ENDPOINT_NODE_REMOVED,
                NodeRemovedNotice {
                    node_id: node.id.clone(),
                },
            );
        }
        Ok((node.id, newly_removed))
    }

    /// Strips removed nodes from every entry and plans replacement copies for
    /// each shard below its owner target. Returns the plans that were applied.
    ///
    /// Entries that still name a node this node has not discovered yet are
    /// skipped; a half-known topology would plan spurious moves.
    pub fn reconcile(self: &Arc<Self>) -> Vec<RebalancePlan> {
        let snapshot = self.map.snapshot();
        let members = self.active_ids();
        let alive = self.alive_ids();
        let mut loads = shard_loads(snapshot.entries.values().map(|entry| entry.as_ref()));
        let mut applied = Vec::new();

        for entry in snapshot.entries.values() {
            let named: BTreeSet<NodeId> = entry
                .assignment
                .values()
                .flat_map(|assignment| assignment.owners.iter().chain(assignment.pending.iter()))
                .cloned()
                .collect();

            if let Some(unknown) = named.iter().find(|node| {
                !self.membership.is_removed(node) && self.membership.get_member(node).is_none()
            }) {
                debug!(
                    "Skipping rebalance of {}: {} not discovered yet",
                    entry.collection, unknown
                );
                continue;
            }

            let mut next = (**entry).clone();
            let mut changed = false;
            for node in named.iter().filter(|node| self.membership.is_removed(node)) {
                if let Some(stripped) = strip_node(&next, node) {
                    info!("Dropping removed node {} from {}", node, entry.collection);
                    next = stripped;
                    changed = true;
                }
            }
            if changed {
                next.generation = entry.generation + 1;
            }

            let plans = plan_repairs(&next, &members, &alive, &mut loads);
            if !plans.is_empty() {
                next = apply_plans(&next, &plans);
                changed = true;
            }
            if !changed {
                continue;
            }

            for plan in &plans {
                for shard_move in &plan.moves {
                    info!(
                        "Rebalance plan for {}#{}: copy {} -> {}",
                        plan.collection,
                        plan.shard_id,
                        shard_move
                            .from_node
                            .as_ref()
                            .map(|node| node.to_string())
                            .unwrap_or_else(|| "(no source)".to_string()),
                        shard_move.to_node
                    );
                }
            }

            match self.offer(next, true) {
                Ok(_) => applied.extend(plans),
                Err(e) => warn!("Failed to persist rebalanced {}: {}", entry.collection, e),
            }
        }

        applied
    }

    // ------------------------------------------------------------
    // Pending owners
    // ------------------------------------------------------------

    /// Starts a transfer for every shard where this node is a pending owner.
    pub fn drive_pending(self: &Arc<Self>) {
        let local = self.local_id().clone();
        let snapshot = self.map.snapshot();

        for entry in snapshot.entries.values() {
            for (shard_id, assignment) in &entry.assignment {
                if !assignment.pending.contains(&local) {
                    continue;
                }
                let shard = entry.shard_ref(*shard_id);
                let task = Task::Transfer(shard.clone());
                if !self.in_flight.insert(task.clone()) {
                    continue;
                }

                let rebalancer = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = rebalancer.transfer(&shard).await {
                        warn!("Transfer of {} incomplete: {}", shard, e);
                    }
                    rebalancer.in_flight.remove(&task);
                });
            }
        }
    }

    /// Snapshot plus catch-up from an owner, then promotion to owner.
    async fn transfer(self: &Arc<Self>, shard: &ShardRef) -> ClusterResult<()> {
        let entry = self.engine.router().entry(&shard.collection)?;
        let Some(assignment) = entry.shard(shard.shard_id) else {
            return Ok(());
        };
        if !assignment.pending.contains(self.local_id()) {
            return Ok(());
        }

        let source = self
            .pick_source(&assignment.owners)
            .ok_or_else(|| ClusterError::RebalanceIncomplete {
                collection: shard.collection.to_string(),
                reason: format!("no alive owner of {} to copy from", shard),
            })?;

        info!("Copying {} from {}", shard, source);
        let outcome = self.engine.transfer_shard(shard, &source).await?;
        debug!("Transfer of {} finished: {:?}", shard, outcome);

        self.promote_local(shard)
    }

    fn promote_local(self: &Arc<Self>, shard: &ShardRef) -> ClusterResult<()> {
        let current = self.engine.router().entry(&shard.collection)?;
        let Some(next) = promote(&current, shard.shard_id, self.local_id()) else {
            return Ok(());
        };
        match self.offer(next, true)? {
            Some(_) => info!("Promoted to owner of {}", shard),
            None => debug!("Promotion for {} lost to a newer entry; will retry", shard),
        }
        Ok(())
    }

    /// Alive owner to copy from, preferring ones that have not failed lately.
    pub fn pick_source(&self, owners: &[NodeId]) -> Option<NodeId> {
        let candidates: Vec<&NodeId> = owners
            .iter()
            .filter(|owner| *owner != self.local_id() && self.membership.is_alive(owner))
            .collect();
        candidates
            .iter()
            .find(|owner| !self.membership.recently_suspected(owner))
            .or_else(|| candidates.first())
            .map(|owner| (*owner).clone())
    }

    // ------------------------------------------------------------
    // Redistribution after a reshard
    // ------------------------------------------------------------

    fn spawn_redistribute(self: &Arc<Self>, collection: CollectionId) {
        let task = Task::Redistribute(collection.clone());
        if !self.in_flight.insert(task.clone()) {
            return;
        }

        let rebalancer = self.clone();
        tokio::spawn(async move {
            match rebalancer.redistribute(&collection).await {
                Ok(moved) => {
                    rebalancer.resharding.remove(&collection);
                    info!(
                        "Redistribution of {} complete: {} local documents re-homed",
                        collection, moved
                    );
                }
                Err(e) => warn!("{}; retrying on the next healing cycle", e),
            }
            rebalancer.in_flight.remove(&task);
        });
    }

    /// Retries redistributions that did not finish.
    pub fn resume_resharding(self: &Arc<Self>) {
        let pending: Vec<CollectionId> = self.resharding.iter().map(|c| c.key().clone()).collect();
        for collection in pending {
            self.spawn_redistribute(collection);
        }
    }

    /// After a restart, finds collections whose local documents do not match
    /// the current layout (an interrupted reshard) and resumes moving them.
    pub fn resume_interrupted_layout_moves(self: &Arc<Self>) {
        let snapshot = self.map.snapshot();
        let store = self.engine.store();

        for entry in snapshot.entries.values() {
            let misplaced = store.shards_of(&entry.collection).iter().any(|shard| {
                store.read(shard, |local| {
                    local
                        .scan(shard)
                        .iter()
                        .any(|doc| shard_for_key(&doc.key, entry.num_shards) != shard.shard_id)
                })
            });
            if misplaced {
                info!("Resuming interrupted redistribution of {}", entry.collection);
                self.resharding.insert(entry.collection.clone());
            }
        }
        self.resume_resharding();
    }

    async fn redistribute(&self, collection: &CollectionId) -> ClusterResult<usize> {
        let entry = self.engine.router().entry(collection)?;
        let store = self.engine.store();
        let mut moved = 0;
        let mut failures = Vec::new();

        for shard in store.shards_of(collection) {
            let documents = store.read(&shard, |local| local.scan(&shard));
            let mut outgoing: BTreeMap<ShardId, Vec<Document>> = BTreeMap::new();
            for doc in documents {
                let target = shard_for_key(&doc.key, entry.num_shards);
                if target != shard.shard_id {
                    outgoing.entry(target).or_default().push(doc);
                }
            }

            for (target, documents) in outgoing {
                let target_shard = entry.shard_ref(target);
                match self.deliver(&target_shard, &documents).await {
                    Ok(adopted) => {
                        debug!(
                            "Moved {} documents {} -> {} ({} adopted)",
                            documents.len(),
                            shard,
                            target_shard,
                            adopted
                        );
                        moved += self.engine.evict_moved(&shard, &documents)?;
                    }
                    Err(e) => failures.push(format!("{} -> {}: {}", shard, target_shard, e)),
                }
            }
        }

        if !failures.is_empty() {
            return Err(ClusterError::RebalanceIncomplete {
                collection: collection.to_string(),
                reason: failures.join("; "),
            });
        }
        Ok(moved)
    }

    /// Hands documents to the acting primary of `shard`, trying owners in
    /// order. A local owner adopts them directly.
    async fn deliver(&self, shard: &ShardRef, documents: &[Document]) -> ClusterResult<usize> {
        let entry = self.engine.router().entry(&shard.collection)?;
        let owners = entry
            .shard(shard.shard_id)
            .map(|assignment| assignment.owners.clone())
            .unwrap_or_default();
        let timeout = self.client().config().request_timeout * 5;

        'owners: for owner in owners.iter().filter(|owner| self.membership.is_alive(owner)) {
            if owner == self.local_id() {
                return self.engine.adopt(shard, documents.to_vec());
            }

            let mut adopted = 0;
            for batch in documents.chunks(MIGRATE_BATCH) {
                let request = MigrateRequest {
                    shard: shard.clone(),
                    num_shards: entry.num_shards,
                    documents: batch.to_vec(),
                };
                match self
                    .client()
                    .post_with_timeout::<_, MigrateResponse>(owner, ENDPOINT_MIGRATE, &request, timeout)
                    .await
                {
                    Ok(response) => adopted += response.adopted,
                    Err(e @ ClusterError::NodeUnreachable { .. }) => {
                        debug!("Migration of {} to {} failed: {}", shard, owner, e);
                        continue 'owners;
                    }
                    Err(e) => return Err(e),
                }
            }
            return Ok(adopted);
        }

        Err(ClusterError::ShardUnavailable {
            collection: shard.collection.to_string(),
            shard: shard.shard_id,
        })
    }

    /// Receiving side of a migration.
    pub fn accept_migration(&self, request: MigrateRequest) -> ClusterResult<usize> {
        let entry = self.engine.router().entry(&request.shard.collection)?;
        if entry.num_shards != request.num_shards {
            return Err(ClusterError::RebalanceIncomplete {
                collection: request.shard.collection.to_string(),
                reason: format!(
                    "sender assumes {} shards, local layout has {}",
                    request.num_shards, entry.num_shards
                ),
            });
        }
        self.engine.adopt(&request.shard, request.documents)
    }

    // ------------------------------------------------------------
    // Orphan cleanup
    // ------------------------------------------------------------

    /// Drops local copies of shards this node neither owns nor is pending
    /// for, once the shard is fully replicated elsewhere. Live documents are
    /// handed to an owner first; the copy is kept when that fails.
    pub async fn cleanup_orphans(self: &Arc<Self>) -> usize {
        let snapshot = self.map.snapshot();
        let local = self.local_id().clone();
        let members = self.membership.list_active().len();
        let store = self.engine.store();
        let mut dropped = 0;

        for shard in store.shards() {
            let Some(entry) = snapshot.entry(&shard.collection) else {
                continue;
            };
            if self.resharding.contains(&shard.collection) {
                continue;
            }

            let documents = store.read(&shard, |local_store| local_store.scan(&shard));
            match entry.shard(shard.shard_id) {
                Some(assignment) if assignment.holds(&local) => continue,
                Some(assignment) => {
                    let target = target_owner_count(entry.replication_factor, members);
                    if !assignment.pending.is_empty() || assignment.owners.len() < target {
                        continue;
                    }
                    if !documents.is_empty()
                        && let Err(e) = self.deliver(&shard, &documents).await
                    {
                        debug!("Keeping orphaned {}: handoff failed: {}", shard, e);
                        continue;
                    }
                }
                None if !documents.is_empty() => {
                    // Left over from an earlier layout.
                    self.resharding.insert(shard.collection.clone());
                    continue;
                }
                None => {}
            }

            match self.engine.drop_shard(&shard, true) {
                Ok(count) => {
                    info!("Dropped orphaned copy of {} ({} documents)", shard, count);
                    dropped += 1;
                }
                Err(e) => warn!("Failed to drop {}: {}", shard, e),
            }
        }

        dropped
    }
}

fn validate_name(kind: &str, name: &str) -> ClusterResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('#') {
        return Err(ClusterError::InvalidRequest(format!(
            "invalid {} name {:?}",
            kind, name
        )));
    }
    Ok(())
}
