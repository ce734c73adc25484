use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::types::HealReport;
use crate::membership::{service::MembershipService, types::NodeId};
use crate::rebalance::service::Rebalancer;
use crate::replication::engine::{ReplicationEngine, SyncOutcome};
use crate::sharding::types::ShardRef;

/// Every this many cycles each owned shard is checked against its peers even
/// without a detected gap.
const FULL_SWEEP_EVERY: u64 = 5;

/// Background loop that brings lagging copies back in line and keeps the
/// shard map converged.
pub struct HealingService {
    membership: Arc<MembershipService>,
    engine: Arc<ReplicationEngine>,
    rebalancer: Arc<Rebalancer>,
    interval: Duration,
    cycles: AtomicU64,
}

impl HealingService {
    pub fn new(
        membership: Arc<MembershipService>,
        engine: Arc<ReplicationEngine>,
        rebalancer: Arc<Rebalancer>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            membership,
            engine,
            rebalancer,
            interval,
            cycles: AtomicU64::new(0),
        })
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tracing::info!("Starting healing loop every {:?}", self.interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let report = self.run_cycle().await;
                if report.changed_anything() {
                    info!("Healing cycle: {}", report);
                }
            }
        })
    }

    /// One pass: map anti-entropy, shard catch-up, then the rebalancer's
    /// retries, orphan cleanup and log GC.
    pub async fn run_cycle(&self) -> HealReport {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst);
        let mut report = HealReport {
            map_entries_installed: self.rebalancer.pull_shard_maps().await,
            ..HealReport::default()
        };

        let shards = if cycle % FULL_SWEEP_EVERY == 0 {
            self.owned_shards()
        } else {
            self.engine.needs_healing()
        };
        for shard in shards {
            report.merge(&self.heal_shard(&shard).await);
        }

        report.plans_applied = self.rebalancer.reconcile().len();
        self.rebalancer.drive_pending();
        self.rebalancer.resume_resharding();
        report.orphans_dropped = self.rebalancer.cleanup_orphans().await;
        report.log_ops_discarded = self.engine.collect_garbage();

        report
    }

    /// Shards this node owns (pending copies are the rebalancer's business).
    pub fn owned_shards(&self) -> Vec<ShardRef> {
        let local = self.membership.local_id();
        let snapshot = self.engine.router().map().snapshot();
        snapshot
            .entries
            .values()
            .flat_map(|entry| {
                entry
                    .assignment
                    .iter()
                    .filter(|(_, assignment)| assignment.owners.contains(local))
                    .map(|(shard_id, _)| entry.shard_ref(*shard_id))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Queues every shard shared with `peer` for the next cycle. Called when a
    /// peer joins or recovers, since either side may have missed writes.
    pub fn schedule_for_peer(&self, peer: &NodeId) {
        let local = self.membership.local_id();
        let snapshot = self.engine.router().map().snapshot();
        let mut scheduled = 0;

        for entry in snapshot.entries.values() {
            for (shard_id, assignment) in &entry.assignment {
                if assignment.owners.contains(local) && assignment.holds(peer) {
                    self.engine.mark_needs_healing(entry.shard_ref(*shard_id));
                    scheduled += 1;
                }
            }
        }

        if scheduled > 0 {
            debug!("Scheduled {} shards shared with {} for healing", scheduled, peer);
        }
    }

    /// Catches `shard` up from every other alive owner, trusted sources first.
    pub async fn heal_shard(&self, shard: &ShardRef) -> HealReport {
        let mut report = HealReport::default();
        let local = self.membership.local_id();

        let Some(entry) = self.engine.router().map().entry(&shard.collection) else {
            return report;
        };
        let Some(assignment) = entry.shard(shard.shard_id) else {
            self.engine.clear_needs_healing(shard);
            return report;
        };
        if !assignment.owners.contains(local) {
            self.engine.clear_needs_healing(shard);
            return report;
        }

        let mut peers: Vec<&NodeId> = assignment
            .owners
            .iter()
            .filter(|owner| *owner != local && self.membership.is_alive(owner))
            .collect();
        peers.sort_by_key(|peer| self.membership.recently_suspected(peer));

        for peer in peers {
            report.shards_checked += 1;
            match self.engine.sync_shard(shard, peer).await {
                Ok(SyncOutcome::UpToDate) => {}
                Ok(SyncOutcome::CaughtUp { applied }) => {
                    info!("Caught up {} from {}: {} operations", shard, peer, applied);
                    report.ops_applied += applied;
                }
                Ok(SyncOutcome::Snapshot { documents, applied }) => {
                    info!(
                        "Healed {} from {} by snapshot: {} documents, {} operations",
                        shard, peer, documents, applied
                    );
                    report.snapshots += 1;
                    report.ops_applied += applied;
                }
                Ok(SyncOutcome::SnapshotRequired) => {
                    report.failures += 1;
                    self.engine.mark_needs_healing(shard.clone());
                }
                Err(e) => {
                    warn!("Healing {} from {} failed: {}", shard, peer, e);
                    report.failures += 1;
                    self.engine.mark_needs_healing(shard.clone());
                }
            }
        }

        report
    }
}
