use serde::Serialize;
use std::fmt;

/// Tally of one healing cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealReport {
    pub shards_checked: usize,
    pub ops_applied: usize,
    pub snapshots: usize,
    pub failures: usize,
    pub map_entries_installed: usize,
    pub plans_applied: usize,
    pub orphans_dropped: usize,
    pub log_ops_discarded: usize,
}

impl HealReport {
    pub fn merge(&mut self, other: &HealReport) {
        self.shards_checked += other.shards_checked;
        self.ops_applied += other.ops_applied;
        self.snapshots += other.snapshots;
        self.failures += other.failures;
        self.map_entries_installed += other.map_entries_installed;
        self.plans_applied += other.plans_applied;
        self.orphans_dropped += other.orphans_dropped;
        self.log_ops_discarded += other.log_ops_discarded;
    }

    /// Whether the cycle did more than confirm everything was in order.
    pub fn changed_anything(&self) -> bool {
        self.ops_applied > 0
            || self.snapshots > 0
            || self.failures > 0
            || self.map_entries_installed > 0
            || self.plans_applied > 0
            || self.orphans_dropped > 0
    }
}

impl fmt::Display for HealReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} shard checks, {} ops applied, {} snapshots, {} failures, {} map entries, {} plans, {} orphans dropped",
            self.shards_checked,
            self.ops_applied,
            self.snapshots,
            self.failures,
            self.map_entries_installed,
            self.plans_applied,
            self.orphans_dropped
        )
    }
}
