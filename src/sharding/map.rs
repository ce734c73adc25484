//! Versioned shard map.
//!
//! The whole map is an immutable snapshot behind an `Arc`; writers build the
//! next snapshot and swap it in under a short write lock, so readers never see
//! a half-applied assignment.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::types::{CollectionId, ShardMapEntry};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardMapSnapshot {
    /// Bumped on every swap; local only.
    pub version: u64,
    pub databases: BTreeSet<String>,
    pub entries: BTreeMap<CollectionId, Arc<ShardMapEntry>>,
}

impl ShardMapSnapshot {
    pub fn entry(&self, collection: &CollectionId) -> Option<&Arc<ShardMapEntry>> {
        self.entries.get(collection)
    }
}

/// Result of offering an entry to the map.
#[derive(Debug, Clone)]
pub enum InstallOutcome {
    Installed {
        previous: Option<Arc<ShardMapEntry>>,
        current: Arc<ShardMapEntry>,
    },
    Stale,
}

#[derive(Default)]
pub struct ShardMap {
    current: RwLock<Arc<ShardMapSnapshot>>,
}

impl ShardMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<ShardMapSnapshot> {
        self.current.read().clone()
    }

    pub fn entry(&self, collection: &CollectionId) -> Option<Arc<ShardMapEntry>> {
        self.current.read().entries.get(collection).cloned()
    }

    pub fn has_database(&self, database: &str) -> bool {
        self.current.read().databases.contains(database)
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Returns `true` when the database was not known before.
    pub fn create_database(&self, database: &str) -> bool {
        let mut guard = self.current.write();
        if guard.databases.contains(database) {
            return false;
        }
        let mut next = (**guard).clone();
        next.databases.insert(database.to_string());
        next.version += 1;
        *guard = Arc::new(next);
        true
    }

    /// Installs `entry` if it supersedes the current one for its collection.
    pub fn install(&self, entry: ShardMapEntry) -> InstallOutcome {
        let mut guard = self.current.write();
        let previous = guard.entries.get(&entry.collection).cloned();

        if let Some(existing) = &previous
            && !entry.supersedes(existing)
        {
            return InstallOutcome::Stale;
        }

        let current = Arc::new(entry);
        let mut next = (**guard).clone();
        next.databases.insert(current.collection.database.clone());
        next.entries
            .insert(current.collection.clone(), current.clone());
        next.version += 1;
        *guard = Arc::new(next);

        InstallOutcome::Installed { previous, current }
    }
}
