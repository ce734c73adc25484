use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::types::{ApplyOutcome, Document, wins_over};
use crate::sharding::types::{CollectionId, ShardRef};

/// Single-node key/value primitives the cluster layer builds on.
///
/// Implementations need no locking discipline of their own: every call is made
/// from inside a `ShardStore` read or write section for that shard.
pub trait LocalStore: Send + Sync {
    fn get(&self, shard: &ShardRef, key: &str) -> Option<Document>;
    fn put(&self, shard: &ShardRef, doc: Document);
    fn delete(&self, shard: &ShardRef, key: &str) -> Option<Document>;
    /// Every document of the shard, tombstones included, ordered by key.
    fn scan(&self, shard: &ShardRef) -> Vec<Document>;
    fn shards(&self) -> Vec<ShardRef>;
    /// Removes the whole shard and returns how many documents it held.
    fn drop_shard(&self, shard: &ShardRef) -> usize;
}

#[derive(Default)]
pub struct MemoryStore {
    shards: DashMap<ShardRef, BTreeMap<String, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, shard: &ShardRef, key: &str) -> Option<Document> {
        self.shards
            .get(shard)
            .and_then(|docs| docs.get(key).cloned())
    }

    fn put(&self, shard: &ShardRef, doc: Document) {
        self.shards
            .entry(shard.clone())
            .or_default()
            .insert(doc.key.clone(), doc);
    }

    fn delete(&self, shard: &ShardRef, key: &str) -> Option<Document> {
        self.shards
            .get_mut(shard)
            .and_then(|mut docs| docs.remove(key))
    }

    fn scan(&self, shard: &ShardRef) -> Vec<Document> {
        self.shards
            .get(shard)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    fn shards(&self) -> Vec<ShardRef> {
        let mut shards: Vec<ShardRef> = self.shards.iter().map(|entry| entry.key().clone()).collect();
        shards.sort();
        shards
    }

    fn drop_shard(&self, shard: &ShardRef) -> usize {
        self.shards
            .remove(shard)
            .map(|(_, docs)| docs.len())
            .unwrap_or(0)
    }
}

/// Per-shard locking over a `LocalStore`.
///
/// Mutations run inside `write`, reads inside `read`. The lock is a blocking
/// `parking_lot` lock and must never be held across an `.await`.
pub struct ShardStore {
    store: Arc<dyn LocalStore>,
    locks: DashMap<ShardRef, Arc<RwLock<()>>>,
}

impl ShardStore {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    fn lock_for(&self, shard: &ShardRef) -> Arc<RwLock<()>> {
        self.locks
            .entry(shard.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub fn write<R>(&self, shard: &ShardRef, f: impl FnOnce(&dyn LocalStore) -> R) -> R {
        let lock = self.lock_for(shard);
        let _guard = lock.write();
        f(self.store.as_ref())
    }

    pub fn read<R>(&self, shard: &ShardRef, f: impl FnOnce(&dyn LocalStore) -> R) -> R {
        let lock = self.lock_for(shard);
        let _guard = lock.read();
        f(self.store.as_ref())
    }

    /// Offers `doc` under last-writer-wins. Callers already inside a write
    /// section use `apply_in` instead.
    pub fn apply(&self, shard: &ShardRef, doc: Document) -> ApplyOutcome {
        self.write(shard, |store| apply_in(store, shard, doc))
    }

    pub fn get_live(&self, shard: &ShardRef, key: &str) -> Option<Document> {
        self.read(shard, |store| store.get(shard, key))
            .filter(Document::is_live)
    }

    pub fn live_documents(&self, shard: &ShardRef) -> Vec<Document> {
        self.read(shard, |store| {
            store
                .scan(shard)
                .into_iter()
                .filter(Document::is_live)
                .collect()
        })
    }

    pub fn live_count(&self, shard: &ShardRef) -> usize {
        self.read(shard, |store| {
            store.scan(shard).iter().filter(|doc| doc.is_live()).count()
        })
    }

    pub fn shards(&self) -> Vec<ShardRef> {
        self.store.shards()
    }

    pub fn shards_of(&self, collection: &CollectionId) -> Vec<ShardRef> {
        self.store
            .shards()
            .into_iter()
            .filter(|shard| &shard.collection == collection)
            .collect()
    }

    /// Live documents of a collection across every local shard.
    pub fn collection_count(&self, collection: &CollectionId) -> usize {
        self.shards_of(collection)
            .iter()
            .map(|shard| self.live_count(shard))
            .sum()
    }

    pub fn drop_shard(&self, shard: &ShardRef) -> usize {
        self.write(shard, |store| store.drop_shard(shard))
    }
}

/// LWW apply for callers already holding the shard's write section.
pub fn apply_in(store: &dyn LocalStore, shard: &ShardRef, doc: Document) -> ApplyOutcome {
    let existing = store.get(shard, &doc.key);
    if wins_over(&doc, existing.as_ref()) {
        store.put(shard, doc);
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::Superseded
    }
}
