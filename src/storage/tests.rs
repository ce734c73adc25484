//! Storage Module Tests
//!
//! ## Test Scopes
//! - **Last-writer-wins**: stamp ordering, tombstones, idempotent re-application.
//! - **ShardStore**: per-shard isolation, live counts, shard drops.
//! - **WAL**: replay of intact frames and recovery from a torn tail.

#[cfg(test)]
mod tests {
    use serde_json::json;
    use std::io::Write;

    use crate::membership::types::NodeId;
    use crate::sharding::types::{CollectionId, ShardRef};
    use crate::storage::store::ShardStore;
    use crate::storage::types::{ApplyOutcome, Document, Stamp, merge_patch};
    use crate::storage::wal::{Wal, WalRecord};

    fn shard(id: u32) -> ShardRef {
        ShardRef::new(CollectionId::new("shop", "users"), id)
    }

    fn doc(key: &str, version: u64, value: serde_json::Value) -> Document {
        Document {
            key: key.to_string(),
            value,
            stamp: Stamp {
                version,
                timestamp: 1_000 + version,
                origin: NodeId::from("n1"),
            },
            deleted: false,
        }
    }

    // ============================================================
    // LAST-WRITER-WINS TESTS
    // ============================================================

    #[test]
    fn test_higher_version_wins_regardless_of_order() {
        let store = ShardStore::in_memory();
        let s = shard(0);

        assert_eq!(store.apply(&s, doc("k", 2, json!({"v": 2}))), ApplyOutcome::Applied);
        assert_eq!(
            store.apply(&s, doc("k", 1, json!({"v": 1}))),
            ApplyOutcome::Superseded
        );
        assert_eq!(store.get_live(&s, "k").unwrap().value, json!({"v": 2}));
    }

    #[test]
    fn test_reapplying_same_document_is_noop() {
        let store = ShardStore::in_memory();
        let s = shard(0);
        let d = doc("k", 3, json!({"status": "inactive"}));

        assert_eq!(store.apply(&s, d.clone()), ApplyOutcome::Applied);
        assert_eq!(store.apply(&s, d.clone()), ApplyOutcome::Superseded);
        assert_eq!(store.get_live(&s, "k").unwrap(), d);
    }

    #[test]
    fn test_equal_version_ties_break_on_timestamp_then_origin() {
        let a = Stamp {
            version: 2,
            timestamp: 10,
            origin: NodeId::from("b"),
        };
        let b = Stamp {
            version: 2,
            timestamp: 11,
            origin: NodeId::from("a"),
        };
        let c = Stamp {
            version: 2,
            timestamp: 11,
            origin: NodeId::from("c"),
        };
        assert!(a < b);
        assert!(b < c);
        assert!(
            Stamp {
                version: 3,
                timestamp: 0,
                origin: NodeId::from("a")
            } > c
        );
    }

    #[test]
    fn test_tombstone_blocks_older_resurrection() {
        let store = ShardStore::in_memory();
        let s = shard(1);

        store.apply(&s, doc("k", 1, json!({"a": 1})));
        let mut tombstone = doc("k", 2, serde_json::Value::Null);
        tombstone.deleted = true;
        store.apply(&s, tombstone);

        assert!(store.get_live(&s, "k").is_none());
        assert_eq!(store.live_count(&s), 0);

        assert_eq!(
            store.apply(&s, doc("k", 1, json!({"a": 1}))),
            ApplyOutcome::Superseded
        );
        assert!(store.get_live(&s, "k").is_none());
    }

    #[test]
    fn test_merge_patch_is_shallow() {
        let base = json!({"name": "ada", "status": "active", "tags": {"x": 1}});
        let patch = json!({"status": "inactive", "tags": {"y": 2}});
        assert_eq!(
            merge_patch(&base, &patch),
            json!({"name": "ada", "status": "inactive", "tags": {"y": 2}})
        );
        assert_eq!(merge_patch(&json!(1), &json!({"a": 1})), json!({"a": 1}));
    }

    // ============================================================
    // SHARD STORE TESTS
    // ============================================================

    #[test]
    fn test_shards_are_isolated() {
        let store = ShardStore::in_memory();
        store.apply(&shard(0), doc("k", 1, json!(1)));
        store.apply(&shard(1), doc("k", 1, json!(2)));

        assert_eq!(store.get_live(&shard(0), "k").unwrap().value, json!(1));
        assert_eq!(store.get_live(&shard(1), "k").unwrap().value, json!(2));
        assert_eq!(
            store.collection_count(&CollectionId::new("shop", "users")),
            2
        );
        assert_eq!(store.collection_count(&CollectionId::new("shop", "orders")), 0);
    }

    #[test]
    fn test_drop_shard_removes_documents() {
        let store = ShardStore::in_memory();
        let s = shard(2);
        for i in 0..5 {
            store.apply(&s, doc(&format!("k{}", i), 1, json!(i)));
        }

        assert_eq!(store.drop_shard(&s), 5);
        assert_eq!(store.live_count(&s), 0);
        assert!(!store.shards().contains(&s));
    }

    #[test]
    fn test_concurrent_writers_on_one_shard() {
        let store = std::sync::Arc::new(ShardStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.apply(&shard(0), doc(&format!("t{}-{}", t, i), 1, json!(i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.live_count(&shard(0)), 400);
    }

    // ============================================================
    // WAL TESTS
    // ============================================================

    #[test]
    fn test_wal_replays_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        {
            let (wal, records) = Wal::open(&path, false).unwrap();
            assert!(records.is_empty());
            wal.append(&WalRecord::Database {
                name: "shop".into(),
            })
            .unwrap();
            wal.append(&WalRecord::Document {
                shard: shard(0),
                document: doc("k", 1, json!({"a": 1})),
            })
            .unwrap();
            wal.append(&WalRecord::NodeRemoved {
                node_id: NodeId::from("n9"),
            })
            .unwrap();
        }

        let (_, records) = Wal::open(&path, false).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[0], WalRecord::Database { name } if name == "shop"));
        match &records[1] {
            WalRecord::Document { shard: s, document } => {
                assert_eq!(s, &shard(0));
                assert_eq!(document.value, json!({"a": 1}));
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert!(matches!(&records[2], WalRecord::NodeRemoved { .. }));
    }

    #[test]
    fn test_wal_truncates_torn_tail_and_keeps_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        {
            let (wal, _) = Wal::open(&path, true).unwrap();
            wal.append(&WalRecord::Database {
                name: "shop".into(),
            })
            .unwrap();
        }

        // Half-written frame: a header promising more bytes than exist.
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&200u32.to_le_bytes()).unwrap();
            file.write_all(&[0, 0, 0, 0, b'{']).unwrap();
        }

        {
            let (wal, records) = Wal::open(&path, false).unwrap();
            assert_eq!(records.len(), 1);
            wal.append(&WalRecord::Database {
                name: "crm".into(),
            })
            .unwrap();
        }

        let (_, records) = Wal::open(&path, false).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[1], WalRecord::Database { name } if name == "crm"));
    }

    #[test]
    fn test_wal_stops_at_corrupt_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        {
            let (wal, _) = Wal::open(&path, false).unwrap();
            for name in ["a", "b"] {
                wal.append(&WalRecord::Database { name: name.into() })
                    .unwrap();
            }
        }

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let (_, records) = Wal::open(&path, false).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_wal_compaction_replaces_history_and_keeps_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        {
            let (wal, _) = Wal::open(&path, false).unwrap();
            for version in 1..=20 {
                wal.append(&WalRecord::Document {
                    shard: shard(0),
                    document: doc("k", version, json!({"v": version})),
                })
                .unwrap();
            }

            wal.compact(&[
                WalRecord::Document {
                    shard: shard(0),
                    document: doc("k", 20, json!({"v": 20})),
                },
                WalRecord::OpCounter { op_id: 20 },
            ])
            .unwrap();
            wal.append(&WalRecord::Database {
                name: "after".into(),
            })
            .unwrap();
        }

        let (_, records) = Wal::open(&path, false).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[1], WalRecord::OpCounter { op_id: 20 }));
        assert!(matches!(&records[2], WalRecord::Database { name } if name == "after"));
        assert!(!path.with_extension("compacting").exists());
    }
}
