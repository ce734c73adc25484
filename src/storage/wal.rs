//! Write-ahead log.
//!
//! Frame layout: `len: u32 LE | crc32(payload): u32 LE | payload (JSON)`.
//! Replay stops at the first short or corrupt frame and the file is truncated
//! back to the last good frame, so a crash mid-append loses only that append.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::types::Document;
use crate::error::{ClusterError, ClusterResult};
use crate::membership::types::NodeId;
use crate::replication::types::{ReplicationOperation, ShardSnapshot};
use crate::sharding::types::{ShardMapEntry, ShardRef};

const FRAME_HEADER: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalRecord {
    /// A replicated or locally committed operation that changed a document.
    Operation(ReplicationOperation),
    /// A document applied outside any stream (migration, re-routed writes).
    Document { shard: ShardRef, document: Document },
    /// Documents physically removed from a shard after moving elsewhere.
    Evict { shard: ShardRef, keys: Vec<String> },
    Snapshot(ShardSnapshot),
    ShardMap(ShardMapEntry),
    Database { name: String },
    NodeRemoved { node_id: NodeId },
    ShardDropped { shard: ShardRef },
    /// Highest op id this node had issued when the log was compacted.
    OpCounter { op_id: u64 },
}

pub struct Wal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    sync: bool,
}

impl Wal {
    /// Opens (or creates) the log and returns every intact record in it.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> io::Result<(Self, Vec<WalRecord>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (records, valid_len) = if path.exists() {
            Self::read_frames(&path)?
        } else {
            (Vec::new(), 0)
        };

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() > valid_len {
            warn!(
                "WAL {:?} has a torn tail; truncating to {} bytes",
                path, valid_len
            );
            file.set_len(valid_len)?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&path)?;
        info!("WAL opened at {:?} ({} records)", path, records.len());

        Ok((
            Self {
                path,
                writer: Mutex::new(BufWriter::new(file)),
                sync,
            },
            records,
        ))
    }

    pub fn append(&self, record: &WalRecord) -> ClusterResult<()> {
        let frame = encode_frame(record)?;
        let mut writer = self.writer.lock();
        writer.write_all(&frame)?;
        writer.flush()?;
        if self.sync {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Replaces the whole log with `records`. The new log is written beside
    /// the old one and renamed over it, so a crash leaves one of the two
    /// intact.
    pub fn compact(&self, records: &[WalRecord]) -> ClusterResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let staging = self.path.with_extension("compacting");
        {
            let mut out = BufWriter::new(File::create(&staging)?);
            for record in records {
                out.write_all(&encode_frame(record)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;

        *writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        info!("Compacted WAL {:?} to {} records", self.path, records.len());
        Ok(())
    }

    fn read_frames(path: &Path) -> io::Result<(Vec<WalRecord>, u64)> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        let mut records = Vec::new();
        let mut offset = 0usize;

        while offset + FRAME_HEADER <= data.len() {
            let len = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            let stored_crc = u32::from_le_bytes([
                data[offset + 4],
                data[offset + 5],
                data[offset + 6],
                data[offset + 7],
            ]);

            let start = offset + FRAME_HEADER;
            let end = start + len;
            if end > data.len() {
                warn!("WAL frame at {} truncated", offset);
                break;
            }

            let payload = &data[start..end];
            if crc32fast::hash(payload) != stored_crc {
                warn!("WAL frame at {} failed CRC check", offset);
                break;
            }

            match serde_json::from_slice::<WalRecord>(payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("WAL frame at {} undecodable: {}", offset, e);
                    break;
                }
            }
            offset = end;
        }

        Ok((records, offset as u64))
    }
}

fn encode_frame(record: &WalRecord) -> ClusterResult<Vec<u8>> {
    let payload =
        serde_json::to_vec(record).map_err(|e| ClusterError::Storage(e.to_string()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}
