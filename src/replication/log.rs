//! Per-stream operation log.
//!
//! For every (origin, shard) stream the log keeps the contiguous run of
//! operations `(truncated_through, watermark]`. Operations that arrive out of
//! order are applied to the documents by the engine but never enter the log,
//! so every retained run can be replayed to a peer as is.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};

use super::types::{ReplicationOperation, Sequencing, StreamId, StreamPosition};
use crate::membership::types::NodeId;
use crate::sharding::types::{CollectionId, ShardRef};

#[derive(Debug, Default)]
struct StreamState {
    watermark: u64,
    truncated_through: u64,
    ops: VecDeque<ReplicationOperation>,
}

impl StreamState {
    fn truncate_all(&mut self) {
        self.ops.clear();
        self.truncated_through = self.watermark;
    }
}

/// Answer to a catch-up request.
#[derive(Debug, Clone, PartialEq)]
pub enum CatchUp {
    Operations(Vec<ReplicationOperation>),
    /// The log no longer covers the requested range, or the range is too
    /// large; the requester must fall back to a snapshot.
    SnapshotRequired,
}

#[derive(Default)]
pub struct OperationLog {
    streams: Mutex<BTreeMap<StreamId, StreamState>>,
    /// Highest position each peer confirmed per stream.
    acks: DashMap<(NodeId, StreamId), u64>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watermark(&self, stream: &StreamId) -> u64 {
        self.streams
            .lock()
            .get(stream)
            .map(|state| state.watermark)
            .unwrap_or(0)
    }

    /// Stream positions for every origin known on `shard`.
    pub fn positions(&self, shard: &ShardRef) -> Vec<StreamPosition> {
        self.streams
            .lock()
            .iter()
            .filter(|(stream, _)| &stream.shard == shard)
            .map(|(stream, state)| StreamPosition {
                origin: stream.origin.clone(),
                op_id: state.watermark,
            })
            .collect()
    }

    pub fn classify(&self, op: &ReplicationOperation) -> Sequencing {
        let watermark = self.watermark(&op.stream());
        if op.op_id <= watermark {
            Sequencing::Duplicate
        } else if op.prev_op_id > watermark {
            Sequencing::Gap
        } else {
            Sequencing::InOrder
        }
    }

    /// Classifies `op` against its stream and appends it when it extends the
    /// contiguous run.
    pub fn record(&self, op: &ReplicationOperation) -> Sequencing {
        let mut streams = self.streams.lock();
        let state = streams.entry(op.stream()).or_default();

        if op.op_id <= state.watermark {
            return Sequencing::Duplicate;
        }
        if op.prev_op_id > state.watermark {
            return Sequencing::Gap;
        }

        // prev_op_id below the watermark means the origin restarted its chain
        // from an older point; accepting it keeps the stream moving.
        state.ops.push_back(op.clone());
        state.watermark = op.op_id;
        Sequencing::InOrder
    }

    /// Raises stream positions after a snapshot install. The log cannot serve
    /// anything below a position it jumped to.
    pub fn fast_forward(&self, shard: &ShardRef, positions: &[StreamPosition]) {
        let mut streams = self.streams.lock();
        for position in positions {
            let state = streams
                .entry(StreamId {
                    origin: position.origin.clone(),
                    shard: shard.clone(),
                })
                .or_default();
            if position.op_id > state.watermark {
                state.watermark = position.op_id;
                state.truncate_all();
            }
        }
    }

    /// Operations on `shard` that a peer at `from` is missing, in stream order.
    pub fn ops_after(&self, shard: &ShardRef, from: &[StreamPosition], max_ops: usize) -> CatchUp {
        let streams = self.streams.lock();
        let mut missing = Vec::new();

        for (stream, state) in streams.iter().filter(|(stream, _)| &stream.shard == shard) {
            let position = from
                .iter()
                .find(|position| position.origin == stream.origin)
                .map(|position| position.op_id)
                .unwrap_or(0);

            if position >= state.watermark {
                continue;
            }
            if position < state.truncated_through {
                return CatchUp::SnapshotRequired;
            }

            missing.extend(state.ops.iter().filter(|op| op.op_id > position).cloned());
            if missing.len() > max_ops {
                return CatchUp::SnapshotRequired;
            }
        }

        CatchUp::Operations(missing)
    }

    pub fn record_ack(&self, peer: &NodeId, stream: &StreamId, op_id: u64) {
        let mut entry = self
            .acks
            .entry((peer.clone(), stream.clone()))
            .or_insert(0);
        if op_id > *entry {
            *entry = op_id;
        }
    }

    pub fn record_positions(&self, peer: &NodeId, shard: &ShardRef, positions: &[StreamPosition]) {
        for position in positions {
            let stream = StreamId {
                origin: position.origin.clone(),
                shard: shard.clone(),
            };
            self.record_ack(peer, &stream, position.op_id);
        }
    }

    pub fn acked(&self, peer: &NodeId, stream: &StreamId) -> u64 {
        self.acks
            .get(&(peer.clone(), stream.clone()))
            .map(|ack| *ack)
            .unwrap_or(0)
    }

    /// Discards every operation all `holders` have confirmed. Returns the
    /// number of operations dropped.
    pub fn collect_garbage(&self, shard: &ShardRef, holders: &[NodeId]) -> usize {
        let mut streams = self.streams.lock();
        let mut dropped = 0;

        for (stream, state) in streams.iter_mut().filter(|(stream, _)| &stream.shard == shard) {
            let confirmed = holders
                .iter()
                .map(|peer| self.acked(peer, stream))
                .min()
                .unwrap_or(state.watermark)
                .min(state.watermark);

            while let Some(front) = state.ops.front() {
                if front.op_id > confirmed {
                    break;
                }
                state.truncated_through = front.op_id;
                state.ops.pop_front();
                dropped += 1;
            }
        }

        dropped
    }

    /// Forgets a shard this node no longer holds. The local origin keeps its
    /// position so its own stream stays continuous if the shard comes back.
    pub fn forget_shard(&self, shard: &ShardRef, local: &NodeId) {
        let mut streams = self.streams.lock();
        streams.retain(|stream, _| &stream.shard != shard || &stream.origin == local);
        if let Some(state) = streams.get_mut(&StreamId {
            origin: local.clone(),
            shard: shard.clone(),
        }) {
            state.truncate_all();
        }
        self.acks.retain(|(_, stream), _| &stream.shard != shard);
    }

    /// After a reshard the old streams describe a layout that no longer
    /// exists; nothing below the current positions may be replayed.
    pub fn seal_collection(&self, collection: &CollectionId) {
        let mut streams = self.streams.lock();
        for (_, state) in streams
            .iter_mut()
            .filter(|(stream, _)| &stream.shard.collection == collection)
        {
            state.truncate_all();
        }
    }

    /// Highest op id recorded for `origin` on any stream.
    pub fn max_op_id(&self, origin: &NodeId) -> u64 {
        self.streams
            .lock()
            .iter()
            .filter(|(stream, _)| &stream.origin == origin)
            .map(|(_, state)| state.watermark)
            .max()
            .unwrap_or(0)
    }

    pub fn retained(&self) -> usize {
        self.streams.lock().values().map(|state| state.ops.len()).sum()
    }
}
