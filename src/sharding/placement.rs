//! Deterministic placement.
//!
//! Every function here is pure: nodes that feed in the same topology compute
//! the same assignment, which is how the cluster agrees on placement without a
//! coordinator.

use std::collections::{BTreeMap, BTreeSet};

use super::types::{
    CollectionId, RebalancePlan, ShardAssignment, ShardId, ShardMapEntry, ShardMove,
};
use crate::membership::types::NodeId;

/// Round-robin over the sorted node list: shard `i` gets nodes
/// `i, i+1, .., i+rf-1` (mod n).
pub fn initial_assignment(
    nodes: &[NodeId],
    num_shards: u32,
    replication_factor: usize,
) -> BTreeMap<ShardId, ShardAssignment> {
    let mut sorted: Vec<NodeId> = nodes.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut assignment = BTreeMap::new();
    if sorted.is_empty() {
        return assignment;
    }

    let copies = replication_factor.min(sorted.len());
    for shard_id in 0..num_shards {
        let primary_idx = shard_id as usize % sorted.len();
        let owners = (0..copies)
            .map(|offset| sorted[(primary_idx + offset) % sorted.len()].clone())
            .collect();
        assignment.insert(
            shard_id,
            ShardAssignment {
                owners,
                pending: Vec::new(),
            },
        );
    }

    assignment
}

pub fn build_entry(
    collection: CollectionId,
    nodes: &[NodeId],
    num_shards: u32,
    replication_factor: usize,
    generation: u64,
) -> ShardMapEntry {
    ShardMapEntry {
        assignment: initial_assignment(nodes, num_shards, replication_factor),
        collection,
        num_shards,
        replication_factor,
        generation,
    }
}

/// Owner count every shard should reach.
pub fn target_owner_count(replication_factor: usize, member_count: usize) -> usize {
    replication_factor.min(member_count)
}

/// Number of shards (owned or pending) each node currently holds across the
/// given entries.
pub fn shard_loads<'a>(
    entries: impl IntoIterator<Item = &'a ShardMapEntry>,
) -> BTreeMap<NodeId, usize> {
    let mut loads = BTreeMap::new();
    for entry in entries {
        for assignment in entry.assignment.values() {
            for node in assignment.owners.iter().chain(assignment.pending.iter()) {
                *loads.entry(node.clone()).or_insert(0) += 1;
            }
        }
    }
    loads
}

/// Drops `removed` from every owner and pending list. Returns `None` when the
/// node held nothing in this entry.
pub fn strip_node(entry: &ShardMapEntry, removed: &NodeId) -> Option<ShardMapEntry> {
    let touched = entry
        .assignment
        .values()
        .any(|assignment| assignment.holds(removed));
    if !touched {
        return None;
    }

    let mut next = entry.clone();
    for assignment in next.assignment.values_mut() {
        assignment.owners.retain(|owner| owner != removed);
        assignment.pending.retain(|pending| pending != removed);
    }
    next.generation += 1;
    Some(next)
}

/// Computes replacement owners for every shard below its owner target.
///
/// * `members` - non-removed nodes; sets the target `min(rf, |members|)`.
/// * `alive` - nodes eligible to receive a new copy.
/// * `loads` - current shard counts, updated in place as moves are planned.
///
/// Candidates are ordered by (load, id) so the least-loaded node wins and ties
/// resolve identically everywhere.
pub fn plan_repairs(
    entry: &ShardMapEntry,
    members: &[NodeId],
    alive: &[NodeId],
    loads: &mut BTreeMap<NodeId, usize>,
) -> Vec<RebalancePlan> {
    let member_set: BTreeSet<&NodeId> = members.iter().collect();
    let target = target_owner_count(entry.replication_factor, member_set.len());
    let mut plans = Vec::new();

    for (shard_id, assignment) in &entry.assignment {
        let holders: Vec<&NodeId> = assignment
            .owners
            .iter()
            .chain(assignment.pending.iter())
            .filter(|node| member_set.contains(node))
            .collect();

        if holders.len() >= target {
            continue;
        }

        let source = assignment
            .owners
            .iter()
            .find(|owner| member_set.contains(owner) && alive.contains(owner))
            .or_else(|| {
                assignment
                    .owners
                    .iter()
                    .find(|owner| member_set.contains(owner))
            })
            .cloned();

        let mut candidates: Vec<&NodeId> = alive
            .iter()
            .filter(|node| member_set.contains(node) && !holders.contains(node))
            .collect();
        candidates.sort_by(|a, b| {
            let load_a = loads.get(*a).copied().unwrap_or(0);
            let load_b = loads.get(*b).copied().unwrap_or(0);
            load_a.cmp(&load_b).then_with(|| a.cmp(b))
        });

        let needed = target - holders.len();
        let mut moves = Vec::new();
        for candidate in candidates.into_iter().take(needed) {
            *loads.entry(candidate.clone()).or_insert(0) += 1;
            moves.push(ShardMove {
                from_node: source.clone(),
                to_node: candidate.clone(),
            });
        }

        if !moves.is_empty() {
            plans.push(RebalancePlan {
                collection: entry.collection.clone(),
                shard_id: *shard_id,
                moves,
            });
        }
    }

    plans
}

/// Applies plans to an entry. A move whose source is `None` has nothing to
/// stream, so its target becomes an owner straight away; every other target
/// starts out pending.
pub fn apply_plans(entry: &ShardMapEntry, plans: &[RebalancePlan]) -> ShardMapEntry {
    let mut next = entry.clone();
    for plan in plans {
        if plan.collection != entry.collection {
            continue;
        }
        let Some(assignment) = next.assignment.get_mut(&plan.shard_id) else {
            continue;
        };
        for shard_move in &plan.moves {
            if assignment.holds(&shard_move.to_node) {
                continue;
            }
            if shard_move.from_node.is_some() {
                assignment.pending.push(shard_move.to_node.clone());
            } else {
                assignment.owners.push(shard_move.to_node.clone());
            }
        }
    }
    next.generation += 1;
    next
}

/// Moves `node` from pending to owners for one shard.
pub fn promote(entry: &ShardMapEntry, shard_id: ShardId, node: &NodeId) -> Option<ShardMapEntry> {
    let assignment = entry.assignment.get(&shard_id)?;
    if !assignment.pending.contains(node) {
        return None;
    }

    let mut next = entry.clone();
    if let Some(assignment) = next.assignment.get_mut(&shard_id) {
        assignment.pending.retain(|pending| pending != node);
        if !assignment.owners.contains(node) {
            assignment.owners.push(node.clone());
        }
    }
    next.generation += 1;
    Some(next)
}
