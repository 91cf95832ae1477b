//! Weighted shard assignment
//!
//! Applied independently to the leader-eligible and follower-eligible node
//! sets of a group, so each role-set fully tiles the shard space. Rebalancing
//! trims the tail of over-assigned nodes and pools the freed ids together
//! with any unheld ids, so only the deficit moves.

use crate::cluster::{NodeInfo, Shard, ShardRole};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// Desired shard count per node: ceil(total * weight / sum(weight)), with any
/// positive remainder added to the last node visited.
pub(crate) fn shard_counts(nodes: &[(u32, u32)], shard_total: u32) -> HashMap<u32, usize> {
    let total_weight: u64 = nodes.iter().map(|(_, w)| u64::from(*w)).sum();
    let mut counts = HashMap::with_capacity(nodes.len());
    if total_weight == 0 {
        return counts;
    }

    let mut remainder = i64::from(shard_total);
    let mut last_node_id = None;
    for (node_id, weight) in nodes {
        let rate = f64::from(*weight) / total_weight as f64;
        let number = (f64::from(shard_total) * rate).ceil() as i64;
        remainder -= number;
        last_node_id = Some(*node_id);
        counts.insert(*node_id, number as usize);
    }

    if remainder > 0 {
        if let Some(node_id) = last_node_id {
            if let Some(count) = counts.get_mut(&node_id) {
                *count += remainder as usize;
            }
        }
    }
    counts
}

/// Rebalance one role-homogeneous node set so every shard id in
/// [0, shard_total) is held exactly once.
///
/// `member_ids` must be sorted; nodes are visited in that order. Ids outside
/// the shard range and duplicate holdings (first holder wins) are dropped
/// before rebalancing, so the invariant holds from arbitrary starting states.
pub(crate) fn assign_role_set(
    nodes: &mut BTreeMap<u32, NodeInfo>,
    member_ids: &[u32],
    shard_total: u32,
) {
    let weights: Vec<(u32, u32)> = member_ids
        .iter()
        .filter_map(|id| nodes.get(id).map(|n| (*id, n.weight)))
        .collect();
    let counts = shard_counts(&weights, shard_total);
    if counts.is_empty() {
        warn!(shard_total, "role set has zero total weight, skipping assignment");
        return;
    }

    // `accounted` holds every id that is either kept by a node or already in
    // the pool, so the missing-id scan below cannot double-pool.
    let mut pool: Vec<u32> = Vec::new();
    let mut accounted: HashSet<u32> = HashSet::new();
    for node_id in member_ids {
        let Some(node) = nodes.get_mut(node_id) else {
            continue;
        };
        node.shards
            .retain(|s| s.shard_id < shard_total && accounted.insert(s.shard_id));
        let desired = counts.get(node_id).copied().unwrap_or(0);
        if node.shards.len() > desired {
            for freed in node.shards.split_off(desired) {
                pool.push(freed.shard_id);
            }
        }
    }
    for shard_id in 0..shard_total {
        if !accounted.contains(&shard_id) {
            pool.push(shard_id);
        }
    }

    let mut pool = pool.into_iter();
    for node_id in member_ids {
        let Some(node) = nodes.get_mut(node_id) else {
            continue;
        };
        let desired = counts.get(node_id).copied().unwrap_or(0);
        while node.shards.len() < desired {
            let Some(shard_id) = pool.next() else {
                return;
            };
            let role = if node.master {
                ShardRole::Leader
            } else {
                ShardRole::Follower
            };
            node.shards.push(Shard {
                group_name: node.group_name.clone(),
                node_id: node.node_id,
                shard_id,
                role,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_id: u32, weight: u32, master: bool) -> NodeInfo {
        NodeInfo {
            group_name: "g1".to_string(),
            node_id,
            host: "127.0.0.1".to_string(),
            port: 8000 + node_id as u16,
            weight,
            master,
            active: true,
            shards: Vec::new(),
            is_edge_node: false,
        }
    }

    fn node_set(nodes: Vec<NodeInfo>) -> BTreeMap<u32, NodeInfo> {
        nodes.into_iter().map(|n| (n.node_id, n)).collect()
    }

    fn held_ids(nodes: &BTreeMap<u32, NodeInfo>) -> Vec<u32> {
        let mut ids: Vec<u32> = nodes
            .values()
            .flat_map(|n| n.shards.iter().map(|s| s.shard_id))
            .collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn every_shard_assigned_exactly_once() {
        let mut nodes = node_set(vec![node(1, 10, false), node(2, 20, false), node(3, 5, false)]);
        let ids: Vec<u32> = nodes.keys().copied().collect();
        assign_role_set(&mut nodes, &ids, 32);
        assert_eq!(held_ids(&nodes), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn heavier_nodes_get_at_least_as_many_shards() {
        let weights = vec![(1, 5), (2, 10), (3, 20)];
        let counts = shard_counts(&weights, 64);
        assert!(counts[&2] >= counts[&1]);
        assert!(counts[&3] >= counts[&2]);
        // Desired counts tile the space after the remainder fix-up.
        assert!(counts.values().sum::<usize>() >= 64);
    }

    #[test]
    fn equal_weights_split_evenly() {
        let counts = shard_counts(&[(1, 10), (2, 10), (3, 10), (4, 10)], 12);
        for count in counts.values() {
            assert_eq!(*count, 3);
        }
    }

    #[test]
    fn zero_total_weight_skips_assignment() {
        let mut nodes = node_set(vec![node(1, 0, false), node(2, 0, false)]);
        let ids: Vec<u32> = nodes.keys().copied().collect();
        assign_role_set(&mut nodes, &ids, 8);
        assert!(held_ids(&nodes).is_empty());
    }

    #[test]
    fn rebalance_moves_only_the_deficit() {
        let mut nodes = node_set(vec![node(1, 10, false), node(2, 10, false)]);
        let ids: Vec<u32> = nodes.keys().copied().collect();
        assign_role_set(&mut nodes, &ids, 12);
        let before: Vec<u32> = nodes[&1].shards.iter().map(|s| s.shard_id).collect();
        assert_eq!(before.len(), 6);

        // Adding a third equal-weight node trims two ids off each tail.
        nodes.insert(3, node(3, 10, false));
        let ids: Vec<u32> = nodes.keys().copied().collect();
        assign_role_set(&mut nodes, &ids, 12);
        assert_eq!(held_ids(&nodes), (0..12).collect::<Vec<_>>());
        let after: Vec<u32> = nodes[&1].shards.iter().map(|s| s.shard_id).collect();
        assert_eq!(after.len(), 4);
        assert_eq!(after[..4], before[..4]);
    }

    #[test]
    fn masters_get_leader_role_and_others_follower() {
        let mut nodes = node_set(vec![node(1, 10, true)]);
        assign_role_set(&mut nodes, &[1], 4);
        assert!(nodes[&1].shards.iter().all(|s| s.role == ShardRole::Leader));

        let mut nodes = node_set(vec![node(2, 10, false)]);
        assign_role_set(&mut nodes, &[2], 4);
        assert!(nodes[&2].shards.iter().all(|s| s.role == ShardRole::Follower));
    }

    #[test]
    fn out_of_range_and_duplicate_holdings_are_repaired() {
        let mut nodes = node_set(vec![node(1, 10, false), node(2, 10, false)]);
        // Node 1 claims an id past the shard range; both claim id 0.
        nodes.get_mut(&1).unwrap().shards = vec![
            Shard {
                group_name: "g1".to_string(),
                node_id: 1,
                shard_id: 99,
                role: ShardRole::Follower,
            },
            Shard {
                group_name: "g1".to_string(),
                node_id: 1,
                shard_id: 0,
                role: ShardRole::Follower,
            },
        ];
        nodes.get_mut(&2).unwrap().shards = vec![Shard {
            group_name: "g1".to_string(),
            node_id: 2,
            shard_id: 0,
            role: ShardRole::Follower,
        }];
        let ids: Vec<u32> = nodes.keys().copied().collect();
        assign_role_set(&mut nodes, &ids, 8);
        assert_eq!(held_ids(&nodes), (0..8).collect::<Vec<_>>());
    }
}
