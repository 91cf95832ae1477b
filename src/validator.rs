//! Master-promotion gating
//!
//! Before a group may be promoted to master it must demonstrably serve the
//! full shard space: no missing ids, no duplicates, no unavailable replicas,
//! and every node's declared shard list must match what the node actually
//! reports. Declared intent comes from the shard manager, runtime truth from
//! the metrics cache.

use crate::cluster::ShardRole;
use crate::metrics::{ShardMetricsManager, ShardServiceState};
use crate::shard::ShardManager;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Outcome of the promotion readiness check
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterReadiness {
    pub ready: bool,
    pub missing_shards: Vec<u32>,
    pub duplicate_shards: Vec<u32>,
    /// node id -> unavailable shard ids on that node
    pub unavailable_shards: HashMap<u32, Vec<u32>>,
    pub inconsistent_nodes: Vec<u32>,
}

/// Cross-checks declared shard lists against observed runtime state
pub struct ConfigValidator {
    manager: Arc<ShardManager>,
    metrics: Arc<ShardMetricsManager>,
}

impl ConfigValidator {
    pub fn new(manager: Arc<ShardManager>, metrics: Arc<ShardMetricsManager>) -> Self {
        Self { manager, metrics }
    }

    /// Gate for promoting a group to master.
    pub fn check_group_ready_to_be_master(&self, group_name: &str) -> Result<MasterReadiness> {
        let shard_total = self.manager.shard_total();
        if shard_total == 0 {
            return Err(Error::ClusterNotFound);
        }

        let mut remaining: HashSet<u32> = (0..shard_total).collect();
        let mut duplicate_shards = Vec::new();
        let mut unavailable_shards: HashMap<u32, Vec<u32>> = HashMap::new();

        let shard_list = self.manager.get_shards();
        for status in shard_list.shards.values() {
            if status.group_name != group_name {
                continue;
            }
            if !remaining.remove(&status.shard_id) {
                duplicate_shards.push(status.shard_id);
            }
            if status.service_state == ShardServiceState::Unavailable {
                unavailable_shards
                    .entry(status.node_id)
                    .or_default()
                    .push(status.shard_id);
            }
        }

        let mut missing_shards: Vec<u32> = remaining.into_iter().collect();
        missing_shards.sort_unstable();
        duplicate_shards.sort_unstable();
        for shards in unavailable_shards.values_mut() {
            shards.sort_unstable();
        }

        let inconsistent_nodes = self.shard_difference(group_name)?;

        let ready = missing_shards.is_empty()
            && duplicate_shards.is_empty()
            && unavailable_shards.is_empty()
            && inconsistent_nodes.is_empty();

        Ok(MasterReadiness {
            ready,
            missing_shards,
            duplicate_shards,
            unavailable_shards,
            inconsistent_nodes,
        })
    }

    /// Nodes whose declared shard list disagrees with what they report.
    ///
    /// A node may not hold leader and follower shards at the same time; the
    /// populated list must match the observed shard set in both directions.
    pub fn shard_difference(&self, group_name: &str) -> Result<Vec<u32>> {
        let nodes = self.manager.group_nodes(group_name)?;
        let mut inconsistent = Vec::new();
        for node in nodes {
            let mut leader_ids = HashSet::new();
            let mut follower_ids = HashSet::new();
            for shard in &node.shards {
                match shard.role {
                    ShardRole::Leader => leader_ids.insert(shard.shard_id),
                    ShardRole::Follower => follower_ids.insert(shard.shard_id),
                };
            }

            if !leader_ids.is_empty() && !follower_ids.is_empty() {
                inconsistent.push(node.node_id);
                continue;
            }
            let mut declared = if leader_ids.is_empty() {
                follower_ids
            } else {
                leader_ids
            };

            let (_, observed) = self.metrics.node_shard_info(group_name, node.node_id);
            let mut mismatch = false;
            for shard in observed.values() {
                if !declared.remove(&shard.shard_id) {
                    mismatch = true;
                    break;
                }
            }
            if mismatch || !declared.is_empty() {
                inconsistent.push(node.node_id);
            }
        }
        inconsistent.sort_unstable();
        Ok(inconsistent)
    }

    /// Per-role variant: leader and follower lists must each match the
    /// observed replicas of that role exactly.
    pub fn strict_shard_difference(&self, group_name: &str) -> Result<Vec<u32>> {
        let nodes = self.manager.group_nodes(group_name)?;
        let mut inconsistent = Vec::new();
        for node in nodes {
            let mut leader_ids = HashSet::new();
            let mut follower_ids = HashSet::new();
            for shard in &node.shards {
                match shard.role {
                    ShardRole::Leader => leader_ids.insert(shard.shard_id),
                    ShardRole::Follower => follower_ids.insert(shard.shard_id),
                };
            }

            let (_, observed) = self.metrics.node_shard_info(group_name, node.node_id);
            let mut mismatch = false;
            for shard in observed.values() {
                let declared = match shard.role {
                    ShardRole::Leader => &mut leader_ids,
                    ShardRole::Follower => &mut follower_ids,
                };
                if !declared.remove(&shard.shard_id) {
                    mismatch = true;
                    break;
                }
            }
            if mismatch || !leader_ids.is_empty() || !follower_ids.is_empty() {
                inconsistent.push(node.node_id);
            }
        }
        inconsistent.sort_unstable();
        Ok(inconsistent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterInfo, Dc, GroupInfo, InMemoryTopology, NodeInfo};
    use crate::hashing;
    use crate::metrics::{NodePollResult, NodeRuntimeInfo, ShardInfo};
    use crate::status::ShardStatusManager;
    use crate::store::MemoryVersionStore;

    fn node(group: &str, node_id: u32, master: bool) -> NodeInfo {
        NodeInfo {
            group_name: group.to_string(),
            node_id,
            host: "127.0.0.1".to_string(),
            port: 8000 + node_id as u16,
            weight: 10,
            master,
            active: true,
            shards: Vec::new(),
            is_edge_node: false,
        }
    }

    struct Fixture {
        manager: Arc<ShardManager>,
        metrics: Arc<ShardMetricsManager>,
        status: Arc<ShardStatusManager>,
        validator: ConfigValidator,
    }

    /// One master group and one follower group, assignment already run.
    fn fixture(shard_total: u32) -> Fixture {
        let info = ClusterInfo {
            name: "laser_test".to_string(),
            shard_total,
            dcs: vec![Dc {
                name: "dc1".to_string(),
                shard_number: 0,
            }],
            groups: vec![
                GroupInfo {
                    name: "g1".to_string(),
                    dc_name: "dc1".to_string(),
                    nodes: vec![node("g1", 1, true)],
                },
                GroupInfo {
                    name: "g2".to_string(),
                    dc_name: "dc1".to_string(),
                    nodes: vec![node("g2", 2, false), node("g2", 3, false)],
                },
            ],
        };
        let topology = Arc::new(InMemoryTopology::new(info.clone()));
        let metrics = Arc::new(ShardMetricsManager::new(topology, 5000).unwrap());
        let status = Arc::new(ShardStatusManager::new(metrics.clone(), 5000));
        let manager = Arc::new(ShardManager::new(
            "laser_test",
            Arc::new(MemoryVersionStore::new()),
            status.clone(),
        ));
        manager.update_cluster_info(&info);
        manager.assign_shards();
        let validator = ConfigValidator::new(manager.clone(), metrics.clone());
        Fixture {
            manager,
            metrics,
            status,
            validator,
        }
    }

    /// Feed the metrics cache exactly what the declared topology promises.
    fn observe_declared(fixture: &Fixture, unavailable: &[(u32, u32)], drop: &[(u32, u32)]) {
        let mut results = Vec::new();
        for group in ["g1", "g2"] {
            for declared in fixture.manager.group_nodes(group).unwrap() {
                let node_hash = hashing::node_hash(group, declared.node_id);
                let mut shards = std::collections::HashMap::new();
                for shard in &declared.shards {
                    if drop.contains(&(declared.node_id, shard.shard_id)) {
                        continue;
                    }
                    let shard_hash = hashing::shard_hash(node_hash, shard.shard_id);
                    let state = if unavailable.contains(&(declared.node_id, shard.shard_id)) {
                        ShardServiceState::Unavailable
                    } else {
                        ShardServiceState::Available
                    };
                    shards.insert(
                        shard_hash.clone(),
                        ShardInfo {
                            shard_id: shard.shard_id,
                            shard_hash,
                            role: shard.role,
                            service_state: state,
                            seq_no: 100,
                            base_version_hash: 7,
                            metrics: std::collections::HashMap::new(),
                            partitions: vec![],
                        },
                    );
                }
                results.push(NodePollResult {
                    group_name: group.to_string(),
                    node_id: declared.node_id,
                    info: NodeRuntimeInfo {
                        group_name: group.to_string(),
                        node_id: declared.node_id,
                        host: declared.host.clone(),
                        port: declared.port,
                        master: Some(declared.master),
                        is_available: true,
                    },
                    shards,
                });
            }
        }
        fixture.metrics.apply_results(results);
        fixture.status.sync_shard_list();
    }

    #[tokio::test]
    async fn a_consistent_follower_group_is_ready() {
        let fx = fixture(8);
        observe_declared(&fx, &[], &[]);
        let report = fx.validator.check_group_ready_to_be_master("g2").unwrap();
        assert!(report.ready, "unexpected report: {report:?}");
        assert!(report.missing_shards.is_empty());
        assert!(report.duplicate_shards.is_empty());
        assert!(report.unavailable_shards.is_empty());
        assert!(report.inconsistent_nodes.is_empty());
    }

    #[tokio::test]
    async fn unavailable_replicas_block_promotion() {
        let fx = fixture(8);
        let victim = fx.manager.group_nodes("g2").unwrap()[0].shards[0].clone();
        observe_declared(&fx, &[(victim.node_id, victim.shard_id)], &[]);
        let report = fx.validator.check_group_ready_to_be_master("g2").unwrap();
        assert!(!report.ready);
        assert_eq!(
            report.unavailable_shards.get(&victim.node_id),
            Some(&vec![victim.shard_id])
        );
    }

    #[tokio::test]
    async fn missing_replicas_block_promotion() {
        let fx = fixture(8);
        let victim = fx.manager.group_nodes("g2").unwrap()[0].shards[0].clone();
        observe_declared(&fx, &[], &[(victim.node_id, victim.shard_id)]);
        let report = fx.validator.check_group_ready_to_be_master("g2").unwrap();
        assert!(!report.ready);
        assert_eq!(report.missing_shards, vec![victim.shard_id]);
        // The node also disagrees with its declared list.
        assert_eq!(report.inconsistent_nodes, vec![victim.node_id]);
    }

    #[tokio::test]
    async fn strict_difference_matches_roles() {
        let fx = fixture(8);
        observe_declared(&fx, &[], &[]);
        assert!(fx.validator.strict_shard_difference("g1").unwrap().is_empty());
        assert!(fx.validator.strict_shard_difference("g2").unwrap().is_empty());

        // Dropping one observed replica makes its node strictly inconsistent.
        let victim = fx.manager.group_nodes("g2").unwrap()[0].shards[0].clone();
        observe_declared(&fx, &[], &[(victim.node_id, victim.shard_id)]);
        assert_eq!(
            fx.validator.strict_shard_difference("g2").unwrap(),
            vec![victim.node_id]
        );
    }

    #[tokio::test]
    async fn unknown_group_is_an_error() {
        let fx = fixture(8);
        let err = fx.validator.shard_difference("nope").unwrap_err();
        assert!(matches!(err, Error::GroupNotFound(_)));
    }
}
