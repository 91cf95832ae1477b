//! Leader/follower relations and replication-diff flags
//!
//! Runs on its own tick against the metrics collector's cache only; no direct
//! node I/O happens here. Each cycle rebuilds the relation graph and the
//! per-replica diff flags and swaps them in wholesale.

use crate::cluster::ShardRole;
use crate::hashing;
use crate::metrics::{ShardMetricsManager, ShardServiceState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Relative lag tolerated before a follower is flagged, percent
const DEFAULT_DIFF_RATE: f64 = 3.0;
/// Absolute lag tolerated regardless of rate, sequence numbers
const DEFAULT_DIFF_SEQ_NUMBERS: u64 = 1000;

/// Delay before the first reconcile tick, letting the metrics cache warm up
const STARTUP_DELAY: Duration = Duration::from_secs(10);

pub const DEFAULT_STATUS_TTL_MS: u64 = 5000;

/// Public per-replica status derived from the metrics cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardStatus {
    pub shard_id: u32,
    pub group_name: String,
    pub node_id: u32,
    pub role: ShardRole,
    pub seq_no: u64,
    pub base_version_hash: u64,
    pub service_state: ShardServiceState,
    pub shard_hash: String,
    pub no_diff: bool,
    pub has_leader: bool,
}

/// Leader and followers of one logical shard id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardRelation {
    pub leader: String,
    pub follower: Vec<String>,
}

/// Endpoint of a node the reconciler tracks
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
    pub group_name: String,
    pub node_id: u32,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Default)]
struct StatusSnapshot {
    shards: HashMap<String, ShardStatus>,
    relations: HashMap<u32, ShardRelation>,
}

/// Derives the relation graph and diff flags from the metrics cache
pub struct ShardStatusManager {
    metrics: Arc<ShardMetricsManager>,
    nodes: RwLock<HashMap<u64, NodeEndpoint>>,
    snapshot: RwLock<Arc<StatusSnapshot>>,
    ttl: Duration,
}

impl ShardStatusManager {
    pub fn new(metrics: Arc<ShardMetricsManager>, ttl_ms: u64) -> Self {
        Self {
            metrics,
            nodes: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(StatusSnapshot::default())),
            ttl: Duration::from_millis(ttl_ms),
        }
    }

    /// Replace the tracked node set. Called whenever topology changes.
    pub fn set_nodes(&self, nodes: Vec<NodeEndpoint>) {
        let mut new_nodes = HashMap::with_capacity(nodes.len());
        for node in nodes {
            new_nodes.insert(hashing::node_hash(&node.group_name, node.node_id), node);
        }
        *self.nodes.write() = new_nodes;
    }

    pub fn add_nodes(&self, nodes: Vec<NodeEndpoint>) {
        let mut current = self.nodes.write();
        for node in nodes {
            current.insert(hashing::node_hash(&node.group_name, node.node_id), node);
        }
    }

    pub fn delete_nodes(&self, nodes: &[NodeEndpoint]) {
        let mut current = self.nodes.write();
        for node in nodes {
            current.remove(&hashing::node_hash(&node.group_name, node.node_id));
        }
    }

    /// Owned copies of the current status and relation maps.
    pub fn shard_status(
        &self,
    ) -> (HashMap<String, ShardStatus>, HashMap<u32, ShardRelation>) {
        let snapshot = self.snapshot.read().clone();
        (snapshot.shards.clone(), snapshot.relations.clone())
    }

    /// Run the reconcile loop until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(STARTUP_DELAY) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }

        let mut ticker = tokio::time::interval(self.ttl);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(ttl_ms = self.ttl.as_millis() as u64, "shard status reconciler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("start pull shard list");
                    self.sync_shard_list();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shard status reconciler stopped");
                        return;
                    }
                }
            }
        }
    }

    pub(crate) fn sync_shard_list(&self) {
        let nodes: Vec<NodeEndpoint> = self.nodes.read().values().cloned().collect();
        let mut by_node = Vec::with_capacity(nodes.len());
        for node in nodes {
            let (info, shard_map) = self.metrics.node_shard_info(&node.group_name, node.node_id);
            let Some(info) = info else {
                continue;
            };
            let mut statuses = HashMap::with_capacity(shard_map.len());
            for (shard_hash, shard) in shard_map {
                statuses.insert(
                    shard.shard_id,
                    ShardStatus {
                        shard_id: shard.shard_id,
                        group_name: info.group_name.clone(),
                        node_id: info.node_id,
                        role: shard.role,
                        seq_no: shard.seq_no,
                        base_version_hash: shard.base_version_hash,
                        service_state: shard.service_state,
                        shard_hash,
                        no_diff: false,
                        has_leader: false,
                    },
                );
            }
            by_node.push(statuses);
        }
        let snapshot = reconcile(by_node);
        *self.snapshot.write() = Arc::new(snapshot);
    }
}

/// Group replicas by shard id, split into leader/followers, and compute the
/// diff flags for every follower.
fn reconcile(by_node: Vec<HashMap<u32, ShardStatus>>) -> StatusSnapshot {
    let mut by_shard_id: HashMap<u32, Vec<ShardStatus>> = HashMap::new();
    let mut shards: HashMap<String, ShardStatus> = HashMap::new();
    for node_shards in by_node {
        for (shard_id, status) in node_shards {
            shards.insert(status.shard_hash.clone(), status.clone());
            by_shard_id.entry(shard_id).or_default().push(status);
        }
    }

    let mut relations: HashMap<u32, ShardRelation> = HashMap::new();
    for (shard_id, replicas) in by_shard_id {
        let mut relation = ShardRelation::default();
        for replica in replicas {
            if replica.role == ShardRole::Leader {
                relation.leader = replica.shard_hash;
            } else {
                relation.follower.push(replica.shard_hash);
            }
        }
        relations.insert(shard_id, relation);
    }

    for relation in relations.values() {
        match shards.get(&relation.leader).cloned() {
            None => {
                for follower_hash in &relation.follower {
                    if let Some(status) = shards.get_mut(follower_hash) {
                        status.has_leader = false;
                    }
                }
            }
            Some(leader) => {
                for follower_hash in &relation.follower {
                    let Some(status) = shards.get_mut(follower_hash) else {
                        continue;
                    };
                    status.has_leader = true;
                    if status.base_version_hash != leader.base_version_hash {
                        // Different data generation: lag math is meaningless.
                        status.no_diff = false;
                        continue;
                    }
                    let delta = status.seq_no.abs_diff(leader.seq_no);
                    let diff_rate = (delta as f64 / (status.seq_no as f64 + 1.0)) * 100.0;
                    status.no_diff =
                        diff_rate <= DEFAULT_DIFF_RATE || delta < DEFAULT_DIFF_SEQ_NUMBERS;
                }
            }
        }
    }

    StatusSnapshot { shards, relations }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(
        shard_id: u32,
        node_id: u32,
        role: ShardRole,
        seq_no: u64,
        base_version_hash: u64,
    ) -> ShardStatus {
        let node_hash = hashing::node_hash("g1", node_id);
        ShardStatus {
            shard_id,
            group_name: "g1".to_string(),
            node_id,
            role,
            seq_no,
            base_version_hash,
            service_state: ShardServiceState::Available,
            shard_hash: hashing::shard_hash(node_hash, shard_id),
            no_diff: false,
            has_leader: false,
        }
    }

    fn node_map(statuses: Vec<ShardStatus>) -> HashMap<u32, ShardStatus> {
        statuses.into_iter().map(|s| (s.shard_id, s)).collect()
    }

    fn follower_of(snapshot: &StatusSnapshot, shard_id: u32) -> &ShardStatus {
        let relation = &snapshot.relations[&shard_id];
        &snapshot.shards[&relation.follower[0]]
    }

    #[test]
    fn relations_split_leader_and_followers() {
        let snapshot = reconcile(vec![
            node_map(vec![status(0, 1, ShardRole::Leader, 100, 7)]),
            node_map(vec![status(0, 2, ShardRole::Follower, 100, 7)]),
            node_map(vec![status(0, 3, ShardRole::Follower, 100, 7)]),
        ]);
        let relation = &snapshot.relations[&0];
        assert!(!relation.leader.is_empty());
        assert_eq!(relation.follower.len(), 2);
    }

    #[test]
    fn equal_seq_and_generation_means_no_diff() {
        let snapshot = reconcile(vec![
            node_map(vec![status(0, 1, ShardRole::Leader, 500, 7)]),
            node_map(vec![status(0, 2, ShardRole::Follower, 500, 7)]),
        ]);
        let follower = follower_of(&snapshot, 0);
        assert!(follower.no_diff);
        assert!(follower.has_leader);
    }

    #[test]
    fn different_generation_is_always_a_diff() {
        let snapshot = reconcile(vec![
            node_map(vec![status(0, 1, ShardRole::Leader, 500, 7)]),
            node_map(vec![status(0, 2, ShardRole::Follower, 500, 8)]),
        ]);
        let follower = follower_of(&snapshot, 0);
        assert!(!follower.no_diff);
        assert!(follower.has_leader);
    }

    #[test]
    fn small_absolute_lag_is_tolerated() {
        // 999 behind, below the absolute threshold.
        let snapshot = reconcile(vec![
            node_map(vec![status(0, 1, ShardRole::Leader, 10_000, 7)]),
            node_map(vec![status(0, 2, ShardRole::Follower, 9_001, 7)]),
        ]);
        assert!(follower_of(&snapshot, 0).no_diff);
    }

    #[test]
    fn small_relative_lag_is_tolerated() {
        // 2000 behind on a 100k stream: 2% <= 3%.
        let snapshot = reconcile(vec![
            node_map(vec![status(0, 1, ShardRole::Leader, 102_000, 7)]),
            node_map(vec![status(0, 2, ShardRole::Follower, 100_000, 7)]),
        ]);
        assert!(follower_of(&snapshot, 0).no_diff);
    }

    #[test]
    fn large_lag_is_flagged() {
        // 5000 behind on a 20k stream: 25% > 3% and >= 1000.
        let snapshot = reconcile(vec![
            node_map(vec![status(0, 1, ShardRole::Leader, 25_000, 7)]),
            node_map(vec![status(0, 2, ShardRole::Follower, 20_000, 7)]),
        ]);
        assert!(!follower_of(&snapshot, 0).no_diff);
    }

    #[test]
    fn followers_without_leader_are_flagged() {
        let snapshot = reconcile(vec![
            node_map(vec![status(0, 2, ShardRole::Follower, 100, 7)]),
            node_map(vec![status(0, 3, ShardRole::Follower, 100, 7)]),
        ]);
        for follower_hash in &snapshot.relations[&0].follower {
            let follower = &snapshot.shards[follower_hash];
            assert!(!follower.has_leader);
            assert!(!follower.no_diff);
        }
    }
}
