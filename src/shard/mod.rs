//! Declared shard topology: assignment and versioned persistence
//!
//! The manager owns the in-memory node inventory (rebuilt wholesale on every
//! topology change), runs the weighted assignment, and persists each computed
//! topology as a rollback-capable versioned snapshot. Exactly one snapshot
//! per service is Active; switching versions is transactional and a mismatch
//! between a stored snapshot and the live config is a hard error before any
//! in-memory mutation.

mod assignment;

use crate::cluster::{ClusterInfo, Dc, NodeInfo, Shard, ShardRole, TopologyProvider};
use crate::hashing;
use crate::status::{NodeEndpoint, ShardRelation, ShardStatus, ShardStatusManager};
use crate::store::{NewShardStore, VersionStore};
use crate::{Error, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Per-node shard lists inside a serialized snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeVersionData {
    pub leader_shard_list: Vec<u32>,
    pub follower_shard_list: Vec<u32>,
    pub node_id: u32,
    pub is_edge_node: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupVersionData {
    pub group_name: String,
    pub dc: String,
    pub nodes: Vec<NodeVersionData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataCenterData {
    pub name: String,
    pub shard_number: u32,
}

/// The serialized snapshot format, shared by the version store and the
/// service-registry publisher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardVersionData {
    pub cluster_name: String,
    pub shard_number: u32,
    pub dcs: Vec<DataCenterData>,
    pub groups: Vec<GroupVersionData>,
}

/// Replica hashes per node id within one group
pub type GroupShardDto = HashMap<u32, Vec<String>>;

/// Read model served to the HTTP layer
#[derive(Debug, Clone, Serialize)]
pub struct ShardList {
    pub relations: HashMap<u32, ShardRelation>,
    pub shards: HashMap<String, ShardStatus>,
    #[serde(rename = "groupShards")]
    pub groups: HashMap<String, GroupShardDto>,
}

#[derive(Debug, Default)]
struct ManagerState {
    cluster_name: String,
    shard_total: u32,
    dcs: Vec<Dc>,
    groups: BTreeMap<String, BTreeMap<u32, NodeInfo>>,
    group_to_dc: HashMap<String, String>,
    active_version: Option<String>,
}

/// Owner of the declared shard topology
pub struct ShardManager {
    service_name: String,
    state: RwLock<ManagerState>,
    store: Arc<dyn VersionStore>,
    status: Arc<ShardStatusManager>,
}

impl ShardManager {
    pub fn new(
        service_name: impl Into<String>,
        store: Arc<dyn VersionStore>,
        status: Arc<ShardStatusManager>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            state: RwLock::new(ManagerState::default()),
            store,
            status,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn cluster_name(&self) -> String {
        self.state.read().cluster_name.clone()
    }

    pub fn shard_total(&self) -> u32 {
        self.state.read().shard_total
    }

    pub fn active_version(&self) -> Option<String> {
        self.state.read().active_version.clone()
    }

    /// Declared nodes of one group.
    pub fn group_nodes(&self, group_name: &str) -> Result<Vec<NodeInfo>> {
        let state = self.state.read();
        let group = state
            .groups
            .get(group_name)
            .ok_or_else(|| Error::GroupNotFound(group_name.to_string()))?;
        Ok(group.values().cloned().collect())
    }

    /// Rebuild the node inventory wholesale from a fresh cluster description
    /// and hand the reconciler its new node set.
    pub fn update_cluster_info(&self, info: &ClusterInfo) {
        let mut groups = BTreeMap::new();
        let mut group_to_dc = HashMap::new();
        let mut endpoints = Vec::new();
        for group in &info.groups {
            group_to_dc.insert(group.name.clone(), group.dc_name.clone());
            let mut group_nodes = BTreeMap::new();
            for node in &group.nodes {
                let mut node = node.clone();
                node.group_name = group.name.clone();
                endpoints.push(NodeEndpoint {
                    group_name: group.name.clone(),
                    node_id: node.node_id,
                    host: node.host.clone(),
                    port: node.port,
                });
                group_nodes.insert(node.node_id, node);
            }
            groups.insert(group.name.clone(), group_nodes);
        }

        {
            let mut state = self.state.write();
            state.cluster_name = info.name.clone();
            state.shard_total = info.shard_total;
            state.dcs = info.dcs.clone();
            state.groups = groups;
            state.group_to_dc = group_to_dc;
        }
        self.status.set_nodes(endpoints);
    }

    /// Re-apply topology whenever the provider signals a change.
    pub fn watch_topology(
        self: &Arc<Self>,
        provider: Arc<dyn TopologyProvider>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut epoch = provider.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = epoch.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        match provider.cluster().await {
                            Ok(cluster) => {
                                info!(cluster = %cluster.name, "topology changed, rebuilding node inventory");
                                manager.update_cluster_info(&cluster);
                            }
                            Err(e) => error!(error = %e, "failed to re-read topology"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Run the weighted assignment over every group, leaders and followers
    /// independently.
    pub fn assign_shards(&self) {
        let mut state = self.state.write();
        let shard_total = state.shard_total;
        for nodes in state.groups.values_mut() {
            let mut leader_ids = Vec::new();
            let mut follower_ids = Vec::new();
            for (node_id, node) in nodes.iter() {
                if node.master {
                    leader_ids.push(*node_id);
                } else {
                    follower_ids.push(*node_id);
                }
            }
            if !leader_ids.is_empty() {
                assignment::assign_role_set(nodes, &leader_ids, shard_total);
            }
            if !follower_ids.is_empty() {
                assignment::assign_role_set(nodes, &follower_ids, shard_total);
            }
        }
    }

    /// Current runtime truth plus the declared replica-hash layout.
    pub fn get_shards(&self) -> ShardList {
        let (shards, relations) = self.status.shard_status();
        ShardList {
            relations,
            shards,
            groups: self.to_dto(),
        }
    }

    /// The exact serialization the store would persist for the current
    /// in-memory state; the registry publisher mirrors this.
    pub fn current_version_data(&self) -> Result<String> {
        let state = self.state.read();
        Ok(serde_json::to_string(&to_version_data(&state))?)
    }

    /// Load the active snapshot; if none exists yet, assign fresh and store.
    pub async fn bootstrap(&self) -> Result<()> {
        match self.load_active_shards().await {
            Err(Error::VersionNotFound) => {
                info!(service = %self.service_name, "no active shard version, assigning fresh");
                self.assign_shards();
                self.store_shards().await?;
                Ok(())
            }
            other => other,
        }
    }

    /// Persist the current in-memory topology as the new Active version.
    pub async fn store_shards(&self) -> Result<String> {
        let new = {
            let state = self.state.read();
            NewShardStore {
                service_name: self.service_name.clone(),
                version: new_version(),
                data: serde_json::to_string(&to_version_data(&state))?,
                created_at: Utc::now(),
            }
        };
        let record = self.store.store_new_active(new).await?;
        self.state.write().active_version = Some(record.version.clone());
        info!(service = %self.service_name, version = %record.version, "stored new active shard version");
        Ok(record.version)
    }

    /// Load the single Active snapshot and repopulate the in-memory shard
    /// lists from it. Validation failures abort before any mutation.
    pub async fn load_active_shards(&self) -> Result<()> {
        let record = self
            .store
            .load_active(&self.service_name)
            .await?
            .ok_or(Error::VersionNotFound)?;
        let data: ShardVersionData = serde_json::from_str(&record.data)?;

        let mut state = self.state.write();
        if data.cluster_name != state.cluster_name {
            return Err(Error::ClusterMismatch {
                expected: state.cluster_name.clone(),
                actual: data.cluster_name,
            });
        }
        if data.shard_number != state.shard_total {
            return Err(Error::ShardTotalMismatch {
                expected: state.shard_total,
                actual: data.shard_number,
            });
        }

        for group in state.groups.values_mut() {
            for node in group.values_mut() {
                node.shards = Vec::new();
            }
        }
        for group_data in &data.groups {
            let Some(group) = state.groups.get_mut(&group_data.group_name) else {
                warn!(group = %group_data.group_name, "stored group no longer declared, skipping");
                continue;
            };
            for node_data in &group_data.nodes {
                let Some(node) = group.get_mut(&node_data.node_id) else {
                    warn!(
                        group = %group_data.group_name,
                        node_id = node_data.node_id,
                        "stored node no longer declared, skipping"
                    );
                    continue;
                };
                for shard_id in &node_data.leader_shard_list {
                    node.shards.push(Shard {
                        group_name: group_data.group_name.clone(),
                        node_id: node_data.node_id,
                        shard_id: *shard_id,
                        role: ShardRole::Leader,
                    });
                }
                for shard_id in &node_data.follower_shard_list {
                    node.shards.push(Shard {
                        group_name: group_data.group_name.clone(),
                        node_id: node_data.node_id,
                        shard_id: *shard_id,
                        role: ShardRole::Follower,
                    });
                }
            }
        }
        state.active_version = Some(record.version);
        Ok(())
    }

    /// Roll back (or forward) to a specific stored version: flip the Active
    /// flags in one transaction, then reload from the store.
    pub async fn exchange_shards(&self, version: &str) -> Result<()> {
        let expected = self.state.read().active_version.clone();
        self.store
            .exchange_active(&self.service_name, expected.as_deref(), version)
            .await?;
        self.state.write().active_version = Some(version.to_string());
        info!(service = %self.service_name, version = %version, "switched active shard version");
        self.load_active_shards().await
    }

    fn to_dto(&self) -> HashMap<String, GroupShardDto> {
        let state = self.state.read();
        let mut groups = HashMap::with_capacity(state.groups.len());
        for (group_name, group_nodes) in &state.groups {
            let mut group = GroupShardDto::new();
            for node in group_nodes.values() {
                let node_hash = hashing::node_hash(group_name, node.node_id);
                let hashes = node
                    .shards
                    .iter()
                    .map(|s| hashing::shard_hash(node_hash, s.shard_id))
                    .collect();
                group.insert(node.node_id, hashes);
            }
            groups.insert(group_name.clone(), group);
        }
        groups
    }
}

fn new_version() -> String {
    Uuid::new_v4().to_string()
}

/// Serialize the in-memory groups with deterministic ordering, excluding
/// inactive nodes, so unchanged state always produces identical bytes.
fn to_version_data(state: &ManagerState) -> ShardVersionData {
    let mut groups = Vec::with_capacity(state.groups.len());
    for (group_name, group_nodes) in &state.groups {
        let mut nodes = Vec::with_capacity(group_nodes.len());
        for node in group_nodes.values() {
            if !node.active {
                continue;
            }
            let mut leader_list = Vec::new();
            let mut follower_list = Vec::new();
            for shard in &node.shards {
                match shard.role {
                    ShardRole::Leader => leader_list.push(shard.shard_id),
                    ShardRole::Follower => follower_list.push(shard.shard_id),
                }
            }
            nodes.push(NodeVersionData {
                leader_shard_list: leader_list,
                follower_shard_list: follower_list,
                node_id: node.node_id,
                is_edge_node: node.is_edge_node,
            });
        }
        let dc = state
            .group_to_dc
            .get(group_name)
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        groups.push(GroupVersionData {
            group_name: group_name.clone(),
            dc,
            nodes,
        });
    }

    let dcs = state
        .dcs
        .iter()
        .map(|dc| DataCenterData {
            name: dc.name.clone(),
            shard_number: dc.shard_number,
        })
        .collect();

    ShardVersionData {
        cluster_name: state.cluster_name.clone(),
        shard_number: state.shard_total,
        dcs,
        groups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_data_uses_the_storage_field_names() {
        let data = ShardVersionData {
            cluster_name: "laser_test".to_string(),
            shard_number: 4,
            dcs: vec![DataCenterData {
                name: "dc1".to_string(),
                shard_number: 0,
            }],
            groups: vec![GroupVersionData {
                group_name: "g1".to_string(),
                dc: "dc1".to_string(),
                nodes: vec![NodeVersionData {
                    leader_shard_list: vec![0, 1],
                    follower_shard_list: vec![],
                    node_id: 1,
                    is_edge_node: false,
                }],
            }],
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["ClusterName"], "laser_test");
        assert_eq!(json["ShardNumber"], 4);
        assert_eq!(json["Dcs"][0]["Name"], "dc1");
        assert_eq!(json["Groups"][0]["GroupName"], "g1");
        assert_eq!(json["Groups"][0]["Dc"], "dc1");
        assert_eq!(json["Groups"][0]["Nodes"][0]["NodeId"], 1);
        assert_eq!(json["Groups"][0]["Nodes"][0]["LeaderShardList"][0], 0);
        assert_eq!(json["Groups"][0]["Nodes"][0]["IsEdgeNode"], false);
    }

    #[test]
    fn version_keys_are_unique() {
        assert_ne!(new_version(), new_version());
    }
}
