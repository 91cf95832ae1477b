//! Declared cluster topology
//!
//! The admin layer owns the authoritative cluster/group/node records; the
//! control plane consumes them through the [`TopologyProvider`] seam and is
//! notified when they change. [`InMemoryTopology`] is the standalone
//! implementation, loaded from a JSON document at startup and mutable through
//! the same process.

use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Role a replica plays for its logical shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardRole {
    Leader,
    Follower,
}

/// One replica placement in the declared topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub group_name: String,
    pub node_id: u32,
    pub shard_id: u32,
    pub role: ShardRole,
}

/// One storage server process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub group_name: String,
    pub node_id: u32,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub master: bool,
    pub active: bool,
    #[serde(default)]
    pub shards: Vec<Shard>,
    #[serde(default)]
    pub is_edge_node: bool,
}

impl NodeInfo {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Data center, optionally overriding the cluster-wide shard count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dc {
    pub name: String,
    /// 0 means "use the cluster total"
    #[serde(default)]
    pub shard_number: u32,
}

/// Named set of nodes in one data center; an independent failure domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub dc_name: String,
    pub nodes: Vec<NodeInfo>,
}

/// Full declarative cluster description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    pub shard_total: u32,
    #[serde(default)]
    pub dcs: Vec<Dc>,
    pub groups: Vec<GroupInfo>,
}

/// Table catalog entry, used to map partitions onto shards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub database_name: String,
    pub table_name: String,
    pub partition_number: u32,
    pub dc: String,
}

/// Seam to the declarative topology collaborator
///
/// `subscribe` yields a watch channel whose value is bumped on every topology
/// edit; subscribers re-read the cluster and rebuild their state wholesale.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    async fn cluster(&self) -> Result<ClusterInfo>;
    async fn tables(&self) -> Result<Vec<TableInfo>>;
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// In-memory topology for standalone deployments and tests
pub struct InMemoryTopology {
    cluster: RwLock<ClusterInfo>,
    tables: RwLock<Vec<TableInfo>>,
    epoch: watch::Sender<u64>,
}

impl InMemoryTopology {
    pub fn new(cluster: ClusterInfo) -> Self {
        Self::with_tables(cluster, Vec::new())
    }

    pub fn with_tables(cluster: ClusterInfo, tables: Vec<TableInfo>) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            cluster: RwLock::new(cluster),
            tables: RwLock::new(tables),
            epoch,
        }
    }

    /// Replace the cluster description and notify subscribers.
    pub fn set_cluster(&self, cluster: ClusterInfo) {
        *self.cluster.write() = cluster;
        self.epoch.send_modify(|e| *e += 1);
    }

    /// Replace the table catalog and notify subscribers.
    pub fn set_tables(&self, tables: Vec<TableInfo>) {
        *self.tables.write() = tables;
        self.epoch.send_modify(|e| *e += 1);
    }
}

#[async_trait]
impl TopologyProvider for InMemoryTopology {
    async fn cluster(&self) -> Result<ClusterInfo> {
        Ok(self.cluster.read().clone())
    }

    async fn tables(&self) -> Result<Vec<TableInfo>> {
        Ok(self.tables.read().clone())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }
}
