//! Runtime shard metrics collection
//!
//! A background ticker polls every node's replica roster and counters and
//! publishes an immutable snapshot. Writers build a fresh snapshot and swap a
//! shared pointer; readers clone the `Arc` and never observe a partial tick.
//! A node that fails to report keeps its previous entry; per-node failures
//! degrade freshness but never abort a tick.

use crate::cluster::{NodeInfo, ShardRole, TopologyProvider};
use crate::hashing;
use crate::node_client::{
    NodeClient, PartitionInfo, ServerStatusResponse, ShardListResponse, AVAILABLE, LEADER,
};
use crate::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Tick-wide budget for draining poll results
const SYNC_RESULT_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_METRICS_TTL_MS: u64 = 5000;

/// Counters tracked per shard replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricName {
    WriteKpsMin1,
    ReadKpsMin1,
    WriteBytesMin1,
    ReadBytesMin1,
    LiveSstFilesSize,
}

impl MetricName {
    pub const ALL: [MetricName; 5] = [
        MetricName::WriteKpsMin1,
        MetricName::ReadKpsMin1,
        MetricName::WriteBytesMin1,
        MetricName::ReadBytesMin1,
        MetricName::LiveSstFilesSize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::WriteKpsMin1 => "write_kps_min_1",
            MetricName::ReadKpsMin1 => "read_kps_min_1",
            MetricName::WriteBytesMin1 => "write_bytes_min_1",
            MetricName::ReadBytesMin1 => "read_bytes_min_1",
            MetricName::LiveSstFilesSize => "live-sst-files-size",
        }
    }
}

impl FromStr for MetricName {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        MetricName::ALL
            .iter()
            .find(|m| m.as_str() == value)
            .copied()
            .ok_or_else(|| format!("unknown metric '{}'", value))
    }
}

impl Serialize for MetricName {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MetricName {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Availability of one shard replica as the node reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardServiceState {
    Available,
    Unavailable,
}

/// Everything observed about one shard replica during a poll cycle
///
/// Replaced wholesale each tick, never merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: u32,
    pub shard_hash: String,
    pub role: ShardRole,
    pub service_state: ShardServiceState,
    /// Sum of per-partition replica sequence numbers
    pub seq_no: u64,
    /// Chained hash over partition base versions; a fingerprint of the
    /// replica's data generation
    pub base_version_hash: u64,
    pub metrics: HashMap<String, f64>,
    pub partitions: Vec<PartitionInfo>,
}

/// Observed node identity and availability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRuntimeInfo {
    pub group_name: String,
    pub node_id: u32,
    pub host: String,
    pub port: u16,
    pub master: Option<bool>,
    pub is_available: bool,
}

#[derive(Debug, Clone, Default)]
struct GroupShardMetrics {
    /// node hash -> node runtime info
    node_info: HashMap<u64, NodeRuntimeInfo>,
    /// node hash -> (shard hash -> shard info)
    node_shard_info: HashMap<u64, HashMap<String, ShardInfo>>,
}

#[derive(Debug, Default)]
struct MetricsSnapshot {
    groups: HashMap<String, GroupShardMetrics>,
}

pub(crate) struct NodePollResult {
    pub(crate) group_name: String,
    pub(crate) node_id: u32,
    pub(crate) info: NodeRuntimeInfo,
    pub(crate) shards: HashMap<String, ShardInfo>,
}

/// Near-real-time snapshot of every node's shard roster and counters
pub struct ShardMetricsManager {
    topology: Arc<dyn TopologyProvider>,
    client: NodeClient,
    snapshot: RwLock<Arc<MetricsSnapshot>>,
    ttl: Duration,
}

impl ShardMetricsManager {
    pub fn new(topology: Arc<dyn TopologyProvider>, ttl_ms: u64) -> Result<Self> {
        Ok(Self {
            topology,
            client: NodeClient::new()?,
            snapshot: RwLock::new(Arc::new(MetricsSnapshot::default())),
            ttl: Duration::from_millis(ttl_ms),
        })
    }

    /// Run the poll loop until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ttl);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(ttl_ms = self.ttl.as_millis() as u64, "shard metrics collector started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_shard_metrics().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shard metrics collector stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One poll cycle: fan out to every node, drain results under the
    /// tick-wide budget, swap the snapshot.
    async fn sync_shard_metrics(&self) {
        let cluster = match self.topology.cluster().await {
            Ok(cluster) => cluster,
            Err(e) => {
                error!(error = %e, "failed to list topology for metrics poll");
                return;
            }
        };
        let node_total: usize = cluster.groups.iter().map(|g| g.nodes.len()).sum();
        if node_total == 0 {
            return;
        }

        let (tx, mut rx) = mpsc::channel(node_total);
        for group in &cluster.groups {
            for node in &group.nodes {
                let tx = tx.clone();
                let client = self.client.clone();
                let group_name = group.name.clone();
                let node = node.clone();
                tokio::spawn(async move {
                    let result = poll_node(&client, &group_name, &node).await;
                    let _ = tx.send(result).await;
                });
            }
        }
        drop(tx);

        let deadline = Instant::now() + SYNC_RESULT_TIMEOUT;
        let mut results = Vec::with_capacity(node_total);
        while results.len() < node_total {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        pending = node_total - results.len(),
                        timeout_secs = SYNC_RESULT_TIMEOUT.as_secs(),
                        "timed out waiting for node poll results"
                    );
                    break;
                }
            }
        }
        self.apply_results(results);
    }

    /// Overwrite per-node entries and publish a fresh snapshot.
    pub(crate) fn apply_results(&self, results: Vec<NodePollResult>) {
        if results.is_empty() {
            return;
        }
        let mut groups = self.snapshot.read().groups.clone();
        for result in results {
            let node_hash = hashing::node_hash(&result.group_name, result.node_id);
            let group = groups.entry(result.group_name).or_default();
            group.node_info.insert(node_hash, result.info);
            group.node_shard_info.insert(node_hash, result.shards);
        }
        *self.snapshot.write() = Arc::new(MetricsSnapshot { groups });
    }

    /// Overall availability of a node as of the last poll.
    pub fn is_node_available(&self, group_name: &str, node_id: u32) -> bool {
        let node_hash = hashing::node_hash(group_name, node_id);
        let snapshot = self.snapshot.read().clone();
        snapshot
            .groups
            .get(group_name)
            .and_then(|g| g.node_info.get(&node_hash))
            .map(|info| info.is_available)
            .unwrap_or(false)
    }

    /// Sum of one metric across all shards of a node.
    pub fn node_metric_value(&self, group_name: &str, node_id: u32, metric: MetricName) -> f64 {
        let node_hash = hashing::node_hash(group_name, node_id);
        let snapshot = self.snapshot.read().clone();
        let Some(shards) = snapshot
            .groups
            .get(group_name)
            .and_then(|g| g.node_shard_info.get(&node_hash))
        else {
            return 0.0;
        };
        shards
            .values()
            .filter_map(|s| s.metrics.get(metric.as_str()))
            .sum()
    }

    /// Runtime info and an owned copy of the shard map of one node.
    pub fn node_shard_info(
        &self,
        group_name: &str,
        node_id: u32,
    ) -> (Option<NodeRuntimeInfo>, HashMap<String, ShardInfo>) {
        let node_hash = hashing::node_hash(group_name, node_id);
        let snapshot = self.snapshot.read().clone();
        let Some(group) = snapshot.groups.get(group_name) else {
            return (None, HashMap::new());
        };
        let info = group.node_info.get(&node_hash).cloned();
        let shards = group
            .node_shard_info
            .get(&node_hash)
            .cloned()
            .unwrap_or_default();
        (info, shards)
    }

    /// Replicas of a given role for a shard id across the whole fleet.
    pub fn replica_count(&self, shard_id: u32, role: ShardRole) -> u32 {
        let snapshot = self.snapshot.read().clone();
        let mut count = 0;
        for group in snapshot.groups.values() {
            for shards in group.node_shard_info.values() {
                for shard in shards.values() {
                    if shard.shard_id == shard_id && shard.role == role {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Like [`replica_count`](Self::replica_count), restricted to replicas
    /// currently reporting Available. The drain replica floor is checked
    /// against this count.
    pub fn healthy_replica_count(&self, shard_id: u32, role: ShardRole) -> u32 {
        let snapshot = self.snapshot.read().clone();
        let mut count = 0;
        for group in snapshot.groups.values() {
            for shards in group.node_shard_info.values() {
                for shard in shards.values() {
                    if shard.shard_id == shard_id
                        && shard.role == role
                        && shard.service_state == ShardServiceState::Available
                    {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Shard count for a data center: the per-DC override when set, the
    /// cluster total otherwise.
    pub async fn shard_num(&self, dc: &str) -> Result<u32> {
        let cluster = self.topology.cluster().await?;
        let number = cluster
            .dcs
            .iter()
            .find(|d| d.name == dc)
            .map(|d| d.shard_number)
            .unwrap_or(0);
        if number != 0 {
            Ok(number)
        } else {
            Ok(cluster.shard_total)
        }
    }

    /// Distinct shard ids a table's partitions map onto.
    pub async fn table_shard_list(&self, database_name: &str, table_name: &str) -> Result<Vec<u32>> {
        let (partition_number, dc) = self.partition_num_and_dc(database_name, table_name).await?;
        let shard_number = self.shard_num(&dc).await?;
        if shard_number == 0 {
            return Ok(Vec::new());
        }
        let mut shard_list = Vec::new();
        for partition_id in 0..partition_number {
            let shard_id =
                hashing::shard_id_for_partition(database_name, table_name, partition_id, shard_number);
            if !shard_list.contains(&shard_id) {
                shard_list.push(shard_id);
            }
        }
        Ok(shard_list)
    }

    /// Per-shard size (leader replicas only) and read KPS (all replicas) for
    /// one table.
    pub async fn table_shard_size_and_kps(
        &self,
        database_name: &str,
        table_name: &str,
    ) -> Result<(HashMap<u32, u64>, HashMap<u32, u64>)> {
        let shard_list = self.table_shard_list(database_name, table_name).await?;
        let snapshot = self.snapshot.read().clone();

        let mut shard_size: HashMap<u32, u64> = HashMap::new();
        let mut shard_kps: HashMap<u32, u64> = HashMap::new();
        for group in snapshot.groups.values() {
            for (node_hash, shards) in &group.node_shard_info {
                for shard_id in &shard_list {
                    let shard_hash = hashing::shard_hash(*node_hash, *shard_id);
                    let Some(shard) = shards.get(&shard_hash) else {
                        continue;
                    };
                    for partition in &shard.partitions {
                        if partition.database_name != database_name
                            || partition.table_name != table_name
                        {
                            continue;
                        }
                        if partition.role == LEADER {
                            *shard_size.entry(*shard_id).or_default() += partition.size;
                        }
                        *shard_kps.entry(*shard_id).or_default() += partition.read_kps;
                    }
                }
            }
        }
        Ok((shard_size, shard_kps))
    }

    async fn partition_num_and_dc(
        &self,
        database_name: &str,
        table_name: &str,
    ) -> Result<(u32, String)> {
        let tables = self.topology.tables().await?;
        for table in tables {
            if table.database_name == database_name && table.table_name == table_name {
                return Ok((table.partition_number, table.dc));
            }
        }
        Ok((0, String::new()))
    }
}

async fn poll_node(client: &NodeClient, group_name: &str, node: &NodeInfo) -> NodePollResult {
    let address = node.address();
    let node_hash = hashing::node_hash(group_name, node.node_id);
    let mut info = NodeRuntimeInfo {
        group_name: group_name.to_string(),
        node_id: node.node_id,
        host: node.host.clone(),
        port: node.port,
        master: Some(node.master),
        is_available: false,
    };

    debug!(%address, "pulling shard list");
    let roster = match client.shard_list(&address).await {
        Ok(response) => build_shard_roster(node_hash, response),
        Err(e) => {
            error!(%address, error = %e, "failed to pull shard list");
            HashMap::new()
        }
    };

    debug!(%address, "pulling server status");
    let shards = match client.server_status(&address).await {
        Ok(status) => {
            let (available, shards) = merge_server_status(node.node_id, roster, &status);
            info.is_available = available;
            shards
        }
        Err(e) => {
            error!(%address, error = %e, "failed to pull server status");
            HashMap::new()
        }
    };

    NodePollResult {
        group_name: group_name.to_string(),
        node_id: node.node_id,
        info,
        shards,
    }
}

/// Build the per-shard view from a `/shard/list` payload: availability, role,
/// summed sequence number and the chained data-generation fingerprint.
pub(crate) fn build_shard_roster(
    node_hash: u64,
    response: ShardListResponse,
) -> HashMap<String, ShardInfo> {
    let mut roster = HashMap::with_capacity(response.data.len());
    for mut entry in response.data {
        let service_state = if entry.status == AVAILABLE {
            ShardServiceState::Available
        } else {
            ShardServiceState::Unavailable
        };
        let role = if entry.role == LEADER {
            ShardRole::Leader
        } else {
            ShardRole::Follower
        };

        // Replica-rank order must be stable for the fingerprint to be
        // comparable across nodes.
        entry.partitions.sort_by(|a, b| b.hash.cmp(&a.hash));
        let mut base_version_hash = 0u64;
        let mut seq_no = 0u64;
        for partition in &entry.partitions {
            base_version_hash = hashing::chain(base_version_hash, partition.base_version.as_bytes());
            seq_no = seq_no.saturating_add(partition.db_info.seq_no);
        }

        let shard_hash = hashing::shard_hash(node_hash, entry.shard_id);
        roster.insert(
            shard_hash.clone(),
            ShardInfo {
                shard_id: entry.shard_id,
                shard_hash,
                role,
                service_state,
                seq_no,
                base_version_hash,
                metrics: HashMap::new(),
                partitions: entry.partitions,
            },
        );
    }
    roster
}

/// Attach `/server/status` counters to the roster and extract the node's
/// availability. Zero-valued counters are omitted.
pub(crate) fn merge_server_status(
    node_id: u32,
    roster: HashMap<String, ShardInfo>,
    status: &ServerStatusResponse,
) -> (bool, HashMap<String, ShardInfo>) {
    let is_available = status.service_base.service_status == AVAILABLE;
    let mut shards = HashMap::with_capacity(roster.len());
    for (shard_hash, mut shard) in roster {
        let mut metrics = HashMap::new();
        for metric in MetricName::ALL {
            let key = metric_key(node_id, metric.as_str(), shard.shard_id);
            if let Some(stat) = status.shard.stat.get(&key) {
                if stat.value != 0.0 {
                    metrics.insert(metric.as_str().to_string(), stat.value);
                }
            }
        }
        shard.metrics = metrics;
        shards.insert(shard_hash, shard);
    }
    (is_available, shards)
}

/// Key format of the per-shard counters in `/server/status`.
pub fn metric_key(node_id: u32, metric: &str, shard_id: u32) -> String {
    format!(
        "property=rocksdb.{},shard_id={},node_id={}",
        metric, shard_id, node_id
    )
}
