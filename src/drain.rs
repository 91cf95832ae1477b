//! Capacity drain: disabling follower shards toward a retention target
//!
//! Given a group, a retention rate and a metric, picks follower shards to
//! mark Unavailable on each non-master host so the host's remaining capacity
//! for that metric approaches rate * (cluster_total / host_count). Leaders
//! are never candidates and no selection may drive a shard's healthy-follower
//! count below one. Application failures are logged, not retried and not
//! rolled back.

use crate::cluster::{ShardRole, TopologyProvider};
use crate::metrics::{MetricName, ShardInfo, ShardMetricsManager};
use crate::node_client::NodeClient;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Drain request for one group
#[derive(Debug, Clone, Deserialize)]
pub struct DrainRequest {
    pub group_name: String,
    /// Percent of the current total to retain, 0..=100
    pub keep_rate: u32,
    pub metric: MetricName,
}

/// One selected shard and the metric value it drains
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DrainSelection {
    pub shard_id: u32,
    pub reduce_num: f64,
}

/// Shards selected on one host
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DrainReport {
    pub address: String,
    pub metrics: Vec<DrainSelection>,
}

/// The computed selection, per host address
pub struct DrainPlan {
    hosts: HashMap<String, HashMap<String, ShardInfo>>,
}

impl DrainPlan {
    pub fn is_empty(&self) -> bool {
        self.hosts.values().all(|shards| shards.is_empty())
    }

    pub fn reports(&self, metric: MetricName) -> Vec<DrainReport> {
        let mut reports = Vec::with_capacity(self.hosts.len());
        for (address, shards) in &self.hosts {
            let metrics = shards
                .values()
                .map(|shard| DrainSelection {
                    shard_id: shard.shard_id,
                    reduce_num: shard.metrics.get(metric.as_str()).copied().unwrap_or(0.0),
                })
                .collect();
            reports.push(DrainReport {
                address: address.clone(),
                metrics,
            });
        }
        reports
    }
}

/// Selects and disables follower shards toward a capacity target
pub struct DrainController {
    topology: Arc<dyn TopologyProvider>,
    metrics: Arc<ShardMetricsManager>,
    client: NodeClient,
}

impl DrainController {
    pub fn new(
        topology: Arc<dyn TopologyProvider>,
        metrics: Arc<ShardMetricsManager>,
    ) -> Result<Self> {
        Ok(Self {
            topology,
            metrics,
            client: NodeClient::new()?,
        })
    }

    /// Compute and apply a drain, returning what was selected per host.
    pub async fn reduce_metrics(&self, request: &DrainRequest) -> Result<Vec<DrainReport>> {
        let plan = self.plan(request).await?;
        self.apply(&plan).await;
        Ok(plan.reports(request.metric))
    }

    /// Dry-run: compute the selection without touching any node.
    pub async fn plan(&self, request: &DrainRequest) -> Result<DrainPlan> {
        if request.keep_rate >= 100 {
            return Ok(DrainPlan {
                hosts: HashMap::new(),
            });
        }
        let keep_rate = f64::from(request.keep_rate) / 100.0;
        let metric = request.metric.as_str();

        let hosts = self.eligible_hosts(&request.group_name).await?;
        if hosts.is_empty() {
            return Ok(DrainPlan {
                hosts: HashMap::new(),
            });
        }

        let total_value: f64 = hosts
            .values()
            .flat_map(|shards| shards.values())
            .filter_map(|shard| shard.metrics.get(metric))
            .sum();
        let target_per_host = total_value * keep_rate / hosts.len() as f64;
        info!(
            group = %request.group_name,
            metric,
            keep_rate,
            total_value,
            target_per_host,
            "planning capacity drain"
        );

        let mut selected_counts: HashMap<u32, u32> = HashMap::new();
        let mut plan = HashMap::with_capacity(hosts.len());
        for (address, shards) in hosts {
            let host_value: f64 = shards
                .values()
                .filter_map(|shard| shard.metrics.get(metric))
                .sum();
            let mut remaining = host_value - target_per_host;
            if remaining < 0.0 {
                debug!(%address, host_value, "host already below target, skipping");
                continue;
            }

            let mut candidates: Vec<&ShardInfo> = shards.values().collect();
            candidates.sort_by(|a, b| {
                let va = a.metrics.get(metric).copied().unwrap_or(0.0);
                let vb = b.metrics.get(metric).copied().unwrap_or(0.0);
                va.partial_cmp(&vb).unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut selections: HashMap<String, ShardInfo> = HashMap::new();
            for shard in candidates {
                if remaining <= 0.0 {
                    break;
                }
                let value = shard.metrics.get(metric).copied().unwrap_or(0.0);
                if value <= 0.0 {
                    continue;
                }
                if value >= remaining {
                    // Candidates are ascending; nothing further fits either.
                    break;
                }
                if !self.can_disable(shard.shard_id, &selected_counts) {
                    debug!(
                        shard_id = shard.shard_id,
                        "skipping shard, disabling would breach the replica floor"
                    );
                    continue;
                }
                *selected_counts.entry(shard.shard_id).or_default() += 1;
                remaining -= value;
                selections.insert(shard.shard_hash.clone(), shard.clone());
            }
            plan.insert(address, selections);
        }
        Ok(DrainPlan { hosts: plan })
    }

    /// Leaders are never disabled, and a shard id must keep more than one
    /// healthy follower after everything selected so far in this pass.
    fn can_disable(&self, shard_id: u32, selected_counts: &HashMap<u32, u32>) -> bool {
        let healthy = self
            .metrics
            .healthy_replica_count(shard_id, ShardRole::Follower);
        let already_selected = selected_counts.get(&shard_id).copied().unwrap_or(0);
        healthy.saturating_sub(already_selected) > 1
    }

    /// Shard maps of the group's non-master hosts, leader replicas removed.
    async fn eligible_hosts(
        &self,
        group_name: &str,
    ) -> Result<HashMap<String, HashMap<String, ShardInfo>>> {
        let cluster = self.topology.cluster().await?;
        let group = cluster
            .groups
            .iter()
            .find(|g| g.name == group_name)
            .ok_or_else(|| Error::GroupNotFound(group_name.to_string()))?;

        let mut hosts = HashMap::new();
        for node in &group.nodes {
            let (info, shard_map) = self.metrics.node_shard_info(group_name, node.node_id);
            let Some(info) = info else {
                continue;
            };
            if info.master.unwrap_or(false) {
                debug!(host = %info.host, "master node is not a drain candidate");
                continue;
            }
            let followers: HashMap<String, ShardInfo> = shard_map
                .into_iter()
                .filter(|(_, shard)| shard.role != ShardRole::Leader)
                .collect();
            hosts.insert(format!("{}:{}", info.host, info.port), followers);
        }
        Ok(hosts)
    }

    /// Push the selection to every affected host: clear the prior disabled
    /// list, then install the new one.
    async fn apply(&self, plan: &DrainPlan) {
        for (address, shards) in &plan.hosts {
            if let Err(e) = self.client.set_unavailable_shards(address, &[]).await {
                error!(%address, error = %e, "failed to clear disabled-shard list");
            }
            if shards.is_empty() {
                continue;
            }
            let shard_ids: Vec<u32> = shards.values().map(|s| s.shard_id).collect();
            match self.client.set_unavailable_shards(address, &shard_ids).await {
                Ok(()) => info!(%address, count = shard_ids.len(), "disabled shards for drain"),
                Err(e) => error!(%address, error = %e, "failed to disable shards"),
            }
        }
    }
}
