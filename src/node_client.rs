//! HTTP client for the storage-node control surface
//!
//! Nodes expose `GET /shard/list` (replica roster), `GET /server/status`
//! (per-shard counters and overall availability) and `POST /shard/unavailable`
//! (replaces the node's disabled-shard list). Every request carries its own
//! deadline so a hung node cannot pin a poll task past its tick.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const AVAILABLE: &str = "available";
pub const UNAVAILABLE: &str = "unavailable";
pub const LEADER: &str = "leader";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Replication position of one partition replica
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DbInfo {
    #[serde(default)]
    pub replicate_lag: i64,
    #[serde(default)]
    pub seq_no: u64,
}

/// One partition replica as reported by `/shard/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartitionInfo {
    #[serde(default)]
    pub db_info: DbInfo,
    #[serde(default)]
    pub delta_versions: Vec<String>,
    pub partition_id: u32,
    #[serde(default)]
    pub hash: i64,
    pub database_name: String,
    pub table_name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub base_version: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub read_kps: u64,
    #[serde(default)]
    pub write_kps: u64,
    #[serde(default)]
    pub read_bytes: u64,
    #[serde(default)]
    pub write_bytes: u64,
}

/// One shard replica as reported by `/shard/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardListEntry {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub role: String,
    pub shard_id: u32,
    #[serde(default)]
    pub partitions: Vec<PartitionInfo>,
}

/// Envelope of `/shard/list`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShardListResponse {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Vec<ShardListEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceBase {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u32,
    #[serde(default)]
    pub service_status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatValue {
    #[serde(default)]
    pub value: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShardSection {
    #[serde(default)]
    pub stat: HashMap<String, StatValue>,
}

/// The subset of `/server/status` the control plane consumes
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerStatusResponse {
    #[serde(default)]
    pub service_base: ServiceBase,
    #[serde(default)]
    pub shard: ShardSection,
}

/// Node control-surface client
#[derive(Clone)]
pub struct NodeClient {
    http: reqwest::Client,
}

impl NodeClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self { http })
    }

    /// Pull the replica roster from a node.
    pub async fn shard_list(&self, address: &str) -> Result<ShardListResponse> {
        let url = format!("http://{}/shard/list", address);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::UnexpectedStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    /// Pull counters and availability from a node.
    pub async fn server_status(&self, address: &str) -> Result<ServerStatusResponse> {
        let url = format!("http://{}/server/status", address);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::UnexpectedStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    /// Replace a node's disabled-shard list.
    pub async fn set_unavailable_shards(&self, address: &str, shard_ids: &[u32]) -> Result<()> {
        let url = format!("http://{}/shard/unavailable", address);
        let response = self.http.post(&url).json(&shard_ids).send().await?;
        if !response.status().is_success() {
            return Err(Error::UnexpectedStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}
