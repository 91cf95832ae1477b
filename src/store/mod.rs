//! Versioned topology snapshot persistence
//!
//! Every computed topology is persisted as a row of the `shard_stores` table:
//! the serialized snapshot plus a version key and an Active/Default flag. At
//! most one row per service is Active at any time; both mutating operations
//! perform their flips inside a single transaction so a failure leaves the
//! previous Active row authoritative.

mod memory;
mod redb_store;

pub use memory::MemoryVersionStore;
pub use redb_store::RedbVersionStore;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a stored version is the applied one or a superseded one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionStatus {
    Active,
    Default,
}

/// One persisted topology version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStoreRecord {
    pub id: u64,
    pub service_name: String,
    pub version: String,
    /// Serialized `ShardVersionData` JSON
    pub data: String,
    pub status: VersionStatus,
    pub created_at: DateTime<Utc>,
}

/// A version about to be persisted; the store assigns the row id
#[derive(Debug, Clone)]
pub struct NewShardStore {
    pub service_name: String,
    pub version: String,
    pub data: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence seam for topology versions
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// The single Active row for a service, if any.
    async fn load_active(&self, service_name: &str) -> Result<Option<ShardStoreRecord>>;

    /// A specific version row.
    async fn get(&self, service_name: &str, version: &str) -> Result<Option<ShardStoreRecord>>;

    /// All rows for a service, oldest first.
    async fn list_versions(&self, service_name: &str) -> Result<Vec<ShardStoreRecord>>;

    /// Persist a new Active version, demoting any current Active row to
    /// Default in the same transaction.
    async fn store_new_active(&self, new: NewShardStore) -> Result<ShardStoreRecord>;

    /// Flip the Active flag from the current active version to `version` in
    /// one transaction. `expected_active` is an optimistic guard: when given,
    /// the store fails if its current Active version differs. Unknown target
    /// versions fail and leave the store untouched.
    async fn exchange_active(
        &self,
        service_name: &str,
        expected_active: Option<&str>,
        version: &str,
    ) -> Result<()>;
}
