//! In-memory version store for development and testing

use super::{NewShardStore, ShardStoreRecord, VersionStatus, VersionStore};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

/// In-memory version store
///
/// Holds rows in insertion order under one lock; every mutating call applies
/// its flips atomically, matching the transactional contract of the durable
/// backend.
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    rows: RwLock<Vec<ShardStoreRecord>>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn load_active(&self, service_name: &str) -> Result<Option<ShardStoreRecord>> {
        Ok(self
            .rows
            .read()
            .iter()
            .find(|r| r.service_name == service_name && r.status == VersionStatus::Active)
            .cloned())
    }

    async fn get(&self, service_name: &str, version: &str) -> Result<Option<ShardStoreRecord>> {
        Ok(self
            .rows
            .read()
            .iter()
            .find(|r| r.service_name == service_name && r.version == version)
            .cloned())
    }

    async fn list_versions(&self, service_name: &str) -> Result<Vec<ShardStoreRecord>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|r| r.service_name == service_name)
            .cloned()
            .collect())
    }

    async fn store_new_active(&self, new: NewShardStore) -> Result<ShardStoreRecord> {
        let mut rows = self.rows.write();
        for row in rows.iter_mut() {
            if row.service_name == new.service_name && row.status == VersionStatus::Active {
                row.status = VersionStatus::Default;
            }
        }
        let record = ShardStoreRecord {
            id: rows.len() as u64 + 1,
            service_name: new.service_name,
            version: new.version,
            data: new.data,
            status: VersionStatus::Active,
            created_at: new.created_at,
        };
        rows.push(record.clone());
        Ok(record)
    }

    async fn exchange_active(
        &self,
        service_name: &str,
        expected_active: Option<&str>,
        version: &str,
    ) -> Result<()> {
        let mut rows = self.rows.write();

        let current_active = rows
            .iter()
            .find(|r| r.service_name == service_name && r.status == VersionStatus::Active)
            .map(|r| r.version.clone());
        if let Some(expected) = expected_active {
            if current_active.as_deref() != Some(expected) {
                return Err(Error::ActiveVersionConflict {
                    expected: expected.to_string(),
                    actual: current_active.unwrap_or_default(),
                });
            }
        }

        if !rows
            .iter()
            .any(|r| r.service_name == service_name && r.version == version)
        {
            return Err(Error::UnknownVersion(version.to_string()));
        }

        for row in rows.iter_mut() {
            if row.service_name != service_name {
                continue;
            }
            if row.status == VersionStatus::Active {
                row.status = VersionStatus::Default;
            }
            if row.version == version {
                row.status = VersionStatus::Active;
            }
        }
        Ok(())
    }
}
