//! Redb-backed version store
//!
//! Rows live in a single `shard_stores` table keyed by (service_name,
//! version); values are JSON-encoded records. Both mutating operations run
//! inside one write transaction, so the demote/insert (or demote/promote)
//! pair either fully commits or leaves the previous state intact.

use super::{NewShardStore, ShardStoreRecord, VersionStatus, VersionStore};
use crate::{Error, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;

const SHARD_STORES: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("shard_stores");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_ID_KEY: &str = "next_id";

/// Durable version store backed by an embedded redb database
pub struct RedbVersionStore {
    db: Database,
}

impl RedbVersionStore {
    /// Open (or create) the database at `path` and ensure tables exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(SHARD_STORES)?;
            txn.open_table(META)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    fn rows_for_service(&self, service_name: &str) -> Result<Vec<ShardStoreRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SHARD_STORES)?;
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let (service, _version) = key.value();
            if service != service_name {
                continue;
            }
            rows.push(decode(value.value())?);
        }
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }
}

fn decode(bytes: &[u8]) -> Result<ShardStoreRecord> {
    Ok(serde_json::from_slice(bytes)?)
}

#[async_trait]
impl VersionStore for RedbVersionStore {
    async fn load_active(&self, service_name: &str) -> Result<Option<ShardStoreRecord>> {
        Ok(self
            .rows_for_service(service_name)?
            .into_iter()
            .find(|r| r.status == VersionStatus::Active))
    }

    async fn get(&self, service_name: &str, version: &str) -> Result<Option<ShardStoreRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SHARD_STORES)?;
        match table.get((service_name, version))? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    async fn list_versions(&self, service_name: &str) -> Result<Vec<ShardStoreRecord>> {
        self.rows_for_service(service_name)
    }

    async fn store_new_active(&self, new: NewShardStore) -> Result<ShardStoreRecord> {
        let txn = self.db.begin_write()?;
        let record;
        {
            let mut table = txn.open_table(SHARD_STORES)?;

            let mut demoted = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let (service, _version) = key.value();
                if service != new.service_name {
                    continue;
                }
                let row = decode(value.value())?;
                if row.status == VersionStatus::Active {
                    demoted.push(row);
                }
            }
            for mut row in demoted {
                row.status = VersionStatus::Default;
                let encoded = serde_json::to_vec(&row)?;
                table.insert((row.service_name.as_str(), row.version.as_str()), encoded.as_slice())?;
            }

            let mut meta = txn.open_table(META)?;
            let next_id = meta.get(NEXT_ID_KEY)?.map(|g| g.value()).unwrap_or(0) + 1;
            meta.insert(NEXT_ID_KEY, next_id)?;

            record = ShardStoreRecord {
                id: next_id,
                service_name: new.service_name,
                version: new.version,
                data: new.data,
                status: VersionStatus::Active,
                created_at: new.created_at,
            };
            let encoded = serde_json::to_vec(&record)?;
            table.insert(
                (record.service_name.as_str(), record.version.as_str()),
                encoded.as_slice(),
            )?;
        }
        txn.commit()?;
        Ok(record)
    }

    async fn exchange_active(
        &self,
        service_name: &str,
        expected_active: Option<&str>,
        version: &str,
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SHARD_STORES)?;

            let mut active_rows = Vec::new();
            let mut target: Option<ShardStoreRecord> = None;
            for entry in table.iter()? {
                let (key, value) = entry?;
                let (service, row_version) = key.value();
                if service != service_name {
                    continue;
                }
                let row = decode(value.value())?;
                if row.status == VersionStatus::Active {
                    active_rows.push(row.clone());
                }
                if row_version == version {
                    target = Some(row);
                }
            }

            if let Some(expected) = expected_active {
                let actual = active_rows.first().map(|r| r.version.clone());
                if actual.as_deref() != Some(expected) {
                    return Err(Error::ActiveVersionConflict {
                        expected: expected.to_string(),
                        actual: actual.unwrap_or_default(),
                    });
                }
            }
            let mut target = target.ok_or_else(|| Error::UnknownVersion(version.to_string()))?;

            for mut row in active_rows {
                if row.version == version {
                    continue;
                }
                row.status = VersionStatus::Default;
                let encoded = serde_json::to_vec(&row)?;
                table.insert((row.service_name.as_str(), row.version.as_str()), encoded.as_slice())?;
            }
            target.status = VersionStatus::Active;
            let encoded = serde_json::to_vec(&target)?;
            table.insert(
                (target.service_name.as_str(), target.version.as_str()),
                encoded.as_slice(),
            )?;
        }
        txn.commit()?;
        Ok(())
    }
}
