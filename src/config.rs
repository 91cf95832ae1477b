//! Component factory for environment-based configuration
//!
//! Lets deployments switch the version-store backend without code changes.

use crate::store::{MemoryVersionStore, RedbVersionStore, VersionStore};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::info;

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the version store from environment.
    ///
    /// Environment variables:
    /// - STORE_BACKEND: "memory" (default) or "redb"
    /// - STORE_PATH: database file path (required for redb)
    pub fn create_version_store() -> Result<Arc<dyn VersionStore>> {
        let backend = std::env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("using in-memory version store (development mode)");
                Ok(Arc::new(MemoryVersionStore::new()))
            }
            "redb" => {
                let path = std::env::var("STORE_PATH").map_err(|_| {
                    Error::Config("STORE_PATH required when STORE_BACKEND=redb".to_string())
                })?;
                info!(%path, "using redb version store");
                Ok(Arc::new(RedbVersionStore::open(path)?))
            }
            _ => Err(Error::Config(format!(
                "Unknown STORE_BACKEND: {}. Use 'memory' or 'redb'",
                backend
            ))),
        }
    }
}
