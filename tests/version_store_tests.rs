//! Integration tests for the version store backends
//!
//! Both backends must uphold the same contract: at most one Active row per
//! service after any sequence of store/exchange operations, transactional
//! flips, and hard errors on unknown targets or stale expectations.

use chrono::Utc;
use laser_control::store::{
    MemoryVersionStore, NewShardStore, RedbVersionStore, VersionStatus, VersionStore,
};
use laser_control::Error;
use std::sync::Arc;

const SERVICE: &str = "laser_test";

fn new_version(version: &str, data: &str) -> NewShardStore {
    NewShardStore {
        service_name: SERVICE.to_string(),
        version: version.to_string(),
        data: data.to_string(),
        created_at: Utc::now(),
    }
}

async fn active_versions(store: &dyn VersionStore) -> Vec<String> {
    store
        .list_versions(SERVICE)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.status == VersionStatus::Active)
        .map(|r| r.version)
        .collect()
}

async fn check_at_most_one_active(store: Arc<dyn VersionStore>) {
    assert!(store.load_active(SERVICE).await.unwrap().is_none());

    store.store_new_active(new_version("V1", "{}")).await.unwrap();
    assert_eq!(active_versions(store.as_ref()).await, vec!["V1"]);

    store.store_new_active(new_version("V2", "{}")).await.unwrap();
    assert_eq!(active_versions(store.as_ref()).await, vec!["V2"]);

    store.store_new_active(new_version("V3", "{}")).await.unwrap();
    store
        .exchange_active(SERVICE, Some("V3"), "V1")
        .await
        .unwrap();
    assert_eq!(active_versions(store.as_ref()).await, vec!["V1"]);

    store
        .exchange_active(SERVICE, Some("V1"), "V2")
        .await
        .unwrap();
    assert_eq!(active_versions(store.as_ref()).await, vec!["V2"]);

    assert_eq!(store.list_versions(SERVICE).await.unwrap().len(), 3);
}

async fn check_exchange_flips_and_loads(store: Arc<dyn VersionStore>) {
    store
        .store_new_active(new_version("V1", r#"{"origin":"v1"}"#))
        .await
        .unwrap();
    store
        .store_new_active(new_version("V2", r#"{"origin":"v2"}"#))
        .await
        .unwrap();

    store
        .exchange_active(SERVICE, Some("V2"), "V1")
        .await
        .unwrap();

    let v1 = store.get(SERVICE, "V1").await.unwrap().unwrap();
    let v2 = store.get(SERVICE, "V2").await.unwrap().unwrap();
    assert_eq!(v1.status, VersionStatus::Active);
    assert_eq!(v2.status, VersionStatus::Default);

    let active = store.load_active(SERVICE).await.unwrap().unwrap();
    assert_eq!(active.version, "V1");
    assert_eq!(active.data, r#"{"origin":"v1"}"#);
}

async fn check_exchange_failures_leave_state_intact(store: Arc<dyn VersionStore>) {
    store.store_new_active(new_version("V1", "{}")).await.unwrap();

    let err = store
        .exchange_active(SERVICE, Some("V1"), "missing")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownVersion(_)));
    assert_eq!(active_versions(store.as_ref()).await, vec!["V1"]);

    store.store_new_active(new_version("V2", "{}")).await.unwrap();
    let err = store
        .exchange_active(SERVICE, Some("V1"), "V2")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ActiveVersionConflict { .. }));
    assert_eq!(active_versions(store.as_ref()).await, vec!["V2"]);
}

async fn check_services_are_isolated(store: Arc<dyn VersionStore>) {
    store.store_new_active(new_version("V1", "{}")).await.unwrap();
    store
        .store_new_active(NewShardStore {
            service_name: "laser_other".to_string(),
            version: "W1".to_string(),
            data: "{}".to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    // Demotion only touches the storing service's rows.
    store.store_new_active(new_version("V2", "{}")).await.unwrap();
    let other = store.load_active("laser_other").await.unwrap().unwrap();
    assert_eq!(other.version, "W1");
    assert_eq!(active_versions(store.as_ref()).await, vec!["V2"]);
}

#[tokio::test]
async fn memory_store_keeps_at_most_one_active() {
    check_at_most_one_active(Arc::new(MemoryVersionStore::new())).await;
}

#[tokio::test]
async fn memory_store_exchange_flips_and_loads() {
    check_exchange_flips_and_loads(Arc::new(MemoryVersionStore::new())).await;
}

#[tokio::test]
async fn memory_store_exchange_failures_leave_state_intact() {
    check_exchange_failures_leave_state_intact(Arc::new(MemoryVersionStore::new())).await;
}

#[tokio::test]
async fn memory_store_isolates_services() {
    check_services_are_isolated(Arc::new(MemoryVersionStore::new())).await;
}

fn redb_store(dir: &tempfile::TempDir) -> Arc<RedbVersionStore> {
    Arc::new(RedbVersionStore::open(dir.path().join("shard_stores.redb")).unwrap())
}

#[tokio::test]
async fn redb_store_keeps_at_most_one_active() {
    let dir = tempfile::tempdir().unwrap();
    check_at_most_one_active(redb_store(&dir)).await;
}

#[tokio::test]
async fn redb_store_exchange_flips_and_loads() {
    let dir = tempfile::tempdir().unwrap();
    check_exchange_flips_and_loads(redb_store(&dir)).await;
}

#[tokio::test]
async fn redb_store_exchange_failures_leave_state_intact() {
    let dir = tempfile::tempdir().unwrap();
    check_exchange_failures_leave_state_intact(redb_store(&dir)).await;
}

#[tokio::test]
async fn redb_store_isolates_services() {
    let dir = tempfile::tempdir().unwrap();
    check_services_are_isolated(redb_store(&dir)).await;
}

#[tokio::test]
async fn redb_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shard_stores.redb");
    {
        let store = RedbVersionStore::open(&path).unwrap();
        store
            .store_new_active(new_version("V1", r#"{"persisted":true}"#))
            .await
            .unwrap();
    }

    let store = RedbVersionStore::open(&path).unwrap();
    let active = store.load_active(SERVICE).await.unwrap().unwrap();
    assert_eq!(active.version, "V1");
    assert_eq!(active.data, r#"{"persisted":true}"#);
    assert_eq!(active.id, 1);
}
