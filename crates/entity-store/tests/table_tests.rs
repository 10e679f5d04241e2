//! Table backend integration tests.
//!
//! The contract suite runs twice: against SQLite, which has a native
//! conditional replace, and against the in-memory client, which does not and
//! exercises the per-key lock fallback.

#[macro_use]
mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use helios_entity_store::backends::table::{
    MemoryTableClient, RowStream, TableApi, TableBackend, TableBackendConfig, TableClientError,
    TableRow,
};
use helios_entity_store::core::{CallContext, StoreBackend, StoreCapability};
use helios_entity_store::error::ErrorKind;
use helios_entity_store::types::Revision;

use common::{assert_kind, record};

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;

    use helios_entity_store::types::{EntityId, PartitionKey};

    async fn open_store() -> (Arc<dyn StoreBackend>, ()) {
        let backend = TableBackend::open(TableBackendConfig::new("sqlite::memory:"))
            .await
            .unwrap();
        (Arc::new(backend), ())
    }

    contract_suite!(open_store);

    #[tokio::test]
    async fn test_sqlite_uses_native_conditional_replace() {
        let (store, _) = open_store().await;
        assert!(store.supports(StoreCapability::NativeConditionalWrite));
        assert!(!store.supports(StoreCapability::LockedWrite));
    }

    #[tokio::test]
    async fn test_sqlite_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("sqlite://{}", dir.path().join("entities.db").display());
        let ctx = CallContext::new();

        let created = {
            let store = TableBackend::open(TableBackendConfig::new(&uri)).await.unwrap();
            let created = store.create(&ctx, record(json!({"n": 0}))).await.unwrap();
            let updated = store
                .update(&ctx, created.with_payload(json!({"n": 1})).unwrap())
                .await
                .unwrap();
            store.close().await.unwrap();
            updated
        };

        let store = TableBackend::open(TableBackendConfig::new(&uri)).await.unwrap();
        let fetched = store
            .get(&ctx, created.id(), created.partition_key())
            .await
            .unwrap();
        assert_eq!(fetched.version(), 1);
        assert_eq!(fetched.payload()["n"], 1);
        let log = store
            .revisions(&ctx, created.id(), created.partition_key())
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_custom_table_name() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("sqlite://{}", dir.path().join("shared.db").display());
        let ctx = CallContext::new();
        let orders = TableBackend::open(TableBackendConfig::new(&uri).with_table("orders"))
            .await
            .unwrap();
        let invoices = TableBackend::open(TableBackendConfig::new(&uri).with_table("invoices"))
            .await
            .unwrap();

        let order = orders.create(&ctx, record(json!({"n": 1}))).await.unwrap();
        assert_kind(
            invoices.get(&ctx, order.id(), order.partition_key()).await,
            ErrorKind::NotFound,
        );
        assert_kind(
            orders
                .get(&ctx, &EntityId::new("nope"), &PartitionKey::default())
                .await,
            ErrorKind::NotFound,
        );
    }

    #[tokio::test]
    async fn test_sqlite_many_concurrent_writers() {
        let backend = TableBackend::open(TableBackendConfig::new("sqlite::memory:"))
            .await
            .unwrap();
        let store = Arc::new(backend);
        let ctx = CallContext::new();
        let created = store.create(&ctx, record(json!({"n": 0}))).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..6 {
            let store = store.clone();
            let edit = created.clone().with_payload(json!({"n": i})).unwrap();
            tasks.push(tokio::spawn(async move {
                store.update(&CallContext::new(), edit).await
            }));
        }
        let mut wins = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert_eq!(e.kind(), ErrorKind::ConcurrencyConflict),
            }
        }
        assert_eq!(wins, 1);
    }
}

mod memory_fallback {
    use super::*;

    async fn open_store() -> (Arc<dyn StoreBackend>, ()) {
        let config = TableBackendConfig::new(format!("memory://table-{}", Uuid::new_v4()));
        let backend = TableBackend::open(config).await.unwrap();
        (Arc::new(backend), ())
    }

    contract_suite!(open_store);

    #[tokio::test]
    async fn test_fallback_advertises_locked_write() {
        let (store, _) = open_store().await;
        assert!(store.supports(StoreCapability::LockedWrite));
        assert!(!store.supports(StoreCapability::NativeConditionalWrite));
        assert!(!store.supports(StoreCapability::CrossProcessLocking));
    }

    #[tokio::test]
    async fn test_fallback_writes_unconditionally_under_lock() {
        let name = format!("table-upserts-{}", Uuid::new_v4());
        let client = MemoryTableClient::named(&name);
        let store = TableBackend::with_client(
            TableBackendConfig::new(format!("memory://{}", name)),
            Arc::new(client.clone()),
        );
        let ctx = CallContext::new();
        let mut current = store.create(&ctx, record(json!({"n": 0}))).await.unwrap();
        for n in 1..=3 {
            current = store
                .update(&ctx, current.with_payload(json!({"n": n})).unwrap())
                .await
                .unwrap();
        }
        assert_eq!(client.upsert_count(), 3);
    }
}

/// Memory table whose next write can be made to fail before it lands.
#[derive(Debug)]
struct FailingWrites {
    inner: MemoryTableClient,
    fail_next: AtomicBool,
}

impl FailingWrites {
    fn check(&self) -> Result<(), TableClientError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TableClientError::Unavailable("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TableApi for FailingWrites {
    fn client_name(&self) -> &'static str {
        "failing-writes"
    }

    fn supports_conditional_replace(&self) -> bool {
        false
    }

    async fn ping(&self) -> Result<(), TableClientError> {
        self.inner.ping().await
    }

    async fn insert(&self, row: &TableRow, revision: &Revision) -> Result<(), TableClientError> {
        self.check()?;
        self.inner.insert(row, revision).await
    }

    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<TableRow>, TableClientError> {
        self.inner.get(partition_key, row_key).await
    }

    async fn upsert(&self, row: &TableRow, revision: &Revision) -> Result<(), TableClientError> {
        self.check()?;
        self.inner.upsert(row, revision).await
    }

    async fn scan(&self, partition_key: Option<&str>) -> Result<RowStream, TableClientError> {
        self.inner.scan(partition_key).await
    }

    async fn revisions(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Vec<Revision>, TableClientError> {
        self.inner.revisions(partition_key, row_key).await
    }
}

#[tokio::test]
async fn test_failed_write_leaves_row_and_trail_in_step() {
    let name = format!("table-failing-{}", Uuid::new_v4());
    let client = Arc::new(FailingWrites {
        inner: MemoryTableClient::named(&name),
        fail_next: AtomicBool::new(false),
    });
    let store = TableBackend::with_client(
        TableBackendConfig::new(format!("memory://{}", name)),
        client.clone(),
    );
    let ctx = CallContext::new();
    let created = store.create(&ctx, record(json!({"n": 0}))).await.unwrap();

    client.fail_next.store(true, Ordering::SeqCst);
    assert_kind(
        store
            .update(&ctx, created.clone().with_payload(json!({"n": 1})).unwrap())
            .await,
        ErrorKind::Unavailable,
    );
    let stored = store
        .get(&ctx, created.id(), created.partition_key())
        .await
        .unwrap();
    assert_eq!(stored.version(), 0);

    let first = store
        .update(&ctx, stored.with_payload(json!({"n": 1})).unwrap())
        .await
        .unwrap();
    store
        .update(&ctx, first.with_payload(json!({"n": 2})).unwrap())
        .await
        .unwrap();
    let log = store
        .revisions(&ctx, created.id(), created.partition_key())
        .await
        .unwrap();
    let versions: Vec<u64> = log.entries().iter().map(|r| r.version).collect();
    assert_eq!(versions, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_unknown_scheme_is_configuration_error() {
    assert_kind(
        TableBackend::open(TableBackendConfig::new("redis://localhost")).await,
        ErrorKind::Configuration,
    );
}
