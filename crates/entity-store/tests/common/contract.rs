//! Backend-agnostic contract checks.
//!
//! Every function takes a freshly opened, empty store. Instantiate the whole
//! suite for a backend with:
//!
//! ```ignore
//! async fn open_store() -> (Arc<dyn StoreBackend>, impl Sized) { ... }
//! contract_suite!(open_store);
//! ```
//!
//! The second tuple element is kept alive for the duration of the test
//! (a temp directory, for example).

use std::time::Duration;

use serde_json::json;

use helios_entity_store::core::{CallContext, EntityFilter, StoreBackend};
use helios_entity_store::error::{BackendError, ErrorKind, StoreError};
use helios_entity_store::types::{EntityId, OperationKind, PartitionKey};

use super::{assert_kind, collect_query, record, record_at};

/// Generates one `#[tokio::test]` per contract check.
macro_rules! contract_suite {
    ($open:ident) => {
        mod contract_suite {
            use super::$open;

            contract_suite!(@tests $open;
                create_then_get,
                duplicate_create_already_exists,
                sequential_updates_reach_n,
                concurrent_updates_one_wins,
                stale_update_reports_versions,
                stale_delete_keeps_record,
                get_unknown_not_found,
                get_deleted_not_found,
                update_unknown_not_found,
                delete_retires_id,
                revision_scenario,
                revisions_carry_snapshots,
                revisions_unknown_not_found,
                query_filters_and_skips_deleted,
                query_scoped_to_partition,
                rejects_invalid_identity,
                expired_deadline_is_unavailable,
                update_keeps_created_at,
                probe_succeeds,
            );
        }
    };
    (@tests $open:ident; $($name:ident),* $(,)?) => {
        $(
            #[tokio::test]
            async fn $name() {
                let (store, _guard) = $open().await;
                crate::common::contract::$name(store.as_ref()).await;
            }
        )*
    };
}

pub async fn create_then_get(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    let created = store
        .create(&ctx, record(json!({"name": "a"})))
        .await
        .unwrap();
    assert_eq!(created.version(), 0);
    assert_eq!(created.created_at(), created.updated_at());

    let fetched = store
        .get(&ctx, created.id(), created.partition_key())
        .await
        .unwrap();
    assert_eq!(fetched.version(), 0);
    assert_eq!(fetched.created_at(), fetched.updated_at());
    assert_eq!(fetched.payload(), &json!({"name": "a"}));
    assert_eq!(fetched.id(), created.id());
}

pub async fn duplicate_create_already_exists(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    store
        .create(&ctx, record_at("dup-1", "", json!({"n": 1})))
        .await
        .unwrap();
    assert_kind(
        store
            .create(&ctx, record_at("dup-1", "", json!({"n": 2})))
            .await,
        ErrorKind::AlreadyExists,
    );
    let kept = store
        .get(&ctx, &EntityId::new("dup-1"), &PartitionKey::default())
        .await
        .unwrap();
    assert_eq!(kept.payload()["n"], 1);
}

pub async fn sequential_updates_reach_n(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    let mut current = store.create(&ctx, record(json!({"n": 0}))).await.unwrap();
    for n in 1..=5u64 {
        current = store
            .update(&ctx, current.with_payload(json!({"n": n})).unwrap())
            .await
            .unwrap();
        assert_eq!(current.version(), n);
    }
    let log = store
        .revisions(&ctx, current.id(), current.partition_key())
        .await
        .unwrap();
    assert_eq!(log.len(), 6);
    assert_eq!(log.latest().unwrap().version, 5);
}

pub async fn concurrent_updates_one_wins(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    let created = store.create(&ctx, record(json!({"n": 0}))).await.unwrap();
    let left = created.clone().with_payload(json!({"n": "left"})).unwrap();
    let right = created.clone().with_payload(json!({"n": "right"})).unwrap();

    let (a, b) = tokio::join!(store.update(&ctx, left), store.update(&ctx, right));
    let outcomes = [a.map(|r| r.version()), b.map(|r| r.version())];
    let wins = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(wins, 1, "exactly one writer must win: {:?}", outcomes);
    for outcome in &outcomes {
        if let Err(e) = outcome {
            assert_eq!(e.kind(), ErrorKind::ConcurrencyConflict);
        }
    }

    let stored = store
        .get(&ctx, created.id(), created.partition_key())
        .await
        .unwrap();
    assert_eq!(stored.version(), 1);
}

pub async fn stale_update_reports_versions(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    let created = store.create(&ctx, record(json!({"n": 0}))).await.unwrap();
    store
        .update(&ctx, created.clone().with_payload(json!({"n": 1})).unwrap())
        .await
        .unwrap();

    let err = store
        .update(&ctx, created.with_payload(json!({"n": 2})).unwrap())
        .await
        .unwrap_err();
    match err {
        StoreError::ConcurrencyConflict {
            expected, actual, ..
        } => assert_eq!((expected, actual), (0, 1)),
        other => panic!("expected conflict, got {}", other),
    }
}

pub async fn stale_delete_keeps_record(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    let created = store.create(&ctx, record(json!({"n": 0}))).await.unwrap();
    let updated = store
        .update(&ctx, created.clone().with_payload(json!({"n": 1})).unwrap())
        .await
        .unwrap();

    assert_kind(
        store
            .delete(&ctx, created.id(), created.partition_key(), 0)
            .await,
        ErrorKind::ConcurrencyConflict,
    );
    let still = store
        .get(&ctx, created.id(), created.partition_key())
        .await
        .unwrap();
    assert_eq!(still.version(), updated.version());
    assert_eq!(still.payload(), updated.payload());
}

pub async fn get_unknown_not_found(store: &dyn StoreBackend) {
    assert_kind(
        store
            .get(
                &CallContext::new(),
                &EntityId::new("missing"),
                &PartitionKey::default(),
            )
            .await,
        ErrorKind::NotFound,
    );
}

pub async fn get_deleted_not_found(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    let created = store.create(&ctx, record(json!({"n": 0}))).await.unwrap();
    let tombstone = store
        .delete(&ctx, created.id(), created.partition_key(), 0)
        .await
        .unwrap();
    assert!(tombstone.is_deleted());
    assert_eq!(tombstone.version(), 1);
    let log = store
        .revisions(&ctx, created.id(), created.partition_key())
        .await
        .unwrap();
    assert_eq!(log.latest().unwrap().timestamp, tombstone.deleted_at().unwrap());
    assert_kind(
        store.get(&ctx, created.id(), created.partition_key()).await,
        ErrorKind::NotFound,
    );
    // A second delete sees the tombstone, not a live record.
    assert_kind(
        store
            .delete(&ctx, created.id(), created.partition_key(), 1)
            .await,
        ErrorKind::NotFound,
    );
}

pub async fn update_unknown_not_found(store: &dyn StoreBackend) {
    assert_kind(
        store
            .update(&CallContext::new(), record_at("ghost", "", json!({"n": 1})))
            .await,
        ErrorKind::NotFound,
    );
}

pub async fn delete_retires_id(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    store
        .create(&ctx, record_at("retired", "", json!({"n": 0})))
        .await
        .unwrap();
    store
        .delete(&ctx, &EntityId::new("retired"), &PartitionKey::default(), 0)
        .await
        .unwrap();
    assert_kind(
        store
            .create(&ctx, record_at("retired", "", json!({"n": 1})))
            .await,
        ErrorKind::AlreadyExists,
    );
}

/// create {"name":"a"} at v0; update expecting 0 gives v1 and a two-entry
/// log; a second update expecting 0 conflicts and leaves the log alone.
pub async fn revision_scenario(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    let created = store
        .create(&ctx, record(json!({"name": "a"})))
        .await
        .unwrap();
    assert_eq!(created.version(), 0);

    let updated = store
        .update(&ctx, created.clone().with_payload(json!({"name": "b"})).unwrap())
        .await
        .unwrap();
    assert_eq!(updated.version(), 1);
    let log = store
        .revisions(&ctx, created.id(), created.partition_key())
        .await
        .unwrap();
    let versions: Vec<u64> = log.entries().iter().map(|r| r.version).collect();
    assert_eq!(versions, vec![0, 1]);

    assert_kind(
        store
            .update(&ctx, created.with_payload(json!({"name": "c"})).unwrap())
            .await,
        ErrorKind::ConcurrencyConflict,
    );
    let log = store
        .revisions(&ctx, updated.id(), updated.partition_key())
        .await
        .unwrap();
    assert_eq!(log.len(), 2);
}

pub async fn revisions_carry_snapshots(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    let created = store
        .create(&ctx, record(json!({"name": "a", "size": 1})))
        .await
        .unwrap();
    let updated = store
        .update(
            &ctx,
            created.with_payload(json!({"name": "a", "size": 2})).unwrap(),
        )
        .await
        .unwrap();
    store
        .delete(&ctx, updated.id(), updated.partition_key(), 1)
        .await
        .unwrap();

    let log = store
        .revisions(&ctx, updated.id(), updated.partition_key())
        .await
        .unwrap();
    let ops: Vec<OperationKind> = log.entries().iter().map(|r| r.operation).collect();
    assert_eq!(
        ops,
        vec![
            OperationKind::Create,
            OperationKind::Update,
            OperationKind::Delete
        ]
    );
    assert_eq!(
        log.get(1).unwrap().snapshot,
        Some(json!({"name": "a", "size": 2}))
    );
    assert!(log.get(1).unwrap().change_summary.contains("size"));
    assert!(log.get(2).unwrap().snapshot.is_none());
    assert!(
        log.entries()
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp)
    );
}

pub async fn revisions_unknown_not_found(store: &dyn StoreBackend) {
    assert_kind(
        store
            .revisions(
                &CallContext::new(),
                &EntityId::new("nobody"),
                &PartitionKey::default(),
            )
            .await,
        ErrorKind::NotFound,
    );
}

pub async fn query_filters_and_skips_deleted(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    let mut fruit = Vec::new();
    for name in ["apple", "pear", "plum"] {
        fruit.push(
            store
                .create(&ctx, record(json!({"kind": "fruit", "name": name})))
                .await
                .unwrap(),
        );
    }
    store
        .create(&ctx, record(json!({"kind": "veg", "name": "leek"})))
        .await
        .unwrap();
    store
        .delete(&ctx, fruit[1].id(), fruit[1].partition_key(), 0)
        .await
        .unwrap();

    let filter = EntityFilter::field_eq("kind", json!("fruit"));
    let mut names: Vec<String> = collect_query(store, &filter, None)
        .await
        .iter()
        .map(|r| r.payload()["name"].as_str().unwrap_or_default().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["apple", "plum"]);

    let everything = collect_query(store, &EntityFilter::all(), None).await;
    assert_eq!(everything.len(), 3);
}

pub async fn query_scoped_to_partition(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    store
        .create(&ctx, record_at("q1", "p0001", json!({"n": 1})))
        .await
        .unwrap();
    store
        .create(&ctx, record_at("q2", "p0002", json!({"n": 2})))
        .await
        .unwrap();
    store
        .create(&ctx, record_at("q3", "p0001", json!({"n": 3})))
        .await
        .unwrap();

    let scoped = collect_query(store, &EntityFilter::all(), Some(&PartitionKey::new("p0001"))).await;
    let mut ids: Vec<&str> = scoped.iter().map(|r| r.id().as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["q1", "q3"]);

    let empty = collect_query(store, &EntityFilter::all(), Some(&PartitionKey::new("p9999"))).await;
    assert!(empty.is_empty());
}

pub async fn rejects_invalid_identity(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    assert_kind(
        store.create(&ctx, record_at("a/b", "", json!({"n": 1}))).await,
        ErrorKind::Validation,
    );
    assert_kind(
        store.create(&ctx, record_at("ok", "..", json!({"n": 1}))).await,
        ErrorKind::Validation,
    );
}

pub async fn expired_deadline_is_unavailable(store: &dyn StoreBackend) {
    let live = CallContext::new();
    let expired = CallContext::new().with_timeout(Duration::ZERO);

    let err = store
        .create(&expired, record_at("late", "", json!({"n": 0})))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        StoreError::Unavailable(BackendError::DeadlineExceeded { .. })
    ));
    assert_kind(
        store
            .get(&live, &EntityId::new("late"), &PartitionKey::default())
            .await,
        ErrorKind::NotFound,
    );

    let created = store.create(&live, record(json!({"n": 0}))).await.unwrap();
    assert_kind(
        store
            .update(&expired, created.clone().with_payload(json!({"n": 1})).unwrap())
            .await,
        ErrorKind::Unavailable,
    );
    let unchanged = store
        .get(&live, created.id(), created.partition_key())
        .await
        .unwrap();
    assert_eq!(unchanged.version(), 0);
    assert_eq!(
        store
            .revisions(&live, created.id(), created.partition_key())
            .await
            .unwrap()
            .len(),
        1
    );
}

pub async fn update_keeps_created_at(store: &dyn StoreBackend) {
    let ctx = CallContext::new();
    let created = store.create(&ctx, record(json!({"n": 0}))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let updated = store
        .update(&ctx, created.clone().with_payload(json!({"n": 1})).unwrap())
        .await
        .unwrap();
    assert_eq!(updated.created_at(), created.created_at());
    assert!(updated.updated_at() > created.updated_at());
}

pub async fn probe_succeeds(store: &dyn StoreBackend) {
    store.probe(&CallContext::new()).await.unwrap();
    assert!(!store.capabilities().is_empty());
}
