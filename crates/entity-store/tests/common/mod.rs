//! Test infrastructure for the entity store.
//!
//! [`contract`] holds backend-agnostic checks that every [`StoreBackend`]
//! must pass; each backend's test file instantiates them with the
//! `contract_suite!` macro. The helpers here build records and assert on
//! error kinds.

#![allow(dead_code)]

#[macro_use]
pub mod contract;

use futures::StreamExt;
use serde_json::Value;

use helios_entity_store::core::{CallContext, EntityFilter, StoreBackend};
use helios_entity_store::error::{ErrorKind, StoreResult};
use helios_entity_store::types::{EntityRecord, PartitionKey};

/// Builds a record in the default partition with a fresh id.
pub fn record(payload: Value) -> EntityRecord {
    EntityRecord::new(payload).expect("fixture payload must be an object")
}

/// Builds a record with a caller-chosen id and partition.
pub fn record_at(id: &str, partition: &str, payload: Value) -> EntityRecord {
    record(payload).with_id(id).with_partition_key(partition)
}

/// Asserts that `result` failed with `kind`.
#[track_caller]
pub fn assert_kind<T: std::fmt::Debug>(result: StoreResult<T>, kind: ErrorKind) {
    match result {
        Ok(value) => panic!("expected {} error, got Ok({:?})", kind, value),
        Err(e) => assert_eq!(e.kind(), kind, "unexpected error: {}", e),
    }
}

/// Runs a query and collects every item, failing on the first error.
pub async fn collect_query(
    store: &dyn StoreBackend,
    filter: &EntityFilter,
    partition: Option<&PartitionKey>,
) -> Vec<EntityRecord> {
    let stream = store
        .query(&CallContext::new(), filter, partition)
        .await
        .expect("query should start");
    let items: Vec<StoreResult<EntityRecord>> = stream.collect().await;
    items
        .into_iter()
        .map(|item| item.expect("query item should decode"))
        .collect()
}
