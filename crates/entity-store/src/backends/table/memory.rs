//! In-process table client.
//!
//! Mirrors table services that offer insert-if-absent but no conditional
//! replace, so the backend serializes updates with its own per-key lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use crate::types::Revision;

use super::client::{RowStream, TableApi, TableClientError, TableRow};

type RowKey = (String, String);

static REGISTRY: LazyLock<Mutex<HashMap<String, Arc<Mutex<TableState>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Default)]
struct TableState {
    rows: BTreeMap<RowKey, TableRow>,
    revisions: HashMap<RowKey, BTreeMap<u64, Revision>>,
    upserts: u64,
}

impl TableState {
    fn record_revision(&mut self, key: RowKey, revision: &Revision) {
        self.revisions
            .entry(key)
            .or_default()
            .insert(revision.version, revision.clone());
    }
}

/// A [`TableApi`] backed by process memory, shared per table name.
#[derive(Debug, Clone)]
pub struct MemoryTableClient {
    state: Arc<Mutex<TableState>>,
}

impl MemoryTableClient {
    /// Returns the client for the table called `name`.
    pub fn named(name: &str) -> Self {
        let state = REGISTRY
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();
        Self { state }
    }

    /// Number of unconditional writes performed so far.
    pub fn upsert_count(&self) -> u64 {
        self.state.lock().upserts
    }
}

#[async_trait]
impl TableApi for MemoryTableClient {
    fn client_name(&self) -> &'static str {
        "memory"
    }

    fn supports_conditional_replace(&self) -> bool {
        false
    }

    async fn ping(&self) -> Result<(), TableClientError> {
        Ok(())
    }

    async fn insert(&self, row: &TableRow, revision: &Revision) -> Result<(), TableClientError> {
        let mut state = self.state.lock();
        let key = (row.partition_key.clone(), row.row_key.clone());
        if state.rows.contains_key(&key) {
            return Err(TableClientError::AlreadyExists);
        }
        state.rows.insert(key.clone(), row.clone());
        state.record_revision(key, revision);
        Ok(())
    }

    async fn get(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableRow>, TableClientError> {
        let state = self.state.lock();
        Ok(state
            .rows
            .get(&(partition_key.to_string(), row_key.to_string()))
            .cloned())
    }

    async fn upsert(&self, row: &TableRow, revision: &Revision) -> Result<(), TableClientError> {
        let mut state = self.state.lock();
        state.upserts += 1;
        let key = (row.partition_key.clone(), row.row_key.clone());
        state.rows.insert(key.clone(), row.clone());
        state.record_revision(key, revision);
        Ok(())
    }

    async fn scan(&self, partition_key: Option<&str>) -> Result<RowStream, TableClientError> {
        let rows: Vec<TableRow> = self
            .state
            .lock()
            .rows
            .values()
            .filter(|row| partition_key.is_none_or(|pk| row.partition_key == pk))
            .cloned()
            .collect();
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn revisions(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Vec<Revision>, TableClientError> {
        let state = self.state.lock();
        Ok(state
            .revisions
            .get(&(partition_key.to_string(), row_key.to_string()))
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityRecord, OperationKind};
    use serde_json::json;

    fn row_and_revision(record: &EntityRecord) -> (TableRow, Revision) {
        (
            TableRow::from_record(record),
            Revision::from_record(record, OperationKind::Create, None),
        )
    }

    #[tokio::test]
    async fn test_no_conditional_replace() {
        let client = MemoryTableClient::named("table-memory-cond");
        let (row, revision) = row_and_revision(&EntityRecord::new(json!({"a": 1})).unwrap());
        client.insert(&row, &revision).await.unwrap();
        assert!(!client.supports_conditional_replace());
        assert_eq!(
            client.replace_if_version(&row, 0, &revision).await,
            Err(TableClientError::Unsupported)
        );
    }

    #[tokio::test]
    async fn test_insert_twice() {
        let client = MemoryTableClient::named("table-memory-insert");
        let (row, revision) = row_and_revision(&EntityRecord::new(json!({"a": 1})).unwrap());
        client.insert(&row, &revision).await.unwrap();
        assert_eq!(
            client.insert(&row, &revision).await,
            Err(TableClientError::AlreadyExists)
        );
        assert_eq!(
            client
                .revisions(&row.partition_key, &row.row_key)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_scan_by_partition() {
        let client = MemoryTableClient::named("table-memory-scan");
        for pk in ["a", "a", "b"] {
            let record = EntityRecord::new(json!({"x": 1})).unwrap().with_partition_key(pk);
            let (row, revision) = row_and_revision(&record);
            client.insert(&row, &revision).await.unwrap();
        }
        let rows: Vec<_> = client.scan(Some("a")).await.unwrap().collect().await;
        assert_eq!(rows.len(), 2);
    }
}
