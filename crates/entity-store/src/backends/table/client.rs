//! Client seam for key-value table services.
//!
//! Rows are addressed by `(partition_key, row_key)` and carry the entity
//! version as a visible column. Services differ in whether they can make a
//! replace conditional on that column; [`TableApi::supports_conditional_replace`]
//! tells the backend which write path to take.
//!
//! Every write carries the revision it produces, and a client stores both or
//! neither (a transaction, or a single-partition batch on table services).
//! The revision trail therefore never falls behind the rows.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::types::{EntityRecord, Revision};

/// One stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    /// Partition key column (empty for the default partition).
    pub partition_key: String,
    /// Row key column: the entity id.
    pub row_key: String,
    /// Version column.
    pub version: u64,
    /// Tombstone column.
    pub deleted: bool,
    /// The full record.
    pub record: EntityRecord,
}

impl TableRow {
    /// Builds the row for `record`.
    pub fn from_record(record: &EntityRecord) -> Self {
        Self {
            partition_key: record.partition_key().as_str().to_string(),
            row_key: record.id().as_str().to_string(),
            version: record.version(),
            deleted: record.is_deleted(),
            record: record.clone(),
        }
    }
}

/// Failures reported by a [`TableApi`] client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableClientError {
    /// The row already exists.
    AlreadyExists,
    /// The stored version did not match, or the row is missing.
    PreconditionFailed,
    /// The client has no native conditional replace.
    Unsupported,
    /// The service could not be reached.
    Unavailable(String),
    /// Stored data could not be decoded.
    Corrupt(String),
    /// Any other driver failure.
    Internal(String),
}

/// Stream of rows returned by [`TableApi::scan`].
pub type RowStream = BoxStream<'static, Result<TableRow, TableClientError>>;

/// Calls the table backend makes against a table service.
#[async_trait]
pub trait TableApi: Send + Sync + Debug {
    /// Short client name for logs.
    fn client_name(&self) -> &'static str;

    /// Whether [`TableApi::replace_if_version`] is implemented.
    fn supports_conditional_replace(&self) -> bool;

    /// Checks connectivity.
    async fn ping(&self) -> Result<(), TableClientError>;

    /// Inserts a row with its first revision, failing with `AlreadyExists`
    /// if the key is taken.
    async fn insert(&self, row: &TableRow, revision: &Revision) -> Result<(), TableClientError>;

    /// Loads one row.
    async fn get(&self, partition_key: &str, row_key: &str)
    -> Result<Option<TableRow>, TableClientError>;

    /// Writes a row and its revision unconditionally.
    async fn upsert(&self, row: &TableRow, revision: &Revision) -> Result<(), TableClientError>;

    /// Replaces a row and stores its revision, only if the version column
    /// equals `expected_version`.
    async fn replace_if_version(
        &self,
        _row: &TableRow,
        _expected_version: u64,
        _revision: &Revision,
    ) -> Result<(), TableClientError> {
        Err(TableClientError::Unsupported)
    }

    /// Streams rows, optionally from one partition only.
    async fn scan(&self, partition_key: Option<&str>) -> Result<RowStream, TableClientError>;

    /// Returns the revisions of one row in ascending version order.
    async fn revisions(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Vec<Revision>, TableClientError>;

    /// Releases the connection.
    async fn close(&self) -> Result<(), TableClientError> {
        Ok(())
    }
}
