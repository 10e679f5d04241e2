//! Client seam for document databases.
//!
//! [`DocumentApi`] is the narrow set of calls the document backend needs.
//! The important property is that writes carry their precondition to the
//! database (`insert_if_absent`, `replace_if_version`), so the version check
//! and the write happen in one round trip.
//!
//! A stored document also carries the revision that produced it. The
//! separate revisions collection is filled from there, and copying is
//! idempotent per version, so a copy that fails or arrives late never holds
//! up the next write.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::types::{EntityId, EntityRecord, PartitionKey, Revision};

/// Document primary key: partition segment and entity id.
///
/// `:` is not allowed in either part, so the pair is unambiguous.
pub fn document_key(id: &EntityId, partition_key: &PartitionKey) -> String {
    format!("{}:{}", partition_key.segment(), id)
}

/// The stored form of an entity.
///
/// `partitionKey` and `version` are promoted to top-level fields so the
/// database can filter and precondition on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Primary key, see [`document_key`].
    #[serde(rename = "_id")]
    pub key: String,

    /// Raw partition key (empty for the default partition).
    #[serde(rename = "partitionKey")]
    pub partition_key: String,

    /// Stored version.
    pub version: u64,

    /// Tombstone flag.
    #[serde(default)]
    pub deleted: bool,

    /// The full record.
    pub record: EntityRecord,

    /// The revision written with this version of the record.
    #[serde(rename = "lastRevision", default, skip_serializing_if = "Option::is_none")]
    pub last_revision: Option<Revision>,
}

impl StoredDocument {
    /// Wraps a record for storage.
    pub fn from_record(record: &EntityRecord) -> Self {
        Self {
            key: document_key(record.id(), record.partition_key()),
            partition_key: record.partition_key().as_str().to_string(),
            version: record.version(),
            deleted: record.is_deleted(),
            record: record.clone(),
            last_revision: None,
        }
    }

    /// Attaches the revision that produced this version.
    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.last_revision = Some(revision);
        self
    }
}

/// A revision as stored in the revisions collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRevision {
    /// `<entity key>#<zero-padded version>`, unique per revision.
    #[serde(rename = "_id")]
    pub key: String,

    /// Key of the owning document.
    #[serde(rename = "entityKey")]
    pub entity_key: String,

    /// Revision version, duplicated for sorting.
    pub version: u64,

    /// The revision itself.
    pub revision: Revision,
}

impl StoredRevision {
    /// Wraps a revision for storage.
    pub fn from_revision(revision: &Revision) -> Self {
        let entity_key = document_key(&revision.entity_id, &revision.partition_key);
        Self {
            key: format!("{}#{:020}", entity_key, revision.version),
            entity_key,
            version: revision.version,
            revision: revision.clone(),
        }
    }
}

/// Failures reported by a [`DocumentApi`] client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentClientError {
    /// A document with the same key already exists.
    Duplicate,
    /// The stored version did not match, or the document is missing.
    PreconditionFailed,
    /// The database could not be reached.
    Unavailable(String),
    /// A stored document could not be decoded.
    Corrupt(String),
    /// Any other driver failure.
    Internal(String),
}

/// Stream of documents returned by [`DocumentApi::find`].
pub type DocumentStream = BoxStream<'static, Result<StoredDocument, DocumentClientError>>;

/// Calls the document backend makes against a database.
#[async_trait]
pub trait DocumentApi: Send + Sync + Debug {
    /// Short client name for logs.
    fn client_name(&self) -> &'static str;

    /// Checks connectivity.
    async fn ping(&self) -> Result<(), DocumentClientError>;

    /// Inserts `doc`, failing with `Duplicate` if its key is taken.
    async fn insert_if_absent(&self, doc: &StoredDocument) -> Result<(), DocumentClientError>;

    /// Replaces the document with `doc.key` only if its stored version is
    /// `expected_version`; otherwise `PreconditionFailed`.
    async fn replace_if_version(
        &self,
        doc: &StoredDocument,
        expected_version: u64,
    ) -> Result<(), DocumentClientError>;

    /// Loads one document by key.
    async fn find_one(&self, key: &str) -> Result<Option<StoredDocument>, DocumentClientError>;

    /// Streams documents, optionally only those in one partition.
    async fn find(&self, partition_key: Option<&str>) -> Result<DocumentStream, DocumentClientError>;

    /// Stores a revision. Fails with `Duplicate` if that version exists;
    /// other versions may be stored in any order.
    async fn append_revision(&self, revision: &StoredRevision) -> Result<(), DocumentClientError>;

    /// Returns the revisions of one entity in ascending version order.
    async fn revisions(&self, entity_key: &str) -> Result<Vec<StoredRevision>, DocumentClientError>;

    /// Releases the connection.
    async fn close(&self) -> Result<(), DocumentClientError> {
        Ok(())
    }
}
