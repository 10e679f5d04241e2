//! The uniform storage contract.
//!
//! This module defines [`StoreBackend`], which every backing store
//! implements, and [`StoreType`], the closed set of stores the factory can
//! open.

use std::fmt::{self, Debug};
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, StoreError, StoreResult};
use crate::types::{EntityId, EntityRecord, PartitionKey, RevisionLog};

use super::context::CallContext;
use super::filter::EntityFilter;

/// A lazy, finite stream of query results.
///
/// The stream is not restartable; call [`StoreBackend::query`] again to
/// re-run a query.
pub type EntityStream = BoxStream<'static, StoreResult<EntityRecord>>;

/// Identifies a kind of backing store.
///
/// `CosmosDocument` and `DynamoTable` are declared so configuration can name
/// them, but opening them fails with `ConfigurationError::Unsupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreType {
    /// Document database with native conditional writes.
    Document,
    /// Key-value table service addressed by partition and row key.
    Table,
    /// Directory tree on a local file system.
    LocalFile,
    /// Hosted document database (not implemented).
    CosmosDocument,
    /// Hosted key-value table (not implemented).
    DynamoTable,
}

impl StoreType {
    /// Every declared store type.
    pub const ALL: [StoreType; 5] = [
        StoreType::Document,
        StoreType::Table,
        StoreType::LocalFile,
        StoreType::CosmosDocument,
        StoreType::DynamoTable,
    ];

    /// Returns the canonical configuration string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreType::Document => "document",
            StoreType::Table => "table",
            StoreType::LocalFile => "local-file",
            StoreType::CosmosDocument => "cosmos-document",
            StoreType::DynamoTable => "dynamo-table",
        }
    }

    /// Returns `true` if this crate ships an implementation.
    pub fn is_supported(&self) -> bool {
        match self {
            StoreType::Document | StoreType::Table | StoreType::LocalFile => true,
            StoreType::CosmosDocument | StoreType::DynamoTable => false,
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StoreType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        StoreType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| {
                ConfigurationError::UnknownStoreType {
                    value: s.to_string(),
                }
                .into()
            })
    }
}

/// Optional behaviours a backend may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCapability {
    /// Version checks are enforced by the store itself in a single call.
    NativeConditionalWrite,
    /// Version checks run under a per-entity lock held by this process.
    LockedWrite,
    /// The per-entity lock is visible to other processes.
    CrossProcessLocking,
    /// Queries can be restricted to a single partition.
    PartitionScan,
    /// Revision trails can be read back.
    Revisions,
}

impl fmt::Display for StoreCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreCapability::NativeConditionalWrite => "native-conditional-write",
            StoreCapability::LockedWrite => "locked-write",
            StoreCapability::CrossProcessLocking => "cross-process-locking",
            StoreCapability::PartitionScan => "partition-scan",
            StoreCapability::Revisions => "revisions",
        };
        write!(f, "{}", name)
    }
}

/// Versioned entity storage.
///
/// Every mutation is guarded by optimistic concurrency: the caller states
/// the version it last saw, and the write is rejected with
/// `ConcurrencyConflict` if the stored version differs. Each accepted
/// mutation appends one revision.
///
/// Deletes are soft. The stored record is replaced by a tombstone and the id
/// is retired: `get`, `update` and `delete` report `NotFound`, and `create`
/// with the same id reports `AlreadyExists`.
///
/// # Example
///
/// ```ignore
/// use helios_entity_store::core::{CallContext, StoreBackend};
/// use helios_entity_store::types::EntityRecord;
/// use serde_json::json;
///
/// async fn rename<S: StoreBackend>(store: &S) -> Result<(), helios_entity_store::StoreError> {
///     let ctx = CallContext::new();
///     let created = store.create(&ctx, EntityRecord::new(json!({"name": "a"}))?).await?;
///     let edited = created.with_payload(json!({"name": "b"}))?;
///     let updated = store.update(&ctx, edited).await?;
///     assert_eq!(updated.version(), 1);
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Returns the store type this backend implements.
    fn kind(&self) -> StoreType;

    /// Returns a short name used in logs and errors.
    fn backend_name(&self) -> &'static str;

    /// Returns the behaviours this backend supports.
    fn capabilities(&self) -> Vec<StoreCapability>;

    /// Returns `true` if the backend advertises `capability`.
    fn supports(&self, capability: StoreCapability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Persists a new entity at version 0.
    ///
    /// The store sets `created_at` and `updated_at`; any version carried by
    /// the submitted record is ignored.
    ///
    /// # Errors
    ///
    /// * `StoreError::AlreadyExists` - the id is live or retired in that partition
    /// * `StoreError::Validation` - the record is malformed
    async fn create(&self, ctx: &CallContext, record: EntityRecord) -> StoreResult<EntityRecord>;

    /// Reads the current version of an entity.
    ///
    /// # Errors
    ///
    /// * `StoreError::NotFound` - unknown or deleted
    async fn get(
        &self,
        ctx: &CallContext,
        id: &EntityId,
        partition_key: &PartitionKey,
    ) -> StoreResult<EntityRecord>;

    /// Replaces the payload of an existing entity.
    ///
    /// `record.version()` is the expected stored version. On success the
    /// returned record carries `version + 1`.
    ///
    /// # Errors
    ///
    /// * `StoreError::ConcurrencyConflict` - the stored version differs
    /// * `StoreError::NotFound` - unknown or deleted
    async fn update(&self, ctx: &CallContext, record: EntityRecord) -> StoreResult<EntityRecord>;

    /// Soft-deletes an entity and returns the tombstone, which carries
    /// `expected_version + 1` and the deletion time.
    ///
    /// # Errors
    ///
    /// * `StoreError::ConcurrencyConflict` - the stored version differs;
    ///   the record is left untouched
    /// * `StoreError::NotFound` - unknown or already deleted
    async fn delete(
        &self,
        ctx: &CallContext,
        id: &EntityId,
        partition_key: &PartitionKey,
        expected_version: u64,
    ) -> StoreResult<EntityRecord>;

    /// Streams live entities accepted by `filter`, optionally restricted to
    /// one partition.
    async fn query(
        &self,
        ctx: &CallContext,
        filter: &EntityFilter,
        partition_key: Option<&PartitionKey>,
    ) -> StoreResult<EntityStream>;

    /// Reads the revision trail of an entity, including a deleted one.
    ///
    /// # Errors
    ///
    /// * `StoreError::NotFound` - nothing was ever stored under the id
    async fn revisions(
        &self,
        ctx: &CallContext,
        id: &EntityId,
        partition_key: &PartitionKey,
    ) -> StoreResult<RevisionLog>;

    /// Checks that the backing store is reachable.
    async fn probe(&self, ctx: &CallContext) -> StoreResult<()>;

    /// Releases clients and connections. Further calls may fail.
    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}
