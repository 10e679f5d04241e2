//! Store selection and construction.
//!
//! [`StoreFactory`] turns a [`StoreConfig`] into a ready [`StoreHandle`]:
//! it validates the fields the chosen [`StoreType`] requires, builds the
//! backend and its client once, and probes it before handing it out.
//!
//! # Examples
//!
//! ```no_run
//! use helios_entity_store::{StoreConfig, StoreFactory, StoreType};
//! use helios_entity_store::core::{CallContext, StoreBackend};
//! use helios_entity_store::types::EntityRecord;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StoreConfig::new(StoreType::LocalFile)
//!     .with_root_path("./data/entities")
//!     .with_partition_count(8);
//! let store = StoreFactory::open(&config).await?;
//!
//! let created = store
//!     .create(&CallContext::new(), EntityRecord::new(json!({"name": "a"}))?)
//!     .await?;
//! assert_eq!(created.version(), 0);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backends::document::{DocumentBackend, DocumentBackendConfig, default_collection};
use crate::backends::file::{FileBackend, FileBackendConfig};
use crate::backends::table::{TableBackend, TableBackendConfig};
use crate::core::audit::emit_or_warn;
use crate::core::{
    AuditEvent, AuditSink, CallContext, DEFAULT_PARTITION_COUNT, EntityFilter, EntityStream,
    NoopAuditSink, PartitionRouter, StoreBackend, StoreCapability, StoreType, millis,
};
use crate::error::{ConfigurationError, StoreError, StoreResult};
use crate::types::{EntityId, EntityRecord, OperationKind, PartitionKey, RevisionLog};

/// Configuration for opening a store.
///
/// Which fields are required depends on `store_type`:
///
/// | Store type | Required |
/// |------------|----------|
/// | `document` | `connection_string`, `database_name` |
/// | `table` | `connection_string` |
/// | `local-file` | `root_path` |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to open.
    pub store_type: StoreType,

    /// Backend URI for document and table stores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    /// Database name for document stores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,

    /// Root directory for local file stores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_path: Option<PathBuf>,

    /// Collection or table name. Defaults to `entities`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,

    /// Payload fields hashed into the partition key. Empty routes by id.
    #[serde(default)]
    pub partition_fields: Vec<String>,

    /// Number of partitions. Routing is off unless this or
    /// `partition_fields` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_count: Option<u32>,

    /// Deadline applied to calls whose context carries none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,

    /// Lock wait for stores that serialize writers with locks.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Delay between lock attempts (local file store).
    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,

    /// Age after which a lock file is broken (local file store).
    #[serde(default = "default_stale_lock_ms")]
    pub stale_lock_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_lock_retry_interval_ms() -> u64 {
    20
}

fn default_stale_lock_ms() -> u64 {
    30_000
}

impl StoreConfig {
    /// Creates a configuration for `store_type` with every optional field
    /// unset.
    pub fn new(store_type: StoreType) -> Self {
        Self {
            store_type,
            connection_string: None,
            database_name: None,
            root_path: None,
            collection: None,
            partition_fields: Vec::new(),
            partition_count: None,
            default_timeout_ms: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
            stale_lock_ms: default_stale_lock_ms(),
        }
    }

    /// Sets the connection string.
    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// Sets the database name.
    pub fn with_database_name(mut self, database_name: impl Into<String>) -> Self {
        self.database_name = Some(database_name.into());
        self
    }

    /// Sets the root directory.
    pub fn with_root_path(mut self, root_path: impl Into<PathBuf>) -> Self {
        self.root_path = Some(root_path.into());
        self
    }

    /// Sets the collection or table name.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Sets the fields hashed into the partition key.
    pub fn with_partition_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the partition count.
    pub fn with_partition_count(mut self, partition_count: u32) -> Self {
        self.partition_count = Some(partition_count);
        self
    }

    /// Sets the default call timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(millis(timeout));
        self
    }

    /// Sets the lock timeout.
    pub fn with_lock_timeout_ms(mut self, lock_timeout_ms: u64) -> Self {
        self.lock_timeout_ms = lock_timeout_ms;
        self
    }

    /// Sets the lock retry interval.
    pub fn with_lock_retry_interval_ms(mut self, lock_retry_interval_ms: u64) -> Self {
        self.lock_retry_interval_ms = lock_retry_interval_ms;
        self
    }

    /// Sets the stale lock threshold.
    pub fn with_stale_lock_ms(mut self, stale_lock_ms: u64) -> Self {
        self.stale_lock_ms = stale_lock_ms;
        self
    }

    /// Checks that every field the store type requires is present.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError::Unsupported` for placeholder store types
    /// - `ConfigurationError::MissingField` naming the first absent field
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let required: &[&'static str] = match self.store_type {
            StoreType::Document => &["connection_string", "database_name"],
            StoreType::Table => &["connection_string"],
            StoreType::LocalFile => &["root_path"],
            StoreType::CosmosDocument | StoreType::DynamoTable => {
                return Err(ConfigurationError::Unsupported {
                    store_type: self.store_type.to_string(),
                    message: "no implementation is available in this build".to_string(),
                });
            }
        };
        for field in required {
            if !self.has_field(field) {
                return Err(ConfigurationError::MissingField {
                    store_type: self.store_type.to_string(),
                    field: *field,
                });
            }
        }
        Ok(())
    }

    fn has_field(&self, field: &str) -> bool {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
        match field {
            "connection_string" => present(&self.connection_string),
            "database_name" => present(&self.database_name),
            "root_path" => self
                .root_path
                .as_ref()
                .is_some_and(|p| !p.as_os_str().is_empty()),
            _ => false,
        }
    }

    /// Builds the partition router, if routing is configured.
    pub fn router(&self) -> StoreResult<Option<PartitionRouter>> {
        if self.partition_count.is_none() && self.partition_fields.is_empty() {
            return Ok(None);
        }
        let count = self.partition_count.unwrap_or(DEFAULT_PARTITION_COUNT);
        PartitionRouter::new(self.partition_fields.clone(), count).map(Some)
    }

    fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    fn collection_or_default(&self) -> String {
        self.collection.clone().unwrap_or_else(default_collection)
    }

    // Only called after `validate`, which guarantees presence.
    fn field(value: &Option<String>) -> String {
        value.clone().unwrap_or_default()
    }
}

/// Opens stores from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreFactory;

impl StoreFactory {
    /// Validates `config`, builds the backend and probes it.
    ///
    /// # Errors
    ///
    /// - `Configuration` if a required field is missing or invalid, or the
    ///   store type has no implementation
    /// - `Unavailable` if the backend cannot be reached or fails its probe
    pub async fn open(config: &StoreConfig) -> StoreResult<StoreHandle> {
        config.validate()?;
        let router = config.router()?;

        let backend: Arc<dyn StoreBackend> = match config.store_type {
            StoreType::Document => {
                let backend_config = DocumentBackendConfig::new(
                    StoreConfig::field(&config.connection_string),
                    StoreConfig::field(&config.database_name),
                )
                .with_collection(config.collection_or_default());
                Arc::new(DocumentBackend::open(backend_config).await?)
            }
            StoreType::Table => {
                let backend_config =
                    TableBackendConfig::new(StoreConfig::field(&config.connection_string))
                        .with_table(config.collection_or_default())
                        .with_lock_timeout_ms(config.lock_timeout_ms);
                Arc::new(TableBackend::open(backend_config).await?)
            }
            StoreType::LocalFile => {
                let backend_config =
                    FileBackendConfig::new(config.root_path.clone().unwrap_or_default())
                        .with_lock_timeout_ms(config.lock_timeout_ms)
                        .with_lock_retry_interval_ms(config.lock_retry_interval_ms)
                        .with_stale_lock_ms(config.stale_lock_ms);
                Arc::new(FileBackend::open(backend_config).await?)
            }
            StoreType::CosmosDocument | StoreType::DynamoTable => {
                return Err(ConfigurationError::Unsupported {
                    store_type: config.store_type.to_string(),
                    message: "no implementation is available in this build".to_string(),
                }
                .into());
            }
        };

        let mut handle = StoreHandle::new(backend);
        if let Some(router) = router {
            handle = handle.with_router(router);
        }
        if let Some(timeout) = config.default_timeout() {
            handle = handle.with_default_timeout(timeout);
        }

        if let Err(e) = handle.probe(&CallContext::new()).await {
            tracing::warn!(
                store_type = %config.store_type,
                backend = handle.backend_name(),
                error = %e,
                "store probe failed"
            );
            if let Err(close_err) = handle.close().await {
                tracing::debug!(error = %close_err, "close after failed probe also failed");
            }
            return Err(match e {
                StoreError::Unavailable(_) => e,
                other => StoreError::unavailable(handle.backend_name(), other.to_string()),
            });
        }

        tracing::info!(
            store_type = %config.store_type,
            backend = handle.backend_name(),
            routed = handle.router.is_some(),
            "store ready"
        );
        Ok(handle)
    }

    /// Opens `config` as `store_type`, ignoring `config.store_type`.
    pub async fn open_as(store_type: StoreType, config: &StoreConfig) -> StoreResult<StoreHandle> {
        let config = StoreConfig {
            store_type,
            ..config.clone()
        };
        Self::open(&config).await
    }
}

/// An opened store.
///
/// Implements [`StoreBackend`] over the wrapped backend, adding partition
/// routing on create, the default call timeout, and audit emission after
/// every accepted mutation. Cloning is cheap and shares the backend.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    backend: Arc<dyn StoreBackend>,
    router: Option<PartitionRouter>,
    audit: Arc<dyn AuditSink>,
    default_timeout: Option<Duration>,
}

impl StoreHandle {
    /// Wraps `backend` with no routing, no default timeout and a no-op
    /// audit sink.
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            router: None,
            audit: Arc::new(NoopAuditSink),
            default_timeout: None,
        }
    }

    /// Routes records created in the default partition through `router`.
    pub fn with_router(mut self, router: PartitionRouter) -> Self {
        self.router = Some(router);
        self
    }

    /// Sends audit events to `sink`.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Applies `timeout` to calls whose context has no deadline.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Returns the wrapped backend.
    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    /// Returns the partition router, if routing is on.
    pub fn router(&self) -> Option<&PartitionRouter> {
        self.router.as_ref()
    }

    fn context(&self, ctx: &CallContext) -> CallContext {
        ctx.or_timeout(self.default_timeout)
    }
}

#[async_trait]
impl StoreBackend for StoreHandle {
    fn kind(&self) -> StoreType {
        self.backend.kind()
    }

    fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    fn capabilities(&self) -> Vec<StoreCapability> {
        self.backend.capabilities()
    }

    async fn create(&self, ctx: &CallContext, record: EntityRecord) -> StoreResult<EntityRecord> {
        let record = match &self.router {
            Some(router) if record.partition_key().is_default() => {
                let partition_key = router.route(&record)?;
                record.with_partition_key(partition_key)
            }
            _ => record,
        };
        let stored = self.backend.create(&self.context(ctx), record).await?;
        emit_or_warn(
            self.audit.as_ref(),
            &AuditEvent::for_record(&stored, OperationKind::Create),
        );
        Ok(stored)
    }

    async fn get(
        &self,
        ctx: &CallContext,
        id: &EntityId,
        partition_key: &PartitionKey,
    ) -> StoreResult<EntityRecord> {
        self.backend.get(&self.context(ctx), id, partition_key).await
    }

    async fn update(&self, ctx: &CallContext, record: EntityRecord) -> StoreResult<EntityRecord> {
        let updated = self.backend.update(&self.context(ctx), record).await?;
        emit_or_warn(
            self.audit.as_ref(),
            &AuditEvent::for_record(&updated, OperationKind::Update),
        );
        Ok(updated)
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        id: &EntityId,
        partition_key: &PartitionKey,
        expected_version: u64,
    ) -> StoreResult<EntityRecord> {
        let tombstone = self
            .backend
            .delete(&self.context(ctx), id, partition_key, expected_version)
            .await?;
        emit_or_warn(
            self.audit.as_ref(),
            &AuditEvent::for_record(&tombstone, OperationKind::Delete),
        );
        Ok(tombstone)
    }

    async fn query(
        &self,
        ctx: &CallContext,
        filter: &EntityFilter,
        partition_key: Option<&PartitionKey>,
    ) -> StoreResult<EntityStream> {
        self.backend
            .query(&self.context(ctx), filter, partition_key)
            .await
    }

    async fn revisions(
        &self,
        ctx: &CallContext,
        id: &EntityId,
        partition_key: &PartitionKey,
    ) -> StoreResult<RevisionLog> {
        self.backend
            .revisions(&self.context(ctx), id, partition_key)
            .await
    }

    async fn probe(&self, ctx: &CallContext) -> StoreResult<()> {
        self.backend.probe(&self.context(ctx)).await
    }

    async fn close(&self) -> StoreResult<()> {
        self.backend.close().await
    }
}
