//! [`StoreBackend`] implementation for the table backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::StreamExt;

use crate::core::{
    CallContext, CurrentVersion, EntityFilter, EntityStream, ExpectedVersion, StoreBackend,
    StoreCapability, StoreType, check_and_advance,
};
use crate::error::{StoreError, StoreResult};
use crate::types::{EntityId, EntityRecord, OperationKind, PartitionKey, Revision, RevisionLog};

use super::backend::{BACKEND_NAME, TableBackend, map_client_error};
use super::client::{TableClientError, TableRow};

impl TableBackend {
    async fn load(
        &self,
        ctx: &CallContext,
        id: &EntityId,
        partition_key: &PartitionKey,
    ) -> StoreResult<Option<EntityRecord>> {
        let row = ctx
            .run(BACKEND_NAME, "read", async {
                self.client
                    .get(partition_key.as_str(), id.as_str())
                    .await
                    .map_err(map_client_error)
            })
            .await?;
        Ok(row.map(|r| r.record))
    }

    fn lock_wait(&self, ctx: &CallContext) -> Duration {
        match ctx.remaining() {
            Some(remaining) => remaining.min(self.lock_timeout()),
            None => self.lock_timeout(),
        }
    }

    /// Runs read, version check and commit for an existing entity. `build`
    /// turns the stored record and the new version into the record to
    /// persist; the row and its revision are written by one client call.
    ///
    /// Writes are not raced against the deadline: a blocking statement
    /// cannot be abandoned once issued, so the deadline is checked just
    /// before it instead.
    async fn write_existing<F>(
        &self,
        ctx: &CallContext,
        id: &EntityId,
        partition_key: &PartitionKey,
        expected: u64,
        operation: OperationKind,
        build: F,
    ) -> StoreResult<EntityRecord>
    where
        F: FnOnce(&EntityRecord, u64) -> EntityRecord + Send,
    {
        let native = self.client.supports_conditional_replace();
        let _guard = if native {
            None
        } else {
            let key = format!("{}\u{1f}{}", partition_key.as_str(), id.as_str());
            Some(self.locks.acquire(key, id, self.lock_wait(ctx)).await?)
        };

        let current = self.load(ctx, id, partition_key).await?;
        let version = check_and_advance(
            id,
            partition_key,
            CurrentVersion::of(current.as_ref()),
            ExpectedVersion::Exactly(expected),
        )?;
        let Some(current) = current else {
            return Err(StoreError::not_found(id, partition_key));
        };
        let next = build(&current, version);

        ctx.check(BACKEND_NAME, &operation.to_string())?;
        let row = TableRow::from_record(&next);
        let revision = Revision::from_record(&next, operation, Some(&current));
        if native {
            match self.client.replace_if_version(&row, expected, &revision).await {
                Ok(()) => {}
                Err(TableClientError::PreconditionFailed) => {
                    return Err(self.explain_precondition(ctx, id, partition_key, expected).await);
                }
                Err(e) => return Err(map_client_error(e)),
            }
        } else {
            self.client
                .upsert(&row, &revision)
                .await
                .map_err(map_client_error)?;
        }
        Ok(next)
    }

    async fn explain_precondition(
        &self,
        ctx: &CallContext,
        id: &EntityId,
        partition_key: &PartitionKey,
        expected: u64,
    ) -> StoreError {
        let latest = match self.load(ctx, id, partition_key).await {
            Ok(latest) => latest,
            Err(e) => return e,
        };
        let err = match check_and_advance(
            id,
            partition_key,
            CurrentVersion::of(latest.as_ref()),
            ExpectedVersion::Exactly(expected),
        ) {
            Err(e) => e,
            Ok(_) => StoreError::conflict(id, expected, expected),
        };
        tracing::warn!(
            backend = BACKEND_NAME,
            entity_id = %id,
            partition = %partition_key,
            expected,
            label = ctx.label(),
            error = %err,
            "conditional replace rejected"
        );
        err
    }
}

#[async_trait]
impl StoreBackend for TableBackend {
    fn kind(&self) -> StoreType {
        StoreType::Table
    }

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn capabilities(&self) -> Vec<StoreCapability> {
        let write = if self.client.supports_conditional_replace() {
            StoreCapability::NativeConditionalWrite
        } else {
            StoreCapability::LockedWrite
        };
        vec![write, StoreCapability::PartitionScan, StoreCapability::Revisions]
    }

    async fn create(&self, ctx: &CallContext, record: EntityRecord) -> StoreResult<EntityRecord> {
        record.validate()?;
        ctx.check(BACKEND_NAME, "create")?;
        let stored = record.stamp_created(Utc::now());

        let revision = Revision::from_record(&stored, OperationKind::Create, None);
        match self.client.insert(&TableRow::from_record(&stored), &revision).await {
            Ok(()) => {}
            Err(TableClientError::AlreadyExists) => {
                return Err(StoreError::already_exists(stored.id(), stored.partition_key()));
            }
            Err(e) => return Err(map_client_error(e)),
        }

        tracing::debug!(
            backend = BACKEND_NAME,
            entity_id = %stored.id(),
            partition = %stored.partition_key(),
            version = stored.version(),
            label = ctx.label(),
            "created entity"
        );
        Ok(stored)
    }

    async fn get(
        &self,
        ctx: &CallContext,
        id: &EntityId,
        partition_key: &PartitionKey,
    ) -> StoreResult<EntityRecord> {
        match self.load(ctx, id, partition_key).await? {
            Some(record) if !record.is_deleted() => Ok(record),
            _ => Err(StoreError::not_found(id, partition_key)),
        }
    }

    async fn update(&self, ctx: &CallContext, record: EntityRecord) -> StoreResult<EntityRecord> {
        record.validate()?;
        let expected = record.version();
        let (id, partition_key) = (record.id().clone(), record.partition_key().clone());
        let payload = record.into_payload();
        let now = Utc::now();

        let updated = self
            .write_existing(
                ctx,
                &id,
                &partition_key,
                expected,
                OperationKind::Update,
                move |current, version| current.next_version(version, payload, now),
            )
            .await?;

        tracing::debug!(
            backend = BACKEND_NAME,
            entity_id = %updated.id(),
            partition = %updated.partition_key(),
            version = updated.version(),
            label = ctx.label(),
            "updated entity"
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
        let now = Utc::now();
        let tombstone = self
            .write_existing(
                ctx,
                id,
                partition_key,
                expected_version,
                OperationKind::Delete,
                move |current, version| current.tombstone(version, now),
            )
            .await?;

        tracing::debug!(
            backend = BACKEND_NAME,
            entity_id = %id,
            partition = %partition_key,
            version = tombstone.version(),
            label = ctx.label(),
            "deleted entity"
        );
        Ok(tombstone)
    }

    async fn query(
        &self,
        ctx: &CallContext,
        filter: &EntityFilter,
        partition_key: Option<&PartitionKey>,
    ) -> StoreResult<EntityStream> {
        let rows = ctx
            .run(BACKEND_NAME, "query", async {
                self.client
                    .scan(partition_key.map(PartitionKey::as_str))
                    .await
                    .map_err(map_client_error)
            })
            .await?;

        let filter = filter.clone();
        let stream = rows.filter_map(move |item| {
            let result = match item {
                Ok(row) if row.deleted => None,
                Ok(row) => filter.matches(&row.record).then_some(Ok(row.record)),
                Err(e) => Some(Err(map_client_error(e))),
            };
            futures::future::ready(result)
        });
        Ok(stream.boxed())
    }

    async fn revisions(
        &self,
        ctx: &CallContext,
        id: &EntityId,
        partition_key: &PartitionKey,
    ) -> StoreResult<RevisionLog> {
        let entries = ctx
            .run(BACKEND_NAME, "revisions", async {
                self.client
                    .revisions(partition_key.as_str(), id.as_str())
                    .await
                    .map_err(map_client_error)
            })
            .await?;
        if entries.is_empty() {
            return Err(StoreError::not_found(id, partition_key));
        }
        RevisionLog::from_entries(id.clone(), entries)
    }

    async fn probe(&self, ctx: &CallContext) -> StoreResult<()> {
        ctx.run(BACKEND_NAME, "probe", async {
            self.client.ping().await.map_err(map_client_error)
        })
        .await
    }

    async fn close(&self) -> StoreResult<()> {
        self.client.close().await.map_err(map_client_error)?;
        tracing::info!(backend = BACKEND_NAME, "closed table store");
        Ok(())
    }
}
