//! [`StoreBackend`] implementation for the document backend.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::StreamExt;

use crate::core::{
    CallContext, CurrentVersion, EntityFilter, EntityStream, ExpectedVersion, StoreBackend,
    StoreCapability, StoreType, check_and_advance,
};
use crate::error::{StoreError, StoreResult};
use crate::types::{EntityId, EntityRecord, OperationKind, PartitionKey, Revision, RevisionLog};

use super::backend::{BACKEND_NAME, DocumentBackend, map_client_error};
use super::client::{DocumentClientError, StoredDocument, StoredRevision, document_key};

impl DocumentBackend {
    async fn load(
        &self,
        ctx: &CallContext,
        id: &EntityId,
        partition_key: &PartitionKey,
    ) -> StoreResult<Option<StoredDocument>> {
        let key = document_key(id, partition_key);
        ctx.run(BACKEND_NAME, "read", async {
            self.client.find_one(&key).await.map_err(map_client_error)
        })
        .await
    }

    /// Copies a committed revision into the revisions collection. A copy
    /// that is already there counts as done.
    async fn publish(&self, revision: &Revision) -> Result<(), DocumentClientError> {
        match self
            .client
            .append_revision(&StoredRevision::from_revision(revision))
            .await
        {
            Ok(()) | Err(DocumentClientError::Duplicate) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Publishes the revision of a write that has already committed.
    ///
    /// A failure is only logged: the document still carries the revision,
    /// and the next write or revisions read publishes it.
    async fn publish_committed(&self, ctx: &CallContext, revision: &Revision) {
        if let Err(e) = self.publish(revision).await {
            tracing::warn!(
                backend = BACKEND_NAME,
                entity_id = %revision.entity_id,
                partition = %revision.partition_key,
                version = revision.version,
                label = ctx.label(),
                error = ?e,
                "revision copy deferred"
            );
        }
    }

    /// Replaces the stored document with `next` and its revision if it is
    /// still at `expected`.
    ///
    /// The deadline is checked before the call and the call is never
    /// abandoned, since the server may apply it after a client-side timeout.
    /// A failed precondition is re-read so the caller sees either the
    /// conflicting version or `NotFound`.
    async fn replace_checked(
        &self,
        ctx: &CallContext,
        next: &EntityRecord,
        revision: Revision,
        expected: u64,
        operation: OperationKind,
    ) -> StoreResult<()> {
        ctx.check(BACKEND_NAME, &operation.to_string())?;
        let doc = StoredDocument::from_record(next).with_revision(revision);
        match self.client.replace_if_version(&doc, expected).await {
            Ok(()) => Ok(()),
            Err(DocumentClientError::PreconditionFailed) => {
                let latest = self.load(ctx, next.id(), next.partition_key()).await?;
                let current = CurrentVersion::of(latest.as_ref().map(|d| &d.record));
                let err = match check_and_advance(
                    next.id(),
                    next.partition_key(),
                    current,
                    ExpectedVersion::Exactly(expected),
                ) {
                    Err(e) => e,
                    // The document moved and came back to `expected` in between.
                    Ok(_) => StoreError::conflict(next.id(), expected, expected),
                };
                tracing::warn!(
                    backend = BACKEND_NAME,
                    entity_id = %next.id(),
                    partition = %next.partition_key(),
                    expected,
                    %operation,
                    label = ctx.label(),
                    error = %err,
                    "conditional replace rejected"
                );
                Err(err)
            }
            Err(e) => Err(map_client_error(e)),
        }
    }

    /// Runs read, version check and commit for an existing entity.
    ///
    /// The revision of the version being replaced is published first, so it
    /// is in the collection before the document stops carrying it.
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
        let stored = self.load(ctx, id, partition_key).await?;
        let version = check_and_advance(
            id,
            partition_key,
            CurrentVersion::of(stored.as_ref().map(|d| &d.record)),
            ExpectedVersion::Exactly(expected),
        )?;
        let Some(stored) = stored else {
            return Err(StoreError::not_found(id, partition_key));
        };
        if let Some(previous) = &stored.last_revision {
            self.publish(previous).await.map_err(map_client_error)?;
        }

        let next = build(&stored.record, version);
        let revision = Revision::from_record(&next, operation, Some(&stored.record));
        self.replace_checked(ctx, &next, revision.clone(), expected, operation)
            .await?;
        self.publish_committed(ctx, &revision).await;
        Ok(next)
    }
}

#[async_trait]
impl StoreBackend for DocumentBackend {
    fn kind(&self) -> StoreType {
        StoreType::Document
    }

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn capabilities(&self) -> Vec<StoreCapability> {
        vec![
            StoreCapability::NativeConditionalWrite,
            StoreCapability::PartitionScan,
            StoreCapability::Revisions,
        ]
    }

    async fn create(&self, ctx: &CallContext, record: EntityRecord) -> StoreResult<EntityRecord> {
        record.validate()?;
        ctx.check(BACKEND_NAME, "create")?;
        let stored = record.stamp_created(Utc::now());
        let revision = Revision::from_record(&stored, OperationKind::Create, None);
        let doc = StoredDocument::from_record(&stored).with_revision(revision.clone());

        match self.client.insert_if_absent(&doc).await {
            Ok(()) => {}
            Err(DocumentClientError::Duplicate) => {
                return Err(StoreError::already_exists(stored.id(), stored.partition_key()));
            }
            Err(e) => return Err(map_client_error(e)),
        }
        self.publish_committed(ctx, &revision).await;

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
            Some(doc) if !doc.record.is_deleted() => Ok(doc.record),
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
        let documents = ctx
            .run(BACKEND_NAME, "query", async {
                self.client
                    .find(partition_key.map(PartitionKey::as_str))
                    .await
                    .map_err(map_client_error)
            })
            .await?;

        let filter = filter.clone();
        let stream = documents.filter_map(move |item| {
            let result = match item {
                Ok(doc) if doc.deleted => None,
                Ok(doc) => filter.matches(&doc.record).then_some(Ok(doc.record)),
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
        let Some(doc) = self.load(ctx, id, partition_key).await? else {
            return Err(StoreError::not_found(id, partition_key));
        };
        let published = ctx
            .run(BACKEND_NAME, "revisions", async {
                self.client.revisions(&doc.key).await.map_err(map_client_error)
            })
            .await?;
        let mut entries: Vec<Revision> = published.into_iter().map(|r| r.revision).collect();
        entries.extend(doc.last_revision);
        RevisionLog::for_record(&doc.record, entries)
    }

    async fn probe(&self, ctx: &CallContext) -> StoreResult<()> {
        ctx.run(BACKEND_NAME, "probe", async {
            self.client.ping().await.map_err(map_client_error)
        })
        .await
    }

    async fn close(&self) -> StoreResult<()> {
        self.client.close().await.map_err(map_client_error)?;
        tracing::info!(backend = BACKEND_NAME, "closed document store");
        Ok(())
    }
}
