//! [`StoreBackend`] implementation for the file backend.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};

use crate::core::{
    CallContext, CurrentVersion, EntityFilter, EntityStream, ExpectedVersion, StoreBackend,
    StoreCapability, StoreType, check_and_advance, deadline_exceeded,
};
use crate::error::{BackendError, StoreError, StoreResult};
use crate::types::{EntityId, EntityRecord, OperationKind, PartitionKey, Revision, RevisionLog};

use super::backend::{BACKEND_NAME, FileBackend, FileStore, corrupt, io_error};
use super::layout::FileLayout;
use super::lock::FileLockGuard;

fn check_deadline(deadline: Option<Instant>, operation: &str) -> StoreResult<()> {
    if deadline.is_some_and(|d| Instant::now() >= d) {
        return Err(deadline_exceeded(BACKEND_NAME, operation));
    }
    Ok(())
}

/// Converts the call deadline to a wall-clock instant usable off the runtime.
fn blocking_deadline(ctx: &CallContext) -> Option<Instant> {
    ctx.remaining().map(|left| Instant::now() + left)
}

impl FileStore {
    fn read_record(&self, path: &Path) -> StoreResult<Option<EntityRecord>> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| corrupt(path, e)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read record", path, e)),
        }
    }

    pub(crate) fn load(&self, id: &EntityId, partition_key: &PartitionKey) -> StoreResult<Option<EntityRecord>> {
        self.read_record(&self.layout.record_path(id, partition_key))
    }

    /// Commits `next` and its revision.
    ///
    /// The revision line is made durable before the record rename, so a log
    /// entry above the stored version marks a write that never committed.
    /// The deadline is checked once the temp file is durable; past that
    /// point the write completes.
    fn commit(
        &self,
        current: Option<&EntityRecord>,
        next: &EntityRecord,
        operation: OperationKind,
        deadline: Option<Instant>,
    ) -> StoreResult<()> {
        let (id, partition_key) = (next.id(), next.partition_key());
        let target = self.layout.record_path(id, partition_key);
        let temp = self.layout.temp_path(id, partition_key);
        let bytes = serde_json::to_vec_pretty(next)?;
        let revision = Revision::from_record(next, operation, current);

        let written = File::create(&temp)
            .and_then(|mut file| {
                file.write_all(&bytes)?;
                file.sync_all()
            })
            .map_err(|e| io_error("write temp file", &temp, e))
            .and_then(|()| check_deadline(deadline, &operation.to_string()))
            .and_then(|()| self.append_revision(current, &revision))
            .and_then(|()| {
                fs::rename(&temp, &target).map_err(|e| io_error("rename record", &target, e))
            });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        sync_dir(&self.layout.partition_dir(partition_key));
        Ok(())
    }

    /// Reads the log entries of committed writes, up to version `committed`.
    ///
    /// Returns them with the byte length of the prefix that holds them.
    /// Anything past that prefix is a torn final line or the revision of a
    /// write whose record never landed.
    fn scan_log(
        &self,
        id: &EntityId,
        partition_key: &PartitionKey,
        committed: Option<u64>,
    ) -> StoreResult<(Vec<Revision>, u64)> {
        let path = self.layout.revisions_path(id, partition_key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(io_error("read revisions", &path, e)),
        };

        let mut entries = Vec::new();
        let mut keep = 0usize;
        for line in bytes.split_inclusive(|b| *b == b'\n') {
            let Some(body) = line.strip_suffix(b"\n") else {
                tracing::warn!(
                    backend = BACKEND_NAME,
                    path = %path.display(),
                    bytes = line.len(),
                    "ignoring torn revision line"
                );
                break;
            };
            if !body.iter().all(u8::is_ascii_whitespace) {
                let revision: Revision =
                    serde_json::from_slice(body).map_err(|e| corrupt(&path, e))?;
                if committed.is_none_or(|version| revision.version > version) {
                    tracing::debug!(
                        backend = BACKEND_NAME,
                        path = %path.display(),
                        version = revision.version,
                        "ignoring revision of uncommitted write"
                    );
                    break;
                }
                entries.push(revision);
            }
            keep += line.len();
        }
        Ok((entries, u64::try_from(keep).unwrap_or(u64::MAX)))
    }

    /// Appends `revision` after the committed entries of the log.
    ///
    /// If the log lost the revision of `current`, it is rebuilt from the
    /// record first so the trail stays consecutive.
    fn append_revision(&self, current: Option<&EntityRecord>, revision: &Revision) -> StoreResult<()> {
        let (id, partition_key) = (&revision.entity_id, &revision.partition_key);
        let path = self.layout.revisions_path(id, partition_key);
        let (entries, keep) = self.scan_log(id, partition_key, current.map(EntityRecord::version))?;

        let mut lines = Vec::new();
        if let Some(current) = current {
            let next = entries.last().map(|r| r.version + 1).unwrap_or(0);
            if next == current.version() {
                tracing::warn!(
                    backend = BACKEND_NAME,
                    entity_id = %id,
                    version = current.version(),
                    "rebuilding missing revision from the stored record"
                );
                serde_json::to_writer(&mut lines, &Revision::recovered(current))?;
                lines.push(b'\n');
            }
        }
        serde_json::to_writer(&mut lines, revision)?;
        lines.push(b'\n');

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                if file.metadata()?.len() > keep {
                    file.set_len(keep)?;
                }
                file.write_all(&lines)?;
                file.sync_data()
            })
            .map_err(|e| io_error("append revision", &path, e))
    }

    fn lock(&self, id: &EntityId, partition_key: &PartitionKey, deadline: Option<Instant>) -> StoreResult<FileLockGuard> {
        FileLockGuard::acquire(&self.layout.lock_path(id, partition_key), id, self.lock, deadline)
    }

    pub(crate) fn create(&self, record: EntityRecord, deadline: Option<Instant>) -> StoreResult<EntityRecord> {
        let (id, partition_key) = (record.id().clone(), record.partition_key().clone());
        let _lock = self.lock(&id, &partition_key, deadline)?;

        let current = self.load(&id, &partition_key)?;
        check_and_advance(
            &id,
            &partition_key,
            CurrentVersion::of(current.as_ref()),
            ExpectedVersion::Absent,
        )?;
        let stored = record.stamp_created(Utc::now());
        self.commit(None, &stored, OperationKind::Create, deadline)?;
        Ok(stored)
    }

    /// Runs lock, read, version check and commit for an existing entity.
    pub(crate) fn write_existing<F>(
        &self,
        id: &EntityId,
        partition_key: &PartitionKey,
        expected: u64,
        operation: OperationKind,
        deadline: Option<Instant>,
        build: F,
    ) -> StoreResult<EntityRecord>
    where
        F: FnOnce(&EntityRecord, u64) -> EntityRecord,
    {
        let _lock = self.lock(id, partition_key, deadline)?;

        let current = self.load(id, partition_key)?;
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
        self.commit(Some(&current), &next, operation, deadline)?;
        Ok(next)
    }

    pub(crate) fn revisions(&self, id: &EntityId, partition_key: &PartitionKey) -> StoreResult<RevisionLog> {
        let Some(record) = self.load(id, partition_key)? else {
            return Err(StoreError::not_found(id, partition_key));
        };
        let (entries, _) = self.scan_log(id, partition_key, Some(record.version()))?;
        RevisionLog::for_record(&record, entries)
    }

    /// Lists record files, sorted by partition then file name.
    pub(crate) fn record_paths(&self, partition_key: Option<&PartitionKey>) -> StoreResult<Vec<PathBuf>> {
        let dirs = match partition_key {
            Some(pk) => vec![self.layout.partition_dir(pk)],
            None => {
                let root = self.layout.root();
                let mut dirs = Vec::new();
                for entry in fs::read_dir(root).map_err(|e| io_error("list root", root, e))? {
                    let entry = entry.map_err(|e| io_error("list root", root, e))?;
                    let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                    let visible = entry
                        .file_name()
                        .to_str()
                        .is_some_and(FileLayout::is_partition_dir_name);
                    if is_dir && visible {
                        dirs.push(entry.path());
                    }
                }
                dirs.sort();
                dirs
            }
        };

        let mut paths = Vec::new();
        for dir in dirs {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(e) => return Err(io_error("list partition", &dir, e)),
            };
            let mut found = Vec::new();
            for entry in entries {
                let path = entry.map_err(|e| io_error("list partition", &dir, e))?.path();
                if FileLayout::is_record_file(&path) {
                    found.push(path);
                }
            }
            found.sort();
            paths.extend(found);
        }
        Ok(paths)
    }

    pub(crate) fn probe(&self) -> StoreResult<()> {
        let root = self.layout.root();
        let probe = root.join(format!(".probe-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&probe, b"probe").map_err(|e| io_error("write probe", &probe, e))?;
        fs::remove_file(&probe).map_err(|e| io_error("remove probe", &probe, e))
    }
}

/// Flushes the directory entry after a rename. Best effort.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(path = %dir.display(), error = %e, "directory sync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn validate_key(id: &EntityId, partition_key: &PartitionKey) -> StoreResult<()> {
    id.validate()?;
    partition_key.validate()
}

#[async_trait]
impl StoreBackend for FileBackend {
    fn kind(&self) -> StoreType {
        StoreType::LocalFile
    }

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn capabilities(&self) -> Vec<StoreCapability> {
        vec![
            StoreCapability::LockedWrite,
            StoreCapability::CrossProcessLocking,
            StoreCapability::PartitionScan,
            StoreCapability::Revisions,
        ]
    }

    async fn create(&self, ctx: &CallContext, record: EntityRecord) -> StoreResult<EntityRecord> {
        record.validate()?;
        ctx.check(BACKEND_NAME, "create")?;
        let deadline = blocking_deadline(ctx);
        let stored = self.blocking(move |store| store.create(record, deadline)).await?;

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
        validate_key(id, partition_key)?;
        let (key_id, key_pk) = (id.clone(), partition_key.clone());
        let stored = ctx
            .run(
                BACKEND_NAME,
                "read",
                self.blocking(move |store| store.load(&key_id, &key_pk)),
            )
            .await?;
        match stored {
            Some(record) if !record.is_deleted() => Ok(record),
            _ => Err(StoreError::not_found(id, partition_key)),
        }
    }

    async fn update(&self, ctx: &CallContext, record: EntityRecord) -> StoreResult<EntityRecord> {
        record.validate()?;
        ctx.check(BACKEND_NAME, "update")?;
        let expected = record.version();
        let (id, partition_key) = (record.id().clone(), record.partition_key().clone());
        let payload = record.into_payload();
        let deadline = blocking_deadline(ctx);
        let now = Utc::now();

        let updated = self
            .blocking(move |store| {
                store.write_existing(
                    &id,
                    &partition_key,
                    expected,
                    OperationKind::Update,
                    deadline,
                    move |current, version| current.next_version(version, payload, now),
                )
            })
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
        validate_key(id, partition_key)?;
        ctx.check(BACKEND_NAME, "delete")?;
        let (key_id, key_pk) = (id.clone(), partition_key.clone());
        let deadline = blocking_deadline(ctx);
        let now = Utc::now();

        let tombstone = self
            .blocking(move |store| {
                store.write_existing(
                    &key_id,
                    &key_pk,
                    expected_version,
                    OperationKind::Delete,
                    deadline,
                    move |current, version| current.tombstone(version, now),
                )
            })
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
        if let Some(pk) = partition_key {
            pk.validate()?;
        }
        let scope = partition_key.cloned();
        let paths = ctx
            .run(
                BACKEND_NAME,
                "query",
                self.blocking(move |store| store.record_paths(scope.as_ref())),
            )
            .await?;

        let store = self.store.clone();
        let filter = filter.clone();
        let stream = stream::iter(paths)
            .then(move |path| {
                let store = store.clone();
                async move {
                    tokio::task::spawn_blocking(move || store.read_record(&path))
                        .await
                        .map_err(BackendError::from)?
                }
            })
            .filter_map(move |item| {
                let result = match item {
                    // Deleted between listing and read, or a tombstone.
                    Ok(None) => None,
                    Ok(Some(record)) if record.is_deleted() => None,
                    Ok(Some(record)) => filter.matches(&record).then_some(Ok(record)),
                    Err(e) => Some(Err(e)),
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
        validate_key(id, partition_key)?;
        let (key_id, key_pk) = (id.clone(), partition_key.clone());
        ctx.run(
            BACKEND_NAME,
            "revisions",
            self.blocking(move |store| store.revisions(&key_id, &key_pk)),
        )
        .await
    }

    async fn probe(&self, ctx: &CallContext) -> StoreResult<()> {
        ctx.run(BACKEND_NAME, "probe", self.blocking(|store| store.probe()))
            .await
    }
}
