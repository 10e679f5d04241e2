//! Revision trail types.
//!
//! Every accepted mutation appends one [`Revision`] carrying a full payload
//! snapshot. A [`RevisionLog`] holds the revisions of a single entity in
//! strictly consecutive version order.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreResult, ValidationError};

use super::id::{EntityId, PartitionKey};
use super::record::EntityRecord;

/// The kind of mutation that produced a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// The entity was created.
    Create,
    /// The entity payload was replaced.
    Update,
    /// The entity was deleted.
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// A single immutable entry in an entity's revision trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// The entity this revision belongs to.
    pub entity_id: EntityId,

    /// The partition the entity lives in.
    #[serde(default)]
    pub partition_key: PartitionKey,

    /// The version written by the mutation.
    pub version: u64,

    /// When the mutation was accepted.
    pub timestamp: DateTime<Utc>,

    /// The mutation kind.
    pub operation: OperationKind,

    /// Human-readable description of what changed.
    pub change_summary: String,

    /// Payload at this version. `None` for deletions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
}

impl Revision {
    /// Builds the revision describing how `record` came to be.
    ///
    /// `previous` is the stored record before the mutation, if any; it is
    /// used to summarize which top-level fields changed.
    pub fn from_record(
        record: &EntityRecord,
        operation: OperationKind,
        previous: Option<&EntityRecord>,
    ) -> Self {
        let snapshot = match operation {
            OperationKind::Delete => None,
            _ => Some(record.payload().clone()),
        };
        Self {
            entity_id: record.id().clone(),
            partition_key: record.partition_key().clone(),
            version: record.version(),
            timestamp: record.updated_at(),
            operation,
            change_summary: summarize(operation, previous.map(|p| p.payload()), record.payload()),
            snapshot,
        }
    }
}

impl Revision {
    /// Rebuilds the revision of a stored record whose log entry was lost.
    ///
    /// The snapshot is exact; the change summary cannot name fields.
    pub fn recovered(record: &EntityRecord) -> Self {
        let operation = if record.is_deleted() {
            OperationKind::Delete
        } else if record.version() == 0 {
            OperationKind::Create
        } else {
            OperationKind::Update
        };
        Self::from_record(record, operation, None)
    }
}

fn summarize(operation: OperationKind, previous: Option<&Value>, next: &Value) -> String {
    match operation {
        OperationKind::Create => {
            let fields = next.as_object().map(|o| o.len()).unwrap_or(0);
            format!("created with {} field(s)", fields)
        }
        OperationKind::Delete => "deleted".to_string(),
        OperationKind::Update => {
            let (Some(before), Some(after)) =
                (previous.and_then(Value::as_object), next.as_object())
            else {
                return "payload replaced".to_string();
            };
            let mut changed: Vec<&str> = after
                .iter()
                .filter(|(k, v)| before.get(k.as_str()) != Some(*v))
                .map(|(k, _)| k.as_str())
                .chain(
                    before
                        .keys()
                        .filter(|k| !after.contains_key(k.as_str()))
                        .map(String::as_str),
                )
                .collect();
            changed.sort_unstable();
            if changed.is_empty() {
                "no field changes".to_string()
            } else {
                format!("changed: {}", changed.join(", "))
            }
        }
    }
}

/// The ordered revision trail of one entity.
///
/// Appends must be strictly consecutive: the first revision is version 0 and
/// each following one is exactly one higher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionLog {
    entity_id: EntityId,
    entries: Vec<Revision>,
}

impl RevisionLog {
    /// Creates an empty log for `entity_id`.
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            entries: Vec::new(),
        }
    }

    /// Rebuilds a log from stored entries, checking their order.
    pub fn from_entries(entity_id: EntityId, entries: Vec<Revision>) -> StoreResult<Self> {
        let mut log = Self::new(entity_id);
        for entry in entries {
            log.append(entry)?;
        }
        Ok(log)
    }

    /// Rebuilds the log of a committed record from what the store holds.
    ///
    /// Revisions are written before the record they describe, so entries
    /// above the record's version belong to writes that never committed and
    /// are dropped. For a repeated version the later entry wins. If only the
    /// record's own revision is missing, it is rebuilt from the record.
    pub fn for_record(record: &EntityRecord, entries: Vec<Revision>) -> StoreResult<Self> {
        let mut by_version = BTreeMap::new();
        for entry in entries {
            if entry.version <= record.version() {
                by_version.insert(entry.version, entry);
            }
        }
        let mut log = Self::from_entries(record.id().clone(), by_version.into_values().collect())?;
        if log.next_version() == record.version() {
            tracing::warn!(
                entity_id = %record.id(),
                version = record.version(),
                "rebuilding missing revision from the stored record"
            );
            log.append(Revision::recovered(record))?;
        }
        Ok(log)
    }

    /// Appends a revision.
    ///
    /// # Errors
    ///
    /// `ValidationError::RevisionOutOfOrder` if the revision does not carry
    /// the next expected version, or belongs to a different entity. The log
    /// is left unchanged. This indicates a bug in the caller.
    pub fn append(&mut self, revision: Revision) -> StoreResult<&Revision> {
        let expected = self.next_version();
        if revision.version != expected || revision.entity_id != self.entity_id {
            tracing::error!(
                entity_id = %self.entity_id,
                expected,
                actual = revision.version,
                "revision appended out of order"
            );
            return Err(ValidationError::RevisionOutOfOrder {
                id: self.entity_id.clone(),
                expected,
                actual: revision.version,
            }
            .into());
        }
        self.entries.push(revision);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Returns the version the next appended revision must carry.
    pub fn next_version(&self) -> u64 {
        self.entries.last().map(|r| r.version + 1).unwrap_or(0)
    }

    /// Returns the entity id.
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Returns all revisions, oldest first.
    pub fn entries(&self) -> &[Revision] {
        &self.entries
    }

    /// Returns the revision written at `version`.
    pub fn get(&self, version: u64) -> Option<&Revision> {
        usize::try_from(version)
            .ok()
            .and_then(|i| self.entries.get(i))
    }

    /// Returns the most recent revision.
    pub fn latest(&self) -> Option<&Revision> {
        self.entries.last()
    }

    /// Returns the number of revisions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no revision has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the log and returns its entries.
    pub fn into_entries(self) -> Vec<Revision> {
        self.entries
    }
}
