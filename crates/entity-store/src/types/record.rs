//! The canonical in-memory representation of a stored entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::PartitionRouter;
use crate::error::{StoreResult, ValidationError};

use super::id::{EntityId, PartitionKey};

/// An application entity with persistence metadata.
///
/// `EntityRecord` wraps an opaque JSON payload (always an object) with:
///
/// - **Identity**: a sortable [`EntityId`] and a [`PartitionKey`]
/// - **Versioning**: a counter that starts at 0 and is the optimistic
///   concurrency token for the next write
/// - **Timestamps**: creation and last mutation, both owned by the store
///
/// # Examples
///
/// ```
/// use helios_entity_store::types::EntityRecord;
/// use serde_json::json;
///
/// let record = EntityRecord::new(json!({"name": "a"})).unwrap();
/// assert_eq!(record.version(), 0);
/// assert!(record.partition_key().is_default());
/// assert_eq!(record.created_at(), record.updated_at());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    id: EntityId,

    #[serde(default)]
    partition_key: PartitionKey,

    version: u64,

    created_at: DateTime<Utc>,

    updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    deleted_at: Option<DateTime<Utc>>,

    payload: Value,
}

impl EntityRecord {
    /// Creates a new record in the default partition with a fresh id.
    ///
    /// # Errors
    ///
    /// `ValidationError` if the payload is `null` or not a JSON object.
    pub fn new(payload: Value) -> StoreResult<Self> {
        validate_payload(&payload)?;
        let now = Utc::now();
        Ok(Self {
            id: EntityId::generate(),
            partition_key: PartitionKey::default(),
            version: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            payload,
        })
    }

    /// Creates a new record and assigns its partition key with `router`.
    ///
    /// # Errors
    ///
    /// `ValidationError` if the payload is invalid or the router cannot
    /// derive a partition key from it.
    pub fn routed(payload: Value, router: &PartitionRouter) -> StoreResult<Self> {
        let mut record = Self::new(payload)?;
        record.partition_key = router.route(&record)?;
        Ok(record)
    }

    /// Replaces the generated id with a caller-supplied one.
    pub fn with_id(mut self, id: impl Into<EntityId>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets a caller-supplied partition key.
    pub fn with_partition_key(mut self, partition_key: impl Into<PartitionKey>) -> Self {
        self.partition_key = partition_key.into();
        self
    }

    /// Replaces the payload, keeping identity and version.
    ///
    /// This is the usual way to prepare an update: read, replace the
    /// payload, and submit; the carried version becomes the expected one.
    pub fn with_payload(mut self, payload: Value) -> StoreResult<Self> {
        validate_payload(&payload)?;
        self.payload = payload;
        Ok(self)
    }

    /// Returns the entity id.
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Returns the partition key.
    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    /// Returns the version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns when the entity was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns when the entity was last mutated.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns when the entity was deleted, if it is a tombstone.
    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    /// Returns `true` if this is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns the payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns a mutable reference to the payload.
    pub fn payload_mut(&mut self) -> &mut Value {
        &mut self.payload
    }

    /// Consumes the record and returns the payload.
    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Checks identity and payload before a write.
    pub fn validate(&self) -> StoreResult<()> {
        self.id.validate()?;
        self.partition_key.validate()?;
        validate_payload(&self.payload)
    }

    /// Resets store-owned metadata for a first write at `now`.
    pub(crate) fn stamp_created(mut self, now: DateTime<Utc>) -> Self {
        self.version = 0;
        self.created_at = now;
        self.updated_at = now;
        self.deleted_at = None;
        self
    }

    /// Produces the next version of `self` carrying `payload`.
    ///
    /// `self` is the stored record; identity and `created_at` come from it.
    pub(crate) fn next_version(&self, version: u64, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: self.id.clone(),
            partition_key: self.partition_key.clone(),
            version,
            created_at: self.created_at,
            updated_at: now,
            deleted_at: None,
            payload,
        }
    }

    /// Produces the tombstone that replaces `self` on delete.
    pub(crate) fn tombstone(&self, version: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: self.id.clone(),
            partition_key: self.partition_key.clone(),
            version,
            created_at: self.created_at,
            updated_at: now,
            deleted_at: Some(now),
            payload: self.payload.clone(),
        }
    }
}

fn validate_payload(payload: &Value) -> StoreResult<()> {
    match payload {
        Value::Object(_) => Ok(()),
        Value::Null => Err(ValidationError::MissingPayload.into()),
        other => Err(ValidationError::PayloadNotObject {
            found: json_type_name(other).to_string(),
        }
        .into()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
