//! Entity and partition identifiers.
//!
//! Both are opaque string newtypes. [`EntityId`] values generated by the
//! store are UUID v7, which sort by creation time, so backends with
//! insertion-ordered keys append instead of splitting index pages.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreResult, ValidationError};

/// Directory name used by file-based layouts for the default partition.
pub const DEFAULT_PARTITION_DIR: &str = "_default";

const MAX_KEY_LEN: usize = 255;

/// A globally unique, monotonically sortable entity identifier.
///
/// # Examples
///
/// ```
/// use helios_entity_store::types::EntityId;
///
/// let a = EntityId::generate();
/// let b = EntityId::generate();
/// assert!(a < b);
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wraps an existing identifier without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh time-ordered identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks that the identifier can be used as a storage key on every
    /// backend, including as a file name.
    pub fn validate(&self) -> StoreResult<()> {
        check_key(&self.0, false).map_err(|message| {
            ValidationError::InvalidId {
                id: self.0.clone(),
                message,
            }
            .into()
        })
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A shard/grouping key. The empty string is the default partition.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Wraps an existing partition key without validation.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the partition key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the default (empty) partition.
    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the directory/prefix segment used for this partition.
    pub fn segment(&self) -> &str {
        if self.is_default() {
            DEFAULT_PARTITION_DIR
        } else {
            &self.0
        }
    }

    /// Checks that the key is addressable on every backend.
    pub fn validate(&self) -> StoreResult<()> {
        if self.is_default() {
            return Ok(());
        }
        let result = if self.0 == DEFAULT_PARTITION_DIR {
            Err(format!("'{}' is reserved", DEFAULT_PARTITION_DIR))
        } else {
            check_key(&self.0, true)
        };
        result.map_err(|message| {
            ValidationError::InvalidPartitionKey {
                partition_key: self.0.clone(),
                message,
            }
            .into()
        })
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionKey({:?})", self.0)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

impl From<&str> for PartitionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PartitionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

fn check_key(value: &str, allow_empty: bool) -> Result<(), String> {
    if value.is_empty() {
        return if allow_empty {
            Ok(())
        } else {
            Err("must not be empty".to_string())
        };
    }
    if value.len() > MAX_KEY_LEN {
        return Err(format!("longer than {} bytes", MAX_KEY_LEN));
    }
    if value.starts_with('.') {
        return Err("must not start with '.'".to_string());
    }
    if let Some(c) = value
        .chars()
        .find(|c| matches!(c, '/' | '\\' | ':') || c.is_control())
    {
        return Err(format!("contains forbidden character {:?}", c));
    }
    Ok(())
}
