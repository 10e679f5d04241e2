//! Optimistic concurrency control.
//!
//! [`check_and_advance`] decides whether a write may proceed by comparing the
//! version the caller expects with the version currently stored. Backends
//! must run it and perform the physical write as one atomic step: either via
//! a native conditional write that re-checks the same version, or inside an
//! exclusive per-entity lock.

use std::fmt;

use crate::error::{StoreError, StoreResult, ValidationError};
use crate::types::{EntityId, EntityRecord, PartitionKey};

/// The version a writer believes is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectedVersion {
    /// The entity must not exist yet (creation).
    Absent,
    /// The entity must exist at exactly this version.
    Exactly(u64),
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Absent => write!(f, "absent"),
            ExpectedVersion::Exactly(v) => write!(f, "{}", v),
        }
    }
}

/// What is actually stored for an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CurrentVersion {
    /// Nothing was ever stored under this id.
    Missing,
    /// A live entity at this version.
    Live(u64),
    /// A tombstone at this version. The id is retired.
    Deleted(u64),
}

impl CurrentVersion {
    /// Classifies an optional stored record.
    pub fn of(stored: Option<&EntityRecord>) -> Self {
        match stored {
            None => CurrentVersion::Missing,
            Some(r) if r.is_deleted() => CurrentVersion::Deleted(r.version()),
            Some(r) => CurrentVersion::Live(r.version()),
        }
    }
}

/// Validates `expected` against `current` and returns the version the write
/// must store.
///
/// | expected | current | outcome |
/// |---|---|---|
/// | `Absent` | `Missing` | `Ok(0)` |
/// | `Absent` | `Live` / `Deleted` | `AlreadyExists` |
/// | `Exactly(v)` | `Missing` / `Deleted` | `NotFound` |
/// | `Exactly(v)` | `Live(c)`, `v != c` | `ConcurrencyConflict` |
/// | `Exactly(v)` | `Live(v)` | `Ok(v + 1)` |
///
/// # Examples
///
/// ```
/// use helios_entity_store::core::{check_and_advance, CurrentVersion, ExpectedVersion};
/// use helios_entity_store::types::{EntityId, PartitionKey};
///
/// let id = EntityId::new("a");
/// let pk = PartitionKey::default();
/// assert_eq!(
///     check_and_advance(&id, &pk, CurrentVersion::Live(3), ExpectedVersion::Exactly(3)).unwrap(),
///     4
/// );
/// assert!(check_and_advance(&id, &pk, CurrentVersion::Live(4), ExpectedVersion::Exactly(3)).is_err());
/// ```
pub fn check_and_advance(
    id: &EntityId,
    partition_key: &PartitionKey,
    current: CurrentVersion,
    expected: ExpectedVersion,
) -> StoreResult<u64> {
    match (expected, current) {
        (ExpectedVersion::Absent, CurrentVersion::Missing) => Ok(0),
        (ExpectedVersion::Absent, _) => Err(StoreError::already_exists(id, partition_key)),
        (ExpectedVersion::Exactly(_), CurrentVersion::Missing | CurrentVersion::Deleted(_)) => {
            Err(StoreError::not_found(id, partition_key))
        }
        (ExpectedVersion::Exactly(expected), CurrentVersion::Live(actual)) => {
            if expected != actual {
                tracing::warn!(
                    entity_id = %id,
                    partition = %partition_key,
                    expected,
                    actual,
                    "optimistic concurrency check rejected write"
                );
                return Err(StoreError::conflict(id, expected, actual));
            }
            actual
                .checked_add(1)
                .ok_or_else(|| ValidationError::VersionOverflow { id: id.clone() }.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ids() -> (EntityId, PartitionKey) {
        (EntityId::new("e1"), PartitionKey::new("p"))
    }

    fn kind(result: StoreResult<u64>) -> ErrorKind {
        result.unwrap_err().kind()
    }

    #[test]
    fn test_create_on_missing() {
        let (id, pk) = ids();
        assert_eq!(
            check_and_advance(&id, &pk, CurrentVersion::Missing, ExpectedVersion::Absent).unwrap(),
            0
        );
    }

    #[test]
    fn test_create_on_existing_or_retired() {
        let (id, pk) = ids();
        assert_eq!(
            kind(check_and_advance(&id, &pk, CurrentVersion::Live(0), ExpectedVersion::Absent)),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            kind(check_and_advance(&id, &pk, CurrentVersion::Deleted(2), ExpectedVersion::Absent)),
            ErrorKind::AlreadyExists
        );
    }

    #[test]
    fn test_update_on_missing_or_deleted() {
        let (id, pk) = ids();
        assert_eq!(
            kind(check_and_advance(&id, &pk, CurrentVersion::Missing, ExpectedVersion::Exactly(0))),
            ErrorKind::NotFound
        );
        assert_eq!(
            kind(check_and_advance(&id, &pk, CurrentVersion::Deleted(1), ExpectedVersion::Exactly(1))),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_stale_version_conflicts() {
        let (id, pk) = ids();
        let err = check_and_advance(&id, &pk, CurrentVersion::Live(1), ExpectedVersion::Exactly(0))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_future_version_conflicts() {
        let (id, pk) = ids();
        assert_eq!(
            kind(check_and_advance(&id, &pk, CurrentVersion::Live(1), ExpectedVersion::Exactly(5))),
            ErrorKind::ConcurrencyConflict
        );
    }

    #[test]
    fn test_matching_version_advances_by_one() {
        let (id, pk) = ids();
        for v in [0, 1, 41] {
            assert_eq!(
                check_and_advance(&id, &pk, CurrentVersion::Live(v), ExpectedVersion::Exactly(v))
                    .unwrap(),
                v + 1
            );
        }
    }

    #[test]
    fn test_overflow_is_validation_error() {
        let (id, pk) = ids();
        assert_eq!(
            kind(check_and_advance(
                &id,
                &pk,
                CurrentVersion::Live(u64::MAX),
                ExpectedVersion::Exactly(u64::MAX)
            )),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_current_version_of() {
        let record = EntityRecord::new(serde_json::json!({"a": 1})).unwrap();
        assert_eq!(CurrentVersion::of(None), CurrentVersion::Missing);
        assert_eq!(CurrentVersion::of(Some(&record)), CurrentVersion::Live(0));
        let dead = record.tombstone(1, chrono::Utc::now());
        assert_eq!(CurrentVersion::of(Some(&dead)), CurrentVersion::Deleted(1));
    }
}
