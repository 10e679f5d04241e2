//! Core types for the entity store.
//!
//! - [`EntityRecord`] - An application payload with identity, version, and timestamps
//! - [`EntityId`], [`PartitionKey`] - Identifiers
//! - [`Revision`], [`RevisionLog`] - The per-entity revision trail
//!
//! # Examples
//!
//! ```
//! use helios_entity_store::types::{EntityRecord, OperationKind, Revision, RevisionLog};
//! use serde_json::json;
//!
//! let record = EntityRecord::new(json!({"name": "a"})).unwrap();
//! let mut log = RevisionLog::new(record.id().clone());
//! log.append(Revision::from_record(&record, OperationKind::Create, None))
//!     .unwrap();
//! assert_eq!(log.next_version(), 1);
//! ```

mod id;
mod record;
mod revision;

pub use id::{DEFAULT_PARTITION_DIR, EntityId, PartitionKey};
pub use record::EntityRecord;
pub use revision::{OperationKind, Revision, RevisionLog};
