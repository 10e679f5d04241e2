//! Helios Entity Store
//!
//! This crate provides versioned entity persistence over heterogeneous
//! backing stores behind one async contract. Every mutation is guarded by
//! optimistic concurrency control and leaves a revision trail.
//!
//! # Features
//!
//! - **Multiple Backends**: document database, key-value table, local files
//! - **Optimistic Concurrency**: every record carries a version; writes name
//!   the version they expect and fail with a conflict when it has moved
//! - **Revisions**: an ordered, append-only log of snapshots per entity
//! - **Partition Routing**: deterministic partition keys from record content
//! - **Audit Capture**: an event per accepted mutation, delivered to a sink
//!
//! # Backend Features
//!
//! Enable driver-backed clients with feature flags in `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! helios-entity-store = { version = "0.1", features = ["mongodb"] }
//! ```
//!
//! Available features:
//! - `sqlite` (default) - SQLite client for the table backend
//! - `mongodb` - MongoDB client for the document backend
//! - `probe` - the `store-probe` binary
//!
//! # Architecture
//!
//! - [`types`] - Records, identifiers and revisions
//! - [`error`] - Error types for all operations
//! - [`core`] - The backend contract, concurrency guard, router, deadlines and audit boundary
//! - [`backends`] - Document, table and file implementations
//! - [`factory`] - Store selection from configuration
//!
//! # Quick Start
//!
//! ```
//! use helios_entity_store::core::{CallContext, StoreBackend};
//! use helios_entity_store::types::EntityRecord;
//! use helios_entity_store::{ErrorKind, StoreConfig, StoreFactory, StoreType};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), helios_entity_store::StoreError> {
//! let config = StoreConfig::new(StoreType::Document)
//!     .with_connection_string("memory://quick-start")
//!     .with_database_name("app");
//! let store = StoreFactory::open(&config).await?;
//! let ctx = CallContext::new();
//!
//! let created = store.create(&ctx, EntityRecord::new(json!({"name": "a"}))?).await?;
//! assert_eq!(created.version(), 0);
//!
//! let updated = store
//!     .update(&ctx, created.clone().with_payload(json!({"name": "b"}))?)
//!     .await?;
//! assert_eq!(updated.version(), 1);
//!
//! // A writer still holding version 0 loses.
//! let stale = created.with_payload(json!({"name": "c"}))?;
//! let err = store.update(&ctx, stale).await.unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
//! # Ok(())
//! # }
//! ```
//!
//! # Deadlines
//!
//! Every operation takes a [`CallContext`](core::CallContext). A call whose
//! deadline passes fails with `Unavailable` and leaves no partial write.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backends;
pub mod core;
pub mod error;
pub mod factory;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{ErrorKind, StoreError, StoreResult};
pub use factory::{StoreConfig, StoreFactory, StoreHandle};
pub use types::{EntityId, EntityRecord, PartitionKey, Revision, RevisionLog};

// Re-export core contract
pub use core::{AuditSink, CallContext, EntityFilter, PartitionRouter, StoreBackend, StoreType};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
