//! Storage contract and the pieces every backend shares.
//!
//! - [`StoreBackend`] - The uniform async CRUD + query contract
//! - [`check_and_advance`] - The optimistic concurrency guard
//! - [`PartitionRouter`] - Deterministic partition key assignment
//! - [`CallContext`] - Per-call deadline and log label
//! - [`EntityFilter`] - Query predicate
//! - [`AuditSink`] - Where mutation events go
//!
//! # Write path
//!
//! ```text
//! caller ──► StoreHandle ──► (route if default partition)
//!                │
//!                ▼
//!          StoreBackend::create / update / delete
//!                │  read current version
//!                │  check_and_advance(expected, current)
//!                │  commit record + revision  (native, or under a per-entity lock)
//!                ▼
//!          AuditSink::emit  (failures logged, never returned)
//! ```
//!
//! # Example: Implementing a Backend
//!
//! ```ignore
//! use async_trait::async_trait;
//! use helios_entity_store::core::{CallContext, StoreBackend, StoreType};
//! use helios_entity_store::types::EntityRecord;
//! use helios_entity_store::StoreResult;
//!
//! #[derive(Debug)]
//! struct MyBackend;
//!
//! #[async_trait]
//! impl StoreBackend for MyBackend {
//!     fn kind(&self) -> StoreType {
//!         StoreType::Document
//!     }
//!
//!     fn backend_name(&self) -> &'static str {
//!         "my-backend"
//!     }
//!
//!     async fn create(&self, ctx: &CallContext, record: EntityRecord) -> StoreResult<EntityRecord> {
//!         todo!()
//!     }
//!
//!     // ... implement other required methods
//! }
//! ```

pub mod audit;
pub mod backend;
pub mod concurrency;
pub mod context;
pub mod filter;
pub mod router;

pub use audit::{AuditError, AuditEvent, AuditSink, ChannelAuditSink, NoopAuditSink};
pub use backend::{EntityStream, StoreBackend, StoreCapability, StoreType};
pub use concurrency::{CurrentVersion, ExpectedVersion, check_and_advance};
pub use context::CallContext;
pub(crate) use context::{deadline_exceeded, millis};
pub use filter::EntityFilter;
pub use router::{DEFAULT_PARTITION_COUNT, MAX_PARTITION_COUNT, PartitionRouter};
