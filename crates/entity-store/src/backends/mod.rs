//! Backend implementations.
//!
//! Each backend implements [`StoreBackend`](crate::core::StoreBackend) over
//! one kind of storage. Driver-backed clients are gated behind feature
//! flags; the in-process clients are always available.
//!
//! # Available Backends
//!
//! | Backend | Store type | Clients | Conditional write |
//! |---------|------------|---------|-------------------|
//! | [`document`] | `document` | MongoDB (`mongodb`), in-memory | native, on the version field |
//! | [`table`] | `table` | SQLite (`sqlite`, default), in-memory | native on SQLite, per-key lock otherwise |
//! | [`file`] | `local-file` | local filesystem | per-entity lock file, cross-process |
//!
//! # Example
//!
//! ```no_run
//! use helios_entity_store::backends::file::{FileBackend, FileBackendConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = FileBackend::open(FileBackendConfig::new("./data/entities")).await?;
//! # Ok(())
//! # }
//! ```

pub mod document;
pub mod file;
pub mod table;
