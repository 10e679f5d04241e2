//! Key-value table backend.
//!
//! Each entity is one row addressed by `(partition_key, id)` with a visible
//! `version` column; revisions are rows in a sibling table.
//!
//! # Connection strings
//!
//! | URI | Client | Conditional replace |
//! |-----|--------|---------------------|
//! | `sqlite://<path>` | [`SqliteTableClient`] (feature `sqlite`) | yes |
//! | `sqlite::memory:` | [`SqliteTableClient`], private in-memory database | yes |
//! | `memory://<name>` | [`MemoryTableClient`], shared per name within the process | no |

mod backend;
mod client;
mod lock;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;
mod storage;

pub use backend::{TableBackend, TableBackendConfig};
pub use client::{RowStream, TableApi, TableClientError, TableRow};
pub use memory::MemoryTableClient;
#[cfg(feature = "sqlite")]
pub use sqlite::{SCHEMA_VERSION, SqliteTableClient, SqliteTableConfig};
