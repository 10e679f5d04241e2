//! Document database backend.
//!
//! Entities are stored one document per entity, keyed by
//! `<partition>:<id>`, with the version promoted to a top-level field that
//! writes precondition on. Each document also carries the revision that
//! produced it; revisions are copied from there into a sibling collection.
//!
//! # Connection strings
//!
//! | URI | Client |
//! |-----|--------|
//! | `memory://<name>` | [`MemoryDocumentClient`], shared per name within the process |
//! | `mongodb://...`, `mongodb+srv://...` | `MongoDocumentClient` (feature `mongodb`) |

mod backend;
mod client;
mod memory;
#[cfg(feature = "mongodb")]
mod mongo;
mod storage;

pub use backend::{DocumentBackend, DocumentBackendConfig};
pub use client::{
    DocumentApi, DocumentClientError, DocumentStream, StoredDocument, StoredRevision, document_key,
};
pub use memory::MemoryDocumentClient;
#[cfg(feature = "mongodb")]
pub use mongo::MongoDocumentClient;

pub(crate) use backend::default_collection;
