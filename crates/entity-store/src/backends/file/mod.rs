//! Local file backend.
//!
//! One JSON file per entity under `<root>/<partition>/`, a JSON Lines
//! revision log beside it, and a lock file per entity that serializes
//! writers across processes sharing the directory.
//!
//! # Write sequence
//!
//! 1. Acquire `<id>.lock` (exclusive create, retried; stale locks broken)
//! 2. Read `<id>.json` and check the expected version
//! 3. Write `.<id>.<nonce>.tmp` and fsync it
//! 4. Check the deadline, then rename over `<id>.json`
//! 5. Append the revision to `<id>.revisions.jsonl`
//! 6. Remove the lock
//!
//! A crash before step 4 leaves the previous record intact; a stray temp
//! file is ignored by reads and queries.

mod backend;
mod layout;
mod lock;
mod storage;

pub use backend::{FileBackend, FileBackendConfig};
