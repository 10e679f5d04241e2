//! On-disk layout of the file backend.
//!
//! ```text
//! <root>/
//!   <partition>/                   "_default" for the default partition
//!     <id>.json                    current record, version included
//!     <id>.revisions.jsonl         append-only revision log, one JSON per line
//!     <id>.lock                    present while a writer holds the entity
//!     .<id>.<nonce>.tmp            in-flight write, renamed over <id>.json
//! ```
//!
//! Ids and partition keys are validated before they reach this module, so
//! they never contain separators or start with a dot.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::types::{EntityId, PartitionKey};

const RECORD_EXT: &str = "json";

#[derive(Debug, Clone)]
pub(crate) struct FileLayout {
    root: PathBuf,
}

impl FileLayout {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn partition_dir(&self, partition_key: &PartitionKey) -> PathBuf {
        self.root.join(partition_key.segment())
    }

    pub(crate) fn record_path(&self, id: &EntityId, partition_key: &PartitionKey) -> PathBuf {
        self.partition_dir(partition_key)
            .join(format!("{}.{}", id, RECORD_EXT))
    }

    pub(crate) fn revisions_path(&self, id: &EntityId, partition_key: &PartitionKey) -> PathBuf {
        self.partition_dir(partition_key)
            .join(format!("{}.revisions.jsonl", id))
    }

    pub(crate) fn lock_path(&self, id: &EntityId, partition_key: &PartitionKey) -> PathBuf {
        self.partition_dir(partition_key).join(format!("{}.lock", id))
    }

    pub(crate) fn temp_path(&self, id: &EntityId, partition_key: &PartitionKey) -> PathBuf {
        self.partition_dir(partition_key)
            .join(format!(".{}.{}.tmp", id, Uuid::new_v4().simple()))
    }

    /// Returns `true` for canonical record files (not logs, locks or temps).
    pub(crate) fn is_record_file(path: &Path) -> bool {
        let visible = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !n.starts_with('.'));
        visible && path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT)
    }

    /// Returns `true` for directory names that can hold a partition.
    pub(crate) fn is_partition_dir_name(name: &str) -> bool {
        !name.is_empty() && !name.starts_with('.')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_partition_dir() {
        let layout = FileLayout::new("/data");
        let path = layout.record_path(&EntityId::new("a1"), &PartitionKey::default());
        assert_eq!(path, PathBuf::from("/data/_default/a1.json"));
    }

    #[test]
    fn test_named_partition_paths() {
        let layout = FileLayout::new("/data");
        let (id, pk) = (EntityId::new("a1"), PartitionKey::new("p0003"));
        assert_eq!(
            layout.revisions_path(&id, &pk),
            PathBuf::from("/data/p0003/a1.revisions.jsonl")
        );
        assert_eq!(layout.lock_path(&id, &pk), PathBuf::from("/data/p0003/a1.lock"));
        let temp = layout.temp_path(&id, &pk);
        assert_eq!(temp.parent(), Some(Path::new("/data/p0003")));
        assert!(!FileLayout::is_record_file(&temp));
    }

    #[test]
    fn test_is_record_file() {
        assert!(FileLayout::is_record_file(Path::new("/d/p/a1.json")));
        assert!(!FileLayout::is_record_file(Path::new("/d/p/a1.revisions.jsonl")));
        assert!(!FileLayout::is_record_file(Path::new("/d/p/a1.lock")));
        assert!(!FileLayout::is_record_file(Path::new("/d/p/.a1.abc.tmp")));
    }
}
