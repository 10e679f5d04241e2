//! File backend configuration and construction.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, ConfigurationError, StoreError, StoreResult};

use super::layout::FileLayout;
use super::lock::LockOptions;

pub(crate) const BACKEND_NAME: &str = "file";

/// Local file backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBackendConfig {
    /// Directory holding one sub-directory per partition. Created on open.
    pub root_path: PathBuf,

    /// How long a write waits for another writer's lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Delay between lock attempts.
    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,

    /// Age after which a lock file is considered abandoned and broken.
    #[serde(default = "default_stale_lock_ms")]
    pub stale_lock_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_lock_retry_interval_ms() -> u64 {
    20
}

fn default_stale_lock_ms() -> u64 {
    30_000
}

impl FileBackendConfig {
    /// Creates a configuration rooted at `root_path` with default lock timing.
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
            stale_lock_ms: default_stale_lock_ms(),
        }
    }

    /// Sets the lock timeout.
    pub fn with_lock_timeout_ms(mut self, lock_timeout_ms: u64) -> Self {
        self.lock_timeout_ms = lock_timeout_ms;
        self
    }

    /// Sets the lock retry interval.
    pub fn with_lock_retry_interval_ms(mut self, lock_retry_interval_ms: u64) -> Self {
        self.lock_retry_interval_ms = lock_retry_interval_ms;
        self
    }

    /// Sets the stale lock threshold.
    pub fn with_stale_lock_ms(mut self, stale_lock_ms: u64) -> Self {
        self.stale_lock_ms = stale_lock_ms;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.root_path.as_os_str().is_empty() {
            return Err(ConfigurationError::MissingField {
                store_type: "local-file".to_string(),
                field: "root_path",
            });
        }
        if self.lock_retry_interval_ms == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "lock_retry_interval_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.stale_lock_ms <= self.lock_timeout_ms {
            tracing::warn!(
                stale_lock_ms = self.stale_lock_ms,
                lock_timeout_ms = self.lock_timeout_ms,
                "stale lock threshold does not exceed the lock timeout; live locks may be broken"
            );
        }
        Ok(())
    }

    pub(crate) fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.lock_timeout_ms),
            retry_interval: Duration::from_millis(self.lock_retry_interval_ms),
            stale_after: Duration::from_millis(self.stale_lock_ms),
        }
    }
}

/// Entity storage in a local directory tree.
///
/// Each entity is a JSON file replaced atomically (temp file, fsync,
/// rename) under an exclusive lock file, so writers in separate processes
/// sharing the directory are serialized per entity. Revisions are appended
/// to a JSON Lines file beside the record.
#[derive(Debug, Clone)]
pub struct FileBackend {
    pub(crate) config: FileBackendConfig,
    pub(crate) store: Arc<FileStore>,
}

/// Blocking half of the backend, shared with the blocking pool.
#[derive(Debug)]
pub(crate) struct FileStore {
    pub(crate) layout: FileLayout,
    pub(crate) lock: LockOptions,
}

impl FileBackend {
    /// Validates the configuration and creates the root directory.
    pub async fn open(config: FileBackendConfig) -> StoreResult<Self> {
        config.validate()?;
        let root = config.root_path.clone();
        tokio::task::spawn_blocking(move || prepare_root(&root))
            .await
            .map_err(BackendError::from)??;

        tracing::info!(
            backend = BACKEND_NAME,
            root = %config.root_path.display(),
            lock_timeout_ms = config.lock_timeout_ms,
            "opened file store"
        );
        let store = FileStore {
            layout: FileLayout::new(&config.root_path),
            lock: config.lock_options(),
        };
        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    /// Returns the backend configuration.
    pub fn config(&self) -> &FileBackendConfig {
        &self.config
    }

    /// Runs `f` against the blocking half on the blocking pool.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&FileStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(BackendError::from)?
    }
}

fn prepare_root(root: &Path) -> StoreResult<()> {
    fs::create_dir_all(root).map_err(|e| io_error("create root directory", root, e))?;
    let meta = fs::metadata(root).map_err(|e| io_error("stat root directory", root, e))?;
    if !meta.is_dir() {
        return Err(ConfigurationError::InvalidValue {
            field: "root_path",
            message: format!("{} is not a directory", root.display()),
        }
        .into());
    }
    Ok(())
}

pub(crate) fn io_error(operation: &str, path: &Path, err: io::Error) -> StoreError {
    StoreError::Unavailable(BackendError::Internal {
        backend_name: BACKEND_NAME.to_string(),
        message: format!("{} {}: {}", operation, path.display(), err),
        source: Some(Box::new(err)),
    })
}

pub(crate) fn corrupt(path: &Path, message: impl std::fmt::Display) -> StoreError {
    tracing::error!(backend = BACKEND_NAME, path = %path.display(), error = %message, "corrupt file");
    StoreError::Unavailable(BackendError::Corrupt {
        backend_name: BACKEND_NAME.to_string(),
        message: format!("{}: {}", path.display(), message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_config_defaults_from_json() {
        let config: FileBackendConfig =
            serde_json::from_str(r#"{"root_path": "/var/lib/entities"}"#).unwrap();
        assert_eq!(config, FileBackendConfig::new("/var/lib/entities"));
        assert_eq!(config.lock_timeout_ms, 5_000);
    }

    #[test]
    fn test_validate_rejects_empty_root() {
        let err = FileBackendConfig::new("").validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::MissingField {
                field: "root_path",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_rejects_zero_retry_interval() {
        let config = FileBackendConfig::new("/tmp/x").with_lock_retry_interval_ms(0);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_open_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("store");
        FileBackend::open(FileBackendConfig::new(&root)).await.unwrap();
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn test_open_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();
        let err = FileBackend::open(FileBackendConfig::new(&file))
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Configuration | ErrorKind::Unavailable
        ));
    }
}
