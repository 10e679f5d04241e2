//! Table backend configuration and construction.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, ConfigurationError, StoreError, StoreResult};

use super::client::{TableApi, TableClientError};
use super::lock::KeyLocks;
use super::memory::MemoryTableClient;

pub(crate) const BACKEND_NAME: &str = "table";

/// Table backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableBackendConfig {
    /// `sqlite://<path>`, `sqlite::memory:` or `memory://<name>`.
    pub connection_string: String,

    /// Table name. Revisions go to `<table>_revisions`.
    #[serde(default = "default_table")]
    pub table: String,

    /// How long a write waits for the per-key lock when the client has no
    /// conditional replace.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_table() -> String {
    "entities".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

impl TableBackendConfig {
    /// Creates a configuration with default table name and lock timeout.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            table: default_table(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }

    /// Sets the table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Sets the lock timeout.
    pub fn with_lock_timeout_ms(mut self, lock_timeout_ms: u64) -> Self {
        self.lock_timeout_ms = lock_timeout_ms;
        self
    }
}

/// Entity storage over a key-value table service.
///
/// Rows are addressed by `(partition_key, id)`. Updates use the client's
/// conditional replace when it has one; otherwise they run under an
/// in-process per-key lock, which only serializes writers in this process.
#[derive(Debug)]
pub struct TableBackend {
    pub(crate) config: TableBackendConfig,
    pub(crate) client: Arc<dyn TableApi>,
    pub(crate) locks: KeyLocks,
}

impl TableBackend {
    /// Builds the client named by the connection string.
    pub async fn open(config: TableBackendConfig) -> StoreResult<Self> {
        let client = connect(&config).await?;
        tracing::info!(
            backend = BACKEND_NAME,
            client = client.client_name(),
            table = %config.table,
            conditional_replace = client.supports_conditional_replace(),
            "opened table store"
        );
        Ok(Self::with_client(config, client))
    }

    /// Uses an already constructed client.
    pub fn with_client(config: TableBackendConfig, client: Arc<dyn TableApi>) -> Self {
        Self {
            config,
            client,
            locks: KeyLocks::default(),
        }
    }

    /// Returns the backend configuration.
    pub fn config(&self) -> &TableBackendConfig {
        &self.config
    }

    pub(crate) fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.config.lock_timeout_ms)
    }
}

async fn connect(config: &TableBackendConfig) -> StoreResult<Arc<dyn TableApi>> {
    let uri = config.connection_string.trim();
    if let Some(name) = uri.strip_prefix("memory://") {
        let table = format!("{}/{}", name, config.table);
        return Ok(Arc::new(MemoryTableClient::named(&table)));
    }
    if uri == "sqlite::memory:" || uri.starts_with("sqlite://") {
        return connect_sqlite(uri, config).await;
    }
    Err(ConfigurationError::InvalidValue {
        field: "connection_string",
        message: format!("unsupported table store URI '{}'", uri),
    }
    .into())
}

#[cfg(feature = "sqlite")]
async fn connect_sqlite(uri: &str, config: &TableBackendConfig) -> StoreResult<Arc<dyn TableApi>> {
    use super::sqlite::{SqliteTableClient, validate_table_name};

    validate_table_name(&config.table).map_err(|_| ConfigurationError::InvalidValue {
        field: "collection",
        message: format!(
            "'{}' is not a valid table name (letters, digits and '_' only)",
            config.table
        ),
    })?;
    let path = match uri.strip_prefix("sqlite://") {
        Some(path) if !path.is_empty() => path.to_string(),
        Some(_) => {
            return Err(ConfigurationError::InvalidValue {
                field: "connection_string",
                message: "sqlite:// requires a database path".to_string(),
            }
            .into());
        }
        None => ":memory:".to_string(),
    };
    let table = config.table.clone();
    let client = tokio::task::spawn_blocking(move || SqliteTableClient::open(path, &table))
        .await
        .map_err(BackendError::from)?
        .map_err(map_client_error)?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "sqlite"))]
async fn connect_sqlite(_uri: &str, _config: &TableBackendConfig) -> StoreResult<Arc<dyn TableApi>> {
    Err(ConfigurationError::Unsupported {
        store_type: "table".to_string(),
        message: "SQLite tables require the `sqlite` feature".to_string(),
    }
    .into())
}

/// Maps client failures that are not a precondition outcome.
pub(crate) fn map_client_error(err: TableClientError) -> StoreError {
    let backend_name = BACKEND_NAME.to_string();
    StoreError::Unavailable(match err {
        TableClientError::Unavailable(message) => BackendError::Unavailable {
            backend_name,
            message,
        },
        TableClientError::Corrupt(message) => BackendError::Corrupt {
            backend_name,
            message,
        },
        TableClientError::Internal(message) => BackendError::Internal {
            backend_name,
            message,
            source: None,
        },
        other @ (TableClientError::AlreadyExists
        | TableClientError::PreconditionFailed
        | TableClientError::Unsupported) => BackendError::Internal {
            backend_name,
            message: format!("unexpected client outcome: {:?}", other),
            source: None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_open_memory_has_no_conditional_replace() {
        let backend = TableBackend::open(TableBackendConfig::new("memory://table-open"))
            .await
            .unwrap();
        assert!(!backend.client.supports_conditional_replace());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_open_sqlite_memory() {
        let backend = TableBackend::open(TableBackendConfig::new("sqlite::memory:"))
            .await
            .unwrap();
        assert!(backend.client.supports_conditional_replace());
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_scheme() {
        let err = TableBackend::open(TableBackendConfig::new("postgres://x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_sqlite_rejects_bad_table_name() {
        let config = TableBackendConfig::new("sqlite::memory:").with_table("bad-name");
        let err = TableBackend::open(config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_sqlite_requires_path() {
        let err = TableBackend::open(TableBackendConfig::new("sqlite://"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
