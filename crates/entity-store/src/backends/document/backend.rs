//! Document backend configuration and construction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, ConfigurationError, StoreError, StoreResult};

use super::client::{DocumentApi, DocumentClientError};
use super::memory::MemoryDocumentClient;

pub(crate) const BACKEND_NAME: &str = "document";

/// Document backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentBackendConfig {
    /// `memory://<name>`, `mongodb://...` or `mongodb+srv://...`.
    pub connection_string: String,

    /// Database holding the collections.
    pub database_name: String,

    /// Entity collection name. Revisions go to `<collection>_revisions`.
    #[serde(default = "default_collection")]
    pub collection: String,
}

pub(crate) fn default_collection() -> String {
    "entities".to_string()
}

impl DocumentBackendConfig {
    /// Creates a configuration with the default collection name.
    pub fn new(connection_string: impl Into<String>, database_name: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            database_name: database_name.into(),
            collection: default_collection(),
        }
    }

    /// Sets the collection name.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }
}

/// Entity storage over a document database.
///
/// Every write is a single conditional call: creates insert only if the key
/// is free, and updates and deletes replace only if the stored version still
/// matches the expected one.
#[derive(Debug)]
pub struct DocumentBackend {
    pub(crate) config: DocumentBackendConfig,
    pub(crate) client: Arc<dyn DocumentApi>,
}

impl DocumentBackend {
    /// Builds the client named by the connection string.
    ///
    /// No connection is verified here; the factory probes after opening.
    pub async fn open(config: DocumentBackendConfig) -> StoreResult<Self> {
        let client = connect(&config).await?;
        tracing::info!(
            backend = BACKEND_NAME,
            client = client.client_name(),
            database = %config.database_name,
            collection = %config.collection,
            "opened document store"
        );
        Ok(Self { config, client })
    }

    /// Uses an already constructed client.
    pub fn with_client(config: DocumentBackendConfig, client: Arc<dyn DocumentApi>) -> Self {
        Self { config, client }
    }

    /// Returns the backend configuration.
    pub fn config(&self) -> &DocumentBackendConfig {
        &self.config
    }
}

async fn connect(config: &DocumentBackendConfig) -> StoreResult<Arc<dyn DocumentApi>> {
    let uri = config.connection_string.trim();
    if let Some(name) = uri.strip_prefix("memory://") {
        let dataset = format!("{}/{}/{}", name, config.database_name, config.collection);
        return Ok(Arc::new(MemoryDocumentClient::named(&dataset)));
    }
    if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
        return connect_mongo(uri, config).await;
    }
    Err(ConfigurationError::InvalidValue {
        field: "connection_string",
        message: format!("unsupported document store URI '{}'", uri),
    }
    .into())
}

#[cfg(feature = "mongodb")]
async fn connect_mongo(uri: &str, config: &DocumentBackendConfig) -> StoreResult<Arc<dyn DocumentApi>> {
    let client = super::mongo::MongoDocumentClient::connect(
        uri,
        &config.database_name,
        &config.collection,
    )
    .await
    .map_err(map_client_error)?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "mongodb"))]
async fn connect_mongo(_uri: &str, _config: &DocumentBackendConfig) -> StoreResult<Arc<dyn DocumentApi>> {
    Err(ConfigurationError::Unsupported {
        store_type: "document".to_string(),
        message: "MongoDB connections require the `mongodb` feature".to_string(),
    }
    .into())
}

/// Maps client failures that are not a precondition outcome.
pub(crate) fn map_client_error(err: DocumentClientError) -> StoreError {
    let backend_name = BACKEND_NAME.to_string();
    StoreError::Unavailable(match err {
        DocumentClientError::Unavailable(message) => BackendError::Unavailable {
            backend_name,
            message,
        },
        DocumentClientError::Corrupt(message) => BackendError::Corrupt {
            backend_name,
            message,
        },
        DocumentClientError::Internal(message) => BackendError::Internal {
            backend_name,
            message,
            source: None,
        },
        other @ (DocumentClientError::Duplicate | DocumentClientError::PreconditionFailed) => {
            BackendError::Internal {
                backend_name,
                message: format!("unexpected precondition outcome: {:?}", other),
                source: None,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_open_memory() {
        let backend = DocumentBackend::open(DocumentBackendConfig::new("memory://open-test", "db"))
            .await
            .unwrap();
        assert_eq!(backend.client.client_name(), "memory");
        assert_eq!(backend.config().collection, "entities");
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_scheme() {
        let err = DocumentBackend::open(DocumentBackendConfig::new("redis://x", "db"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[cfg(not(feature = "mongodb"))]
    #[tokio::test]
    async fn test_mongo_requires_feature() {
        let err = DocumentBackend::open(DocumentBackendConfig::new("mongodb://localhost", "db"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mongodb"));
    }

    #[test]
    fn test_client_errors_are_unavailable() {
        let err = map_client_error(DocumentClientError::Unavailable("down".to_string()));
        assert!(err.is_retryable());
        let err = map_client_error(DocumentClientError::Corrupt("bad".to_string()));
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }
}
