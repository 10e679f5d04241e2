//! Error types for the entity store.
//!
//! The taxonomy is closed: every backend translates its native failures
//! (I/O, serialization, driver errors) into [`StoreError`] at the backend
//! boundary, so no driver error type crosses the public API.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

use crate::types::{EntityId, PartitionKey};

/// The primary error type for all store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed input. Never retried.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A create collided with an existing (or retired) entity.
    #[error("entity already exists: {partition_key}/{id}")]
    AlreadyExists {
        id: EntityId,
        partition_key: PartitionKey,
    },

    /// The entity is unknown in the given partition, or has been deleted.
    #[error("entity not found: {partition_key}/{id}")]
    NotFound {
        id: EntityId,
        partition_key: PartitionKey,
    },

    /// The expected version did not match the stored version.
    ///
    /// The caller must re-read and reapply its change; this is never retried
    /// automatically.
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    ConcurrencyConflict {
        id: EntityId,
        expected: u64,
        actual: u64,
    },

    /// Transient backend failure. Callers may retry with their own backoff.
    #[error(transparent)]
    Unavailable(#[from] BackendError),

    /// Invalid or incomplete store configuration. Fatal at startup.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Coarse classification of a [`StoreError`], for callers that branch on
/// the outcome without inspecting details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`StoreError::Validation`].
    Validation,
    /// See [`StoreError::AlreadyExists`].
    AlreadyExists,
    /// See [`StoreError::NotFound`].
    NotFound,
    /// See [`StoreError::ConcurrencyConflict`].
    ConcurrencyConflict,
    /// See [`StoreError::Unavailable`].
    Unavailable,
    /// See [`StoreError::Configuration`].
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::AlreadyExists => "already-exists",
            ErrorKind::NotFound => "not-found",
            ErrorKind::ConcurrencyConflict => "concurrency-conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Configuration => "configuration",
        };
        write!(f, "{}", name)
    }
}

impl StoreError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            StoreError::Unavailable(_) => ErrorKind::Unavailable,
            StoreError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Returns `true` if an external retry policy may reattempt the call.
    ///
    /// Only transient backend failures qualify. A conflict requires the
    /// caller to re-read first, so it is not retryable as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub(crate) fn not_found(id: &EntityId, partition_key: &PartitionKey) -> Self {
        StoreError::NotFound {
            id: id.clone(),
            partition_key: partition_key.clone(),
        }
    }

    pub(crate) fn already_exists(id: &EntityId, partition_key: &PartitionKey) -> Self {
        StoreError::AlreadyExists {
            id: id.clone(),
            partition_key: partition_key.clone(),
        }
    }

    pub(crate) fn conflict(id: &EntityId, expected: u64, actual: u64) -> Self {
        StoreError::ConcurrencyConflict {
            id: id.clone(),
            expected,
            actual,
        }
    }

    pub(crate) fn unavailable(backend_name: &str, message: impl Into<String>) -> Self {
        StoreError::Unavailable(BackendError::Unavailable {
            backend_name: backend_name.to_string(),
            message: message.into(),
        })
    }
}

/// Errors related to malformed input.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// The payload is missing (`null`).
    #[error("payload is required")]
    MissingPayload,

    /// The payload is not a JSON object.
    #[error("payload must be a JSON object, got {found}")]
    PayloadNotObject { found: String },

    /// The partition key could not be derived from the record.
    #[error("cannot derive partition key: {message}")]
    PartitionUnresolvable { message: String },

    /// The partition key contains characters a backend cannot address.
    #[error("invalid partition key '{partition_key}': {message}")]
    InvalidPartitionKey {
        partition_key: String,
        message: String,
    },

    /// The entity id is empty or cannot be addressed.
    #[error("invalid entity id '{id}': {message}")]
    InvalidId { id: String, message: String },

    /// The payload could not be serialized for storage.
    #[error("payload serialization failed: {message}")]
    Serialization { message: String },

    /// The version counter would overflow.
    #[error("version overflow for {id}")]
    VersionOverflow { id: EntityId },

    /// A revision was appended out of order. This is a programming error.
    #[error("revision out of order for {id}: expected version {expected}, got {actual}")]
    RevisionOutOfOrder {
        id: EntityId,
        expected: u64,
        actual: u64,
    },
}

/// Errors originating from a backing store.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend is currently unavailable.
    #[error("backend unavailable: {backend_name}: {message}")]
    Unavailable {
        backend_name: String,
        message: String,
    },

    /// Connection to the backend failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// Connection pool exhausted.
    #[error("connection pool exhausted for {backend_name}")]
    PoolExhausted { backend_name: String },

    /// The caller-supplied deadline expired before the operation committed.
    #[error("deadline exceeded in {backend_name} during {operation}")]
    DeadlineExceeded {
        backend_name: String,
        operation: String,
    },

    /// The per-entity lock could not be acquired before the deadline.
    #[error("lock timeout after {timeout_ms}ms for {id}")]
    LockTimeout { id: EntityId, timeout_ms: u64 },

    /// Stored data could not be decoded.
    #[error("corrupt data in {backend_name}: {message}")]
    Corrupt {
        backend_name: String,
        message: String,
    },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Errors in the configuration supplied to the store factory.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// A field required by the chosen store type is missing.
    #[error("missing required field '{field}' for store type {store_type}")]
    MissingField {
        store_type: String,
        field: &'static str,
    },

    /// A field is present but invalid.
    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: &'static str, message: String },

    /// The store type is declared but has no implementation.
    #[error("store type {store_type} is not supported: {message}")]
    Unsupported { store_type: String, message: String },

    /// The store type string could not be parsed.
    #[error("unknown store type '{value}'")]
    UnknownStoreType { value: String },
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Validation(ValidationError::Serialization {
            message: err.to_string(),
        })
    }
}

impl From<tokio::task::JoinError> for BackendError {
    fn from(err: tokio::task::JoinError) -> Self {
        BackendError::Internal {
            backend_name: "runtime".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}
