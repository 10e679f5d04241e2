//! Audit capture boundary.
//!
//! After every successful mutation the store hands an [`AuditEvent`] to an
//! [`AuditSink`]. Emission is fire-and-forget: a sink must not block, and a
//! failing sink never fails the mutation that produced the event.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{EntityId, EntityRecord, OperationKind, PartitionKey};

/// A record of one accepted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// The mutated entity.
    pub entity_id: EntityId,
    /// The entity's partition.
    pub partition_key: PartitionKey,
    /// The version written by the mutation.
    pub version: u64,
    /// When the mutation was accepted.
    pub timestamp: DateTime<Utc>,
    /// The mutation kind.
    pub operation: OperationKind,
}

impl AuditEvent {
    /// Builds the event for a record that was just written.
    pub fn for_record(record: &EntityRecord, operation: OperationKind) -> Self {
        Self {
            entity_id: record.id().clone(),
            partition_key: record.partition_key().clone(),
            version: record.version(),
            timestamp: record.updated_at(),
            operation,
        }
    }
}

/// Failures reported by an audit sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    /// The sink's buffer is full.
    #[error("audit sink is full")]
    Full,

    /// The receiving side has gone away.
    #[error("audit sink is closed")]
    Closed,

    /// Any other sink-specific failure.
    #[error("audit sink failed: {0}")]
    Other(String),
}

/// Receives audit events.
///
/// Implementations must return promptly; long-running delivery belongs on
/// the consumer side of a queue.
pub trait AuditSink: Send + Sync + Debug {
    /// Emits one event.
    fn emit(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: &AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Forwards events into a bounded channel.
///
/// # Examples
///
/// ```
/// use helios_entity_store::core::{AuditEvent, AuditSink, ChannelAuditSink};
/// use helios_entity_store::types::{EntityRecord, OperationKind};
/// use serde_json::json;
///
/// let (sink, mut rx) = ChannelAuditSink::new(8);
/// let record = EntityRecord::new(json!({"name": "a"})).unwrap();
/// sink.emit(&AuditEvent::for_record(&record, OperationKind::Create)).unwrap();
/// assert_eq!(rx.try_recv().unwrap().version, 0);
/// ```
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Creates a sink with room for `capacity` undelivered events, and the
    /// receiver to drain it from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AuditError::Full,
            mpsc::error::TrySendError::Closed(_) => AuditError::Closed,
        })
    }
}

/// Emits `event`, logging instead of propagating a failure.
pub(crate) fn emit_or_warn(sink: &dyn AuditSink, event: &AuditEvent) {
    if let Err(e) = sink.emit(event) {
        tracing::warn!(
            entity_id = %event.entity_id,
            partition = %event.partition_key,
            version = event.version,
            operation = %event.operation,
            error = %e,
            "failed to emit audit event"
        );
    }
}
