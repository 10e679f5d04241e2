//! Per-call context.
//!
//! Every [`StoreBackend`](super::StoreBackend) operation takes a
//! [`CallContext`] carrying the caller's deadline and an optional label for
//! log lines. Reads are raced against the deadline. Writes check it before
//! their commit step and, once that step starts, run it to completion, so an
//! expired call reports [`BackendError::DeadlineExceeded`] without leaving a
//! partially-applied write.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{BackendError, StoreError, StoreResult};

/// Caller-supplied options for a single store call.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use helios_entity_store::core::CallContext;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let ctx = CallContext::new().with_timeout(Duration::from_secs(2));
/// assert!(!ctx.is_expired());
/// assert!(CallContext::new().deadline().is_none());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    label: Option<String>,
}

impl CallContext {
    /// Creates a context without a deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attaches a label that is recorded on log lines for this call.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Applies `timeout` only if no deadline has been set.
    pub(crate) fn or_timeout(&self, timeout: Option<Duration>) -> Self {
        match (self.deadline, timeout) {
            (None, Some(timeout)) => self.clone().with_timeout(timeout),
            _ => self.clone(),
        }
    }

    /// Returns the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the label, if any.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Returns the time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns `true` if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fails with `DeadlineExceeded` if the deadline has passed.
    pub fn check(&self, backend_name: &str, operation: &str) -> StoreResult<()> {
        if self.is_expired() {
            return Err(deadline_exceeded(backend_name, operation));
        }
        Ok(())
    }

    /// Runs `fut` to completion or until the deadline expires.
    ///
    /// For reads only. A write future dropped at the deadline may already
    /// have been applied by the server; writes call [`check`](Self::check)
    /// and then await their commit.
    pub(crate) async fn run<F, T>(&self, backend_name: &str, operation: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match self.deadline {
            None => fut.await,
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .unwrap_or_else(|_| Err(deadline_exceeded(backend_name, operation))),
        }
    }
}

pub(crate) fn deadline_exceeded(backend_name: &str, operation: &str) -> StoreError {
    tracing::warn!(backend = backend_name, operation, "deadline exceeded");
    StoreError::Unavailable(BackendError::DeadlineExceeded {
        backend_name: backend_name.to_string(),
        operation: operation.to_string(),
    })
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_deadline_never_expires() {
        let ctx = CallContext::new();
        assert!(!ctx.is_expired());
        assert!(ctx.remaining().is_none());
        assert!(ctx.check("memory", "get").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(10));
        assert!(!ctx.is_expired());
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(ctx.is_expired());
        let err = ctx.check("memory", "get").unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(5));
        let result: StoreResult<()> = ctx
            .run("memory", "update", async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(StoreError::Unavailable(BackendError::DeadlineExceeded { .. }))
        ));
    }

    #[tokio::test]
    async fn test_or_timeout_keeps_explicit_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(60));
        let merged = ctx.or_timeout(Some(Duration::from_millis(1)));
        assert_eq!(merged.deadline(), ctx.deadline());
        assert!(CallContext::new().or_timeout(Some(Duration::from_secs(1))).deadline().is_some());
    }

    #[tokio::test]
    async fn test_or_timeout_keeps_label() {
        let ctx = CallContext::new().with_label("nightly-import");
        let merged = ctx.or_timeout(Some(Duration::from_secs(1)));
        assert_eq!(merged.label(), Some("nightly-import"));
        assert!(merged.deadline().is_some());
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
