//! In-process per-key write locks.
//!
//! Used when the table client cannot make a replace conditional: the
//! backend holds the key's lock across read, version check and write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::core::millis;
use crate::error::{BackendError, StoreError, StoreResult};
use crate::types::EntityId;

#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Holds one key's lock. Dropping it releases the lock.
#[derive(Debug)]
pub(crate) struct KeyLockGuard {
    key: String,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    _guard: OwnedMutexGuard<()>,
}

impl KeyLocks {
    /// Waits up to `timeout` for the lock on `key`.
    pub(crate) async fn acquire(
        &self,
        key: String,
        id: &EntityId,
        timeout: Duration,
    ) -> StoreResult<KeyLockGuard> {
        let mutex = self.locks.lock().entry(key.clone()).or_default().clone();
        let guard = tokio::time::timeout(timeout, mutex.lock_owned())
            .await
            .map_err(|_| {
                StoreError::Unavailable(BackendError::LockTimeout {
                    id: id.clone(),
                    timeout_ms: millis(timeout),
                })
            })?;
        Ok(KeyLockGuard {
            key,
            locks: self.locks.clone(),
            _guard: guard,
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // Two references left: the map's and the one inside our guard.
        if locks
            .get(&self.key)
            .is_some_and(|m| Arc::strong_count(m) <= 2)
        {
            locks.remove(&self.key);
        }
    }
}
