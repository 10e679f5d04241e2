//! Cross-process entity locks backed by lock files.
//!
//! A writer owns an entity while `<id>.lock` exists and carries its token.
//! Acquisition is an exclusive create, retried until the lock timeout or
//! the call deadline. A lock file older than the stale threshold belongs to
//! a crashed writer and is broken. Breaking goes through a short-lived
//! `<id>.lock.break` file so only one waiter breaks at a time, and only the
//! lock whose token it saw as stale.
//!
//! Everything here is blocking and runs on the blocking pool.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use uuid::Uuid;

use crate::core::{deadline_exceeded, millis};
use crate::error::{BackendError, StoreResult};
use crate::types::EntityId;

use super::backend::{BACKEND_NAME, io_error};

/// Timing parameters for lock acquisition.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LockOptions {
    pub timeout: Duration,
    pub retry_interval: Duration,
    pub stale_after: Duration,
}

/// Held lock. Dropping it removes the lock file if it is still ours.
#[derive(Debug)]
pub(crate) struct FileLockGuard {
    path: PathBuf,
    token: String,
}

impl FileLockGuard {
    /// Acquires the lock at `path` for `id`.
    ///
    /// Gives up with `LockTimeout` after `options.timeout`, or with
    /// `DeadlineExceeded` if `deadline` comes first.
    pub(crate) fn acquire(
        path: &Path,
        id: &EntityId,
        options: LockOptions,
        deadline: Option<Instant>,
    ) -> StoreResult<Self> {
        let started = Instant::now();
        let lock_deadline = started + options.timeout;
        let (give_up, by_deadline) = match deadline {
            Some(d) if d < lock_deadline => (d, true),
            _ => (lock_deadline, false),
        };
        let token = format!("{}:{}", std::process::id(), Uuid::new_v4().simple());

        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    file.write_all(token.as_bytes())
                        .and_then(|_| file.sync_all())
                        .map_err(|e| {
                            let _ = fs::remove_file(path);
                            io_error("write lock", path, e)
                        })?;
                    tracing::trace!(
                        backend = BACKEND_NAME,
                        entity_id = %id,
                        waited_ms = millis(started.elapsed()),
                        "acquired entity lock"
                    );
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                    if break_if_stale(path, id, options.stale_after) {
                        continue;
                    }
                }
                Err(e) if e.kind() == IoErrorKind::NotFound => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)
                            .map_err(|e| io_error("create partition directory", parent, e))?;
                    }
                    continue;
                }
                Err(e) => return Err(io_error("create lock", path, e)),
            }

            let now = Instant::now();
            if now >= give_up {
                if by_deadline {
                    return Err(deadline_exceeded(BACKEND_NAME, "lock"));
                }
                tracing::warn!(
                    backend = BACKEND_NAME,
                    entity_id = %id,
                    timeout_ms = millis(options.timeout),
                    "entity lock timed out"
                );
                return Err(BackendError::LockTimeout {
                    id: id.clone(),
                    timeout_ms: millis(options.timeout),
                }
                .into());
            }
            thread::sleep(options.retry_interval.min(give_up - now));
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(owner) if owner == self.token => {
                if let Err(e) = fs::remove_file(&self.path) {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock");
                }
            }
            Ok(_) => {
                tracing::warn!(
                    path = %self.path.display(),
                    "lock was broken by another writer before release"
                );
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read lock");
            }
        }
    }
}

/// State of a lock file as seen by a waiter.
#[derive(Debug, PartialEq)]
enum Observed {
    Gone,
    Fresh,
    Stale { token: String, age: Duration },
}

fn observe(path: &Path, stale_after: Duration) -> Observed {
    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Observed::Gone,
        Err(_) => return Observed::Fresh,
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    if age < stale_after {
        return Observed::Fresh;
    }
    match fs::read_to_string(path) {
        Ok(token) => Observed::Stale { token, age },
        Err(e) if e.kind() == IoErrorKind::NotFound => Observed::Gone,
        Err(_) => Observed::Fresh,
    }
}

fn breaker_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".break");
    PathBuf::from(name)
}

/// Removes the lock at `path` if it is older than `stale_after`.
///
/// The lock is removed only while holding the breaker file and only if it
/// still carries the token first seen as stale; a waiter that lost the race
/// finds the winner's fresh lock and keeps waiting. Returns `true` if the
/// caller should retry immediately.
fn break_if_stale(path: &Path, id: &EntityId, stale_after: Duration) -> bool {
    let seen = match observe(path, stale_after) {
        Observed::Gone => return true,
        Observed::Fresh => return false,
        Observed::Stale { token, .. } => token,
    };

    let breaker = breaker_path(path);
    match OpenOptions::new().write(true).create_new(true).open(&breaker) {
        Ok(_) => {}
        Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
            // A breaker that outlived the stale threshold was left by a crash.
            if matches!(observe(&breaker, stale_after), Observed::Stale { .. }) {
                let _ = fs::remove_file(&breaker);
            }
            return false;
        }
        Err(_) => return false,
    }

    let broken = match observe(path, stale_after) {
        Observed::Stale { token, age } if token == seen => {
            tracing::warn!(
                backend = BACKEND_NAME,
                entity_id = %id,
                age_ms = millis(age),
                path = %path.display(),
                "breaking stale entity lock"
            );
            match fs::remove_file(path) {
                Ok(()) => true,
                Err(e) => e.kind() == IoErrorKind::NotFound,
            }
        }
        Observed::Gone => true,
        _ => false,
    };
    if let Err(e) = fs::remove_file(&breaker) {
        tracing::warn!(path = %breaker.display(), error = %e, "failed to remove lock breaker");
    }
    broken
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, StoreError};

    fn options(timeout_ms: u64) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(timeout_ms),
            retry_interval: Duration::from_millis(5),
            stale_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a1.lock");
        let id = EntityId::new("a1");
        {
            let _guard = FileLockGuard::acquire(&path, &id, options(100), None).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_creates_missing_partition_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p0001").join("a1.lock");
        let _guard = FileLockGuard::acquire(&path, &EntityId::new("a1"), options(100), None).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a1.lock");
        let id = EntityId::new("a1");
        let _held = FileLockGuard::acquire(&path, &id, options(100), None).unwrap();

        let err = FileLockGuard::acquire(&path, &id, options(30), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(matches!(
            err,
            StoreError::Unavailable(BackendError::LockTimeout { timeout_ms: 30, .. })
        ));
    }

    #[test]
    fn test_deadline_before_lock_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a1.lock");
        let id = EntityId::new("a1");
        let _held = FileLockGuard::acquire(&path, &id, options(100), None).unwrap();

        let deadline = Instant::now() + Duration::from_millis(20);
        let err = FileLockGuard::acquire(&path, &id, options(5_000), Some(deadline)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Unavailable(BackendError::DeadlineExceeded { .. })
        ));
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a1.lock");
        fs::write(&path, "crashed-writer").unwrap();

        let mut opts = options(1_000);
        opts.stale_after = Duration::ZERO;
        let guard = FileLockGuard::acquire(&path, &EntityId::new("a1"), opts, None).unwrap();
        assert_ne!(fs::read_to_string(&path).unwrap(), "crashed-writer");
        drop(guard);
        assert!(!path.exists());
    }

    fn age(path: &Path, by: Duration) {
        fs::OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    #[test]
    fn test_waiters_racing_on_stale_lock_never_overlap() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, Barrier};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a1.lock");
        for _ in 0..10 {
            fs::write(&path, "crashed-writer").unwrap();
            age(&path, Duration::from_secs(3600));

            let barrier = Arc::new(Barrier::new(2));
            let inside = Arc::new(AtomicUsize::new(0));
            let overlaps = Arc::new(AtomicUsize::new(0));
            let waiters: Vec<_> = (0..2)
                .map(|_| {
                    let (path, barrier) = (path.clone(), barrier.clone());
                    let (inside, overlaps) = (inside.clone(), overlaps.clone());
                    thread::spawn(move || {
                        barrier.wait();
                        let guard =
                            FileLockGuard::acquire(&path, &EntityId::new("a1"), options(5_000), None)
                                .unwrap();
                        if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::sleep(Duration::from_millis(20));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        drop(guard);
                    })
                })
                .collect();
            for waiter in waiters {
                waiter.join().unwrap();
            }
            assert_eq!(overlaps.load(Ordering::SeqCst), 0);
            assert!(!path.exists());
            assert!(!breaker_path(&path).exists());
        }
    }

    #[test]
    fn test_fresh_lock_with_new_token_is_not_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a1.lock");
        fs::write(&path, "crashed-writer").unwrap();
        age(&path, Duration::from_secs(3600));
        let seen = observe(&path, Duration::from_secs(60));
        assert!(matches!(seen, Observed::Stale { ref token, .. } if token == "crashed-writer"));

        // Someone broke it and took the lock before we got to it.
        fs::remove_file(&path).unwrap();
        let _winner = FileLockGuard::acquire(&path, &EntityId::new("a1"), options(100), None).unwrap();
        assert!(!break_if_stale(&path, &EntityId::new("a1"), Duration::from_secs(60)));
        assert!(path.exists());
    }

    #[test]
    fn test_abandoned_breaker_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a1.lock");
        fs::write(&path, "crashed-writer").unwrap();
        age(&path, Duration::from_secs(3600));
        fs::write(breaker_path(&path), b"").unwrap();
        age(&breaker_path(&path), Duration::from_secs(3600));

        let mut opts = options(1_000);
        opts.stale_after = Duration::from_secs(60);
        let _guard = FileLockGuard::acquire(&path, &EntityId::new("a1"), opts, None).unwrap();
        assert!(!breaker_path(&path).exists());
    }

    #[test]
    fn test_drop_keeps_foreign_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a1.lock");
        let guard = FileLockGuard::acquire(&path, &EntityId::new("a1"), options(100), None).unwrap();
        fs::write(&path, "someone-else").unwrap();
        drop(guard);
        assert_eq!(fs::read_to_string(&path).unwrap(), "someone-else");
    }
}
