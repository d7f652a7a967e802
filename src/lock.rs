//! Named cross-process mutex.
//!
//! The primitive is atomic `create_dir`: creating a directory either
//! succeeds exactly once or fails with `AlreadyExists`, on every mainstream
//! OS. A lock is a directory under the shared locks root; the holder writes
//! an `owner` file inside it (pid, host, timestamp) so another process can
//! inspect or force-break a stale lock.
//!
//! Contenders poll at one-second granularity until success or `max_wait`
//! elapses. `max_wait` of zero means try-once.

use crate::errors::LockError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const OWNER_FILE: &str = "owner";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Identity of a lock holder, recorded for inspection and recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: hostname(),
            acquired_at: Utc::now(),
        }
    }

    /// Age of the lock since acquisition.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.acquired_at
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Factory for named locks rooted in a shared scratch directory.
#[derive(Debug, Clone)]
pub struct DirLock {
    locks_dir: PathBuf,
}

impl DirLock {
    pub fn new(locks_dir: &Path) -> Self {
        Self {
            locks_dir: locks_dir.to_path_buf(),
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", name))
    }

    /// Acquire the named lock, polling until success or `max_wait` elapses.
    ///
    /// Exactly one of two concurrent acquirers for the same name succeeds;
    /// the loser keeps polling. The returned guard releases on drop.
    pub fn acquire(&self, name: &str, max_wait: Duration) -> Result<LockGuard, LockError> {
        let path = self.lock_path(name);
        let started = Instant::now();

        loop {
            match std::fs::create_dir(&path) {
                Ok(()) => {
                    let owner = LockOwner::current();
                    // Owner metadata is advisory; the directory itself is the lock.
                    if let Ok(json) = serde_json::to_string(&owner) {
                        let _ = std::fs::write(path.join(OWNER_FILE), json);
                    }
                    return Ok(LockGuard {
                        path,
                        name: name.to_string(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= max_wait {
                        return Err(LockError::Timeout {
                            name: name.to_string(),
                            waited_secs: started.elapsed().as_secs(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL.min(max_wait.saturating_sub(started.elapsed())));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Locks root missing (first run); create and retry.
                    std::fs::create_dir_all(&self.locks_dir).map_err(|source| LockError::Io {
                        name: name.to_string(),
                        source,
                    })?;
                }
                Err(source) => {
                    return Err(LockError::Io {
                        name: name.to_string(),
                        source,
                    });
                }
            }
        }
    }

    /// Read the recorded owner of a held lock, if any.
    pub fn inspect(&self, name: &str) -> Option<LockOwner> {
        let content = std::fs::read_to_string(self.lock_path(name).join(OWNER_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// True when the named lock is currently held.
    pub fn is_held(&self, name: &str) -> bool {
        self.lock_path(name).exists()
    }

    /// Operator recovery: break a lock regardless of holder.
    ///
    /// Distinct from normal release; only for locks whose holder is known
    /// to be dead.
    pub fn force_release(&self, name: &str) -> Result<(), LockError> {
        match std::fs::remove_dir_all(self.lock_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }
}

/// Held lock. Releases on drop; explicit `release` is idempotent.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    name: String,
    released: bool,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock. Must not fail if the lock directory is already gone.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _ = std::fs::remove_file(self.path.join(OWNER_FILE));
        let _ = std::fs::remove_dir(&self.path);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let locks = DirLock::new(dir.path());

        let mut guard = locks.acquire("state", Duration::ZERO).unwrap();
        assert!(locks.is_held("state"));

        guard.release();
        assert!(!locks.is_held("state"));
    }

    #[test]
    fn test_try_once_fails_while_held() {
        let dir = tempdir().unwrap();
        let locks = DirLock::new(dir.path());

        let _guard = locks.acquire("state", Duration::ZERO).unwrap();
        let second = locks.acquire("state", Duration::ZERO);
        assert!(matches!(second, Err(LockError::Timeout { .. })));
    }

    #[test]
    fn test_release_is_idempotent_after_force_release() {
        let dir = tempdir().unwrap();
        let locks = DirLock::new(dir.path());

        let mut guard = locks.acquire("state", Duration::ZERO).unwrap();
        // Operator breaks the lock out from under the holder.
        locks.force_release("state").unwrap();
        guard.release();
        guard.release();
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempdir().unwrap();
        let locks = DirLock::new(dir.path());
        {
            let _guard = locks.acquire("state", Duration::ZERO).unwrap();
            assert!(locks.is_held("state"));
        }
        assert!(!locks.is_held("state"));
    }

    #[test]
    fn test_owner_metadata_recorded() {
        let dir = tempdir().unwrap();
        let locks = DirLock::new(dir.path());

        let _guard = locks.acquire("state", Duration::ZERO).unwrap();
        let owner = locks.inspect("state").unwrap();
        assert_eq!(owner.pid, std::process::id());
        assert!(owner.age().num_seconds() < 5);
    }

    #[test]
    fn test_distinct_names_do_not_contend() {
        let dir = tempdir().unwrap();
        let locks = DirLock::new(dir.path());

        let _a = locks.acquire("state", Duration::ZERO).unwrap();
        let _b = locks.acquire("ledger", Duration::ZERO).unwrap();
        assert!(locks.is_held("state"));
        assert!(locks.is_held("ledger"));
    }

    #[test]
    fn test_exactly_one_concurrent_acquirer_wins() {
        let dir = tempdir().unwrap();
        let locks = DirLock::new(dir.path());
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let wins = wins.clone();
                std::thread::spawn(move || {
                    if let Ok(guard) = locks.acquire("contended", Duration::ZERO) {
                        wins.fetch_add(1, Ordering::SeqCst);
                        // Hold long enough that the others all lose.
                        std::thread::sleep(Duration::from_millis(100));
                        drop(guard);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waiting_acquirer_succeeds_after_release() {
        let dir = tempdir().unwrap();
        let locks = DirLock::new(dir.path());

        let mut guard = locks.acquire("state", Duration::ZERO).unwrap();
        let locks2 = locks.clone();
        let waiter = std::thread::spawn(move || {
            locks2.acquire("state", Duration::from_secs(10)).is_ok()
        });

        std::thread::sleep(Duration::from_millis(200));
        guard.release();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_creates_locks_root_on_first_acquire() {
        let dir = tempdir().unwrap();
        let locks = DirLock::new(&dir.path().join("nested").join("locks"));
        let guard = locks.acquire("state", Duration::ZERO);
        assert!(guard.is_ok());
    }
}
