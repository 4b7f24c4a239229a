//! Advisory locking for the shared object store
//!
//! Concurrent pipeline processes may share one cache root, so writers
//! take an advisory lock with a timeout and emit a diagnostic when
//! contention occurs. The lock is released (and its file removed) on
//! drop.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock timeout after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Advisory file lock for a cache directory.
///
/// The lock is automatically released when this struct is dropped.
pub struct CacheLock {
    /// Path to the lock file
    lock_path: PathBuf,
}

impl CacheLock {
    /// Lock file name
    const LOCK_FILENAME: &'static str = ".varship_cache.lock";

    /// Acquire a lock on the given cache directory.
    ///
    /// Creates the directory if it doesn't exist. Waits up to `timeout`
    /// for the lock to become available, polling at a short interval.
    pub fn acquire(cache_dir: &Path, timeout: Duration) -> LockResult<Self> {
        Self::acquire_named(cache_dir, Self::LOCK_FILENAME, timeout)
    }

    /// Acquire a lock under a caller-chosen lock filename, for
    /// directories that are not cache stores (e.g. the release sink).
    pub fn acquire_named(dir: &Path, filename: &str, timeout: Duration) -> LockResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_path = dir.join(filename);
        let start = Instant::now();
        let poll_interval = Duration::from_millis(50);
        let mut warned = false;

        loop {
            match Self::try_acquire_exclusive(&lock_path) {
                Ok(()) => {
                    if warned {
                        eprintln!(
                            "[cache] lock acquired after {:.1}s contention: {}",
                            start.elapsed().as_secs_f64(),
                            lock_path.display()
                        );
                    }
                    return Ok(Self { lock_path });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Lock is held by another process
                    if !warned && start.elapsed() > Duration::from_millis(500) {
                        eprintln!(
                            "[cache] WARNING: lock contention on {}, waiting...",
                            lock_path.display()
                        );
                        warned = true;
                    }
                }
                Err(e) => return Err(LockError::Io(e)),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout(timeout));
            }

            std::thread::sleep(poll_interval);
        }
    }

    /// Try to create the lock file exclusively.
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<()> {
        match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            }
            Err(e) => Err(e),
        }
    }

    /// Get the lock file path.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}
