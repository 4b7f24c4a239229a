//! Content-addressed build cache
//!
//! One cache abstraction covers every cacheable layer (toolchain layers,
//! dependency resolution, compiled outputs): entries are directories of
//! files keyed by the SHA-256 cache key computed in [`crate::job`]. Keys
//! are derived purely from build inputs, so a stale hit is impossible by
//! construction: if any input changes, the key changes.
//!
//! ## Single-flight
//!
//! Concurrent lookups for an identical key collapse to one producer:
//! the first miss computes, every other caller blocks until the result
//! is stored and then reuses it. If the producer fails, one waiter takes
//! over as producer rather than surfacing the other's error.
//!
//! ## Layout
//!
//! `<root>/objects/<key[0..2]>/<key>/` holding the payload files plus a
//! `.complete` marker written last, so a partially-stored entry is never
//! served.

mod lock;

pub use lock::{CacheLock, LockError, LockResult};

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime};

use thiserror::Error;

/// Marker file written after all payload files are in place
const COMPLETE_MARKER: &str = ".complete";

/// Default timeout for the cross-process store lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Cache result type
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors from cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("cache internal state poisoned")]
    Poisoned,

    #[error("cache payload is not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// A reusable cached payload.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The content-derived key
    pub key: String,
    /// Directory holding the payload files
    pub path: PathBuf,
    /// When the entry was last served
    pub last_used: SystemTime,
}

/// Statistics from a retention sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepStats {
    /// Entries examined
    pub scanned: usize,
    /// Entries removed
    pub removed: usize,
}

/// Content-addressed cache store shared by all jobs.
pub struct CacheStore {
    root: PathBuf,
    lock_timeout: Duration,
    in_flight: Mutex<HashSet<String>>,
    done: Condvar,
}

impl CacheStore {
    /// Open (creating if needed) a cache store rooted at `root`.
    pub fn open(root: &Path) -> CacheResult<Self> {
        fs::create_dir_all(root.join("objects"))?;
        Ok(Self {
            root: root.to_path_buf(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            in_flight: Mutex::new(HashSet::new()),
            done: Condvar::new(),
        })
    }

    /// Directory for one key: objects/<key[0..2]>/<key>
    fn entry_dir(&self, key: &str) -> PathBuf {
        let prefix = key.get(0..2).unwrap_or("__");
        self.root.join("objects").join(prefix).join(key)
    }

    /// Look up an entry by key.
    ///
    /// Returns `None` on miss. A hit refreshes the entry's last-used
    /// marker so external retention policies see it as live.
    pub fn lookup(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let dir = self.entry_dir(key);
        if !dir.join(COMPLETE_MARKER).is_file() {
            return Ok(None);
        }

        let now = SystemTime::now();
        // Refresh last-used by rewriting the marker
        fs::write(dir.join(COMPLETE_MARKER), b"")?;

        Ok(Some(CacheEntry {
            key: key.to_string(),
            path: dir,
            last_used: now,
        }))
    }

    /// Store a payload directory under `key`.
    ///
    /// Copies `src_dir` into a staging directory, writes the completion
    /// marker, then renames into place. If a concurrent process already
    /// stored the key, the existing entry wins and `src_dir` is ignored.
    pub fn store(&self, key: &str, src_dir: &Path) -> CacheResult<CacheEntry> {
        if !src_dir.is_dir() {
            return Err(CacheError::NotADirectory(src_dir.to_path_buf()));
        }

        let dir = self.entry_dir(key);
        let parent = dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.join("objects"));

        let _lock = CacheLock::acquire(&parent, self.lock_timeout)?;

        // Another process may have stored this key while we built
        if dir.join(COMPLETE_MARKER).is_file() {
            return Ok(CacheEntry {
                key: key.to_string(),
                path: dir,
                last_used: SystemTime::now(),
            });
        }

        let staging = parent.join(format!("{key}.staging"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        copy_dir(src_dir, &staging)?;
        fs::write(staging.join(COMPLETE_MARKER), b"")?;

        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::rename(&staging, &dir)?;

        Ok(CacheEntry {
            key: key.to_string(),
            path: dir,
            last_used: SystemTime::now(),
        })
    }

    /// Look up `key`, computing and storing the payload on miss.
    ///
    /// At-most-one computation per key: concurrent callers with an
    /// identical key block until the first caller's result is stored,
    /// then reuse it. `produce` must return a directory containing the
    /// payload files. The returned flag is `true` on a cache hit.
    pub fn get_or_compute<E, F>(&self, key: &str, produce: F) -> Result<(CacheEntry, bool), E>
    where
        E: From<CacheError>,
        F: FnOnce() -> Result<PathBuf, E>,
    {
        loop {
            if let Some(entry) = self.lookup(key).map_err(E::from)? {
                return Ok((entry, true));
            }

            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| E::from(CacheError::Poisoned))?;

            if !in_flight.contains(key) {
                in_flight.insert(key.to_string());
                drop(in_flight);
                break;
            }

            // Identical key already being produced; wait for it
            let _unused = self
                .done
                .wait(in_flight)
                .map_err(|_| E::from(CacheError::Poisoned))?;
            // Loop back to re-check the store
        }

        // We are the single producer for this key
        let result = produce().and_then(|dir| self.store(key, &dir).map_err(E::from));

        {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| E::from(CacheError::Poisoned))?;
            in_flight.remove(key);
        }
        self.done.notify_all();

        result.map(|entry| (entry, false))
    }

    /// Remove entries whose last use is older than `max_age`.
    ///
    /// Eviction policy itself is external; this is the mechanism it
    /// invokes (CLI `cache-gc`).
    pub fn sweep(&self, max_age: Duration) -> CacheResult<SweepStats> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut stats = SweepStats::default();

        let objects = self.root.join("objects");
        for prefix in read_dir_sorted(&objects)? {
            if !prefix.is_dir() {
                continue;
            }
            let _lock = CacheLock::acquire(&prefix, self.lock_timeout)?;
            for entry_dir in read_dir_sorted(&prefix)? {
                let marker = entry_dir.join(COMPLETE_MARKER);
                if !marker.is_file() {
                    continue;
                }
                stats.scanned += 1;
                let modified = fs::metadata(&marker)?.modified()?;
                if modified < cutoff {
                    fs::remove_dir_all(&entry_dir)?;
                    stats.removed += 1;
                }
            }
        }

        Ok(stats)
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Recursively copy a directory.
fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// List a directory's children, sorted for deterministic iteration.
fn read_dir_sorted(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        children.push(entry.path());
    }
    children.sort();
    Ok(children)
}
