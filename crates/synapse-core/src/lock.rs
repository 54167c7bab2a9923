//! Per-path locking.
//!
//! Two layers guard every record file:
//! 1. An in-process reader/writer lock per absolute path, held in a [`LockTable`].
//! 2. An OS advisory lock ([`ScopedFileLock`]) on a companion lock file, so other
//!    processes using the same store are excluded too.
//!
//! The companion file lives under the cache's `locks/` directory because the
//! record file itself is replaced by rename on every write.

use crate::{Result, SynapseError};
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default bound on lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const RETRY_INITIAL: Duration = Duration::from_millis(5);
const RETRY_MAX: Duration = Duration::from_millis(50);

/// Requested access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers at once, never alongside a writer.
    Shared,
    /// A single writer.
    Exclusive,
}

/// An OS advisory lock on a file, released when dropped.
#[derive(Debug)]
pub struct ScopedFileLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl ScopedFileLock {
    /// Open (creating if needed) `path` and lock it, retrying until `timeout`.
    ///
    /// A lock taken on a file that has since been retired (unlinked by its
    /// previous holder) is dropped and the new file at `path` is locked instead.
    pub fn acquire(path: &Path, mode: LockMode, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let started = Instant::now();
        let mut backoff = RETRY_INITIAL;
        let mut file = open_lock_file(path)?;
        loop {
            if sys::try_lock(&file, mode)? {
                if sys::is_current(&file, path)? {
                    trace!(target: "synapse::lock", "Acquired {:?} file lock on {}", mode, path.display());
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                        mode,
                    });
                }
                trace!(target: "synapse::lock", "Lock file {} was retired, reopening", path.display());
                sys::unlock(&file);
                file = open_lock_file(path)?;
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(SynapseError::LockTimeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            thread::sleep(backoff.min(timeout - waited));
            backoff = (backoff * 2).min(RETRY_MAX);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Unlink the lock file while still holding it, then release. Only valid
    /// under an exclusive lock; waiters on the old file reopen on wake-up.
    fn retire(self) {
        debug_assert_eq!(self.mode, LockMode::Exclusive);
        match fs::remove_file(&self.path) {
            Ok(()) => trace!(target: "synapse::lock", "Retired lock file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(target: "synapse::lock", "Failed to retire lock file {}: {}", self.path.display(), e),
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

impl Drop for ScopedFileLock {
    fn drop(&mut self) {
        sys::unlock(&self.file);
        trace!(target: "synapse::lock", "Released file lock on {}", self.path.display());
    }
}

#[cfg(unix)]
mod sys {
    use super::LockMode;
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    pub fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
        let operation = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        } | libc::LOCK_NB;

        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => Ok(false),
            Some(code) if code == libc::EINTR => Ok(false),
            _ => Err(err),
        }
    }

    pub fn unlock(file: &File) {
        // SAFETY: as above; failure only means the lock was already gone.
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }

    /// Whether `file` is still the file linked at `path`.
    pub fn is_current(file: &File, path: &Path) -> io::Result<bool> {
        let held = file.metadata()?;
        match std::fs::metadata(path) {
            Ok(linked) => Ok(held.dev() == linked.dev() && held.ino() == linked.ino()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// Without flock only the in-process table serializes access.
#[cfg(not(unix))]
mod sys {
    use super::LockMode;
    use std::fs::File;
    use std::io;
    use std::path::Path;

    pub fn try_lock(_file: &File, _mode: LockMode) -> io::Result<bool> {
        Ok(true)
    }

    pub fn unlock(_file: &File) {}

    pub fn is_current(_file: &File, _path: &Path) -> io::Result<bool> {
        Ok(true)
    }
}

/// Table of per-path reader/writer locks plus the directory for lock files.
#[derive(Debug)]
pub struct LockTable {
    locks: DashMap<PathBuf, Arc<RwLock<()>>>,
    lock_dir: PathBuf,
    timeout: Duration,
}

impl LockTable {
    pub fn new(lock_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            lock_dir: lock_dir.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `f` while holding both lock layers for `path` in `mode`.
    ///
    /// Acquisition of both layers shares a single deadline; running out of
    /// time yields [`SynapseError::LockTimeout`] without calling `f`.
    pub fn with_lock<T>(&self, path: &Path, mode: LockMode, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.run(path, mode, false, f)
    }

    /// Exclusive variant for operations that remove `path`. Once `f`
    /// succeeds the companion lock file is removed before release.
    pub fn with_retiring_lock<T>(&self, path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.run(path, LockMode::Exclusive, true, f)
    }

    /// Lock file backing the OS lock for `path`.
    pub fn lock_file_for(&self, path: &Path) -> PathBuf {
        let digest = Sha256::digest(path.to_string_lossy().as_bytes());
        let name = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect::<String>();
        self.lock_dir.join(format!("{}.lock", name))
    }

    fn run<T>(&self, path: &Path, mode: LockMode, retire: bool, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let key = absolute(path);
        let entry = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone();

        let result = self.hold(&key, &entry, mode, retire, f);

        // Last user out removes the entry; anyone still holding a clone keeps it alive.
        drop(entry);
        self.locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn hold<T>(
        &self,
        key: &Path,
        entry: &RwLock<()>,
        mode: LockMode,
        retire: bool,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let started = Instant::now();
        let timeout_err = |started: Instant| SynapseError::LockTimeout {
            path: key.to_path_buf(),
            waited: started.elapsed(),
        };

        // Guards drop in reverse declaration order: file lock first, then the in-process lock.
        let _read_guard;
        let _write_guard;
        match mode {
            LockMode::Shared => {
                _read_guard = entry.try_read_for(self.timeout).ok_or_else(|| timeout_err(started))?;
            }
            LockMode::Exclusive => {
                _write_guard = entry.try_write_for(self.timeout).ok_or_else(|| timeout_err(started))?;
            }
        }

        let remaining = self.timeout.saturating_sub(started.elapsed());
        let file_lock = ScopedFileLock::acquire(&self.lock_file_for(key), mode, remaining)
            .map_err(|e| match e {
                SynapseError::LockTimeout { .. } => timeout_err(started),
                other => other,
            })?;

        debug!(target: "synapse::lock", "Holding {:?} lock on {}", mode, key.display());
        let value = f()?;
        if retire {
            file_lock.retire();
        }
        Ok(value)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
