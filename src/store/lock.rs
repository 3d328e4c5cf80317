use crate::errors::StoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// An exclusive advisory lock on a sentinel file.
///
/// The lock is an `flock` on the open file, so it excludes other processes
/// (and other open handles in this process) that lock the same path, on any
/// host sharing the filesystem when the filesystem honors `flock`.
pub struct LockFile;

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Try to take the lock without waiting.
    ///
    /// Returns `Ok(None)` if someone else holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<LockGuard>, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::storage(path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LockGuard {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(StoreError::storage(path, e)),
        }
    }

    /// Take the lock, polling until `timeout` has elapsed.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<LockGuard, StoreError> {
        let start = Instant::now();
        loop {
            if let Some(guard) = Self::try_acquire(path)? {
                debug!(path = %path.display(), waited_ms = start.elapsed().as_millis() as u64, "lock acquired");
                return Ok(guard);
            }
            if start.elapsed() >= timeout {
                return Err(StoreError::LockTimeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            // Closing the handle releases the flock regardless.
            warn!(path = %self.path.display(), err = %e, "failed to unlock");
        }
    }
}
