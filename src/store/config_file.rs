use super::lock::LockFile;
use crate::errors::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A JSON document guarded by a sibling `<name>.lockfile`.
///
/// Readers and writers both take the lock, so a reader never sees a
/// half-written document.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
    lock_path: PathBuf,
    timeout: Duration,
}

impl ConfigFile {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        let mut lock_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        lock_name.push(".lockfile");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Serialize `value` and replace the document.
    ///
    /// Serialization happens before the lock is taken; a value that cannot be
    /// represented as JSON is a `Config` error and leaves the file untouched.
    pub fn save<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(value).map_err(|e| {
            StoreError::Config(format!(
                "value for {} is not representable as JSON: {}",
                self.path.display(),
                e
            ))
        })?;

        let _guard = LockFile::acquire(&self.lock_path, self.timeout)?;
        let mut file = fs::File::create(&self.path).map_err(|e| StoreError::storage(&self.path, e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_data())
            .map_err(|e| StoreError::storage(&self.path, e))?;
        Ok(())
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        if !self.exists() {
            return Err(StoreError::storage(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
            ));
        }

        let _guard = LockFile::acquire(&self.lock_path, self.timeout)?;
        let content = fs::read_to_string(&self.path).map_err(|e| StoreError::storage(&self.path, e))?;
        serde_json::from_str(&content).map_err(|e| {
            StoreError::Config(format!("bad config values in {}: {}", self.path.display(), e))
        })
    }
}
