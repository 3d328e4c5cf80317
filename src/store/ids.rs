//! Run id allocation.
//!
//! Ids are the smallest positive integers without a directory, so ids of
//! deleted runs are handed out again. The scan and the `mkdir` both happen
//! under one acquisition of `<runs_dir>/.lockfile`.

use super::lock::LockFile;
use crate::errors::StoreError;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

const ID_LOCK_FN: &str = ".lockfile";

/// Directory for run `id` under `runs_dir`.
pub fn run_path(runs_dir: &Path, id: u64) -> PathBuf {
    runs_dir.join(id.to_string())
}

/// Allocate the lowest free id and create its directory.
pub fn allocate_id(runs_dir: &Path, timeout: Duration) -> Result<(u64, PathBuf), StoreError> {
    fs::create_dir_all(runs_dir).map_err(|e| StoreError::storage(runs_dir, e))?;

    let lock_path = runs_dir.join(ID_LOCK_FN);
    let _guard = LockFile::acquire(&lock_path, timeout).map_err(|e| match e {
        StoreError::LockTimeout { timeout, .. } => StoreError::AllocationTimeout {
            dir: runs_dir.to_path_buf(),
            timeout,
        },
        other => other,
    })?;

    let used = existing_ids(runs_dir)?;
    let id = (1..)
        .find(|candidate| !used.contains(candidate))
        .unwrap_or(1);

    let path = run_path(runs_dir, id);
    fs::create_dir(&path).map_err(|source| StoreError::Allocation {
        path: path.clone(),
        source,
    })?;

    debug!(id, path = %path.display(), "allocated run id");
    Ok((id, path))
}

fn existing_ids(runs_dir: &Path) -> Result<BTreeSet<u64>, StoreError> {
    let entries = fs::read_dir(runs_dir).map_err(|e| StoreError::storage(runs_dir, e))?;

    Ok(entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| parse_id(&e.file_name().to_string_lossy()))
        .collect())
}

fn parse_id(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok().filter(|id| *id > 0)
}

/// The `limit` most recently modified run ids, oldest first.
pub fn latest_runs(runs_dir: &Path, limit: usize) -> Result<Vec<u64>, StoreError> {
    if !runs_dir.exists() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(runs_dir).map_err(|e| StoreError::storage(runs_dir, e))?;
    let mut runs: Vec<(SystemTime, u64)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let id = parse_id(&e.file_name().to_string_lossy())?;
            let mtime = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((mtime, id))
        })
        .collect();

    runs.sort();
    let skip = runs.len().saturating_sub(limit);
    Ok(runs.into_iter().skip(skip).map(|(_, id)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_first_allocation_is_one() {
        let dir = tempdir().unwrap();
        let runs = dir.path().join("test_runs");
        let (id, path) = allocate_id(&runs, TIMEOUT).unwrap();
        assert_eq!(id, 1);
        assert_eq!(path, runs.join("1"));
        assert!(path.is_dir());
    }

    #[test]
    fn test_deleted_id_is_reused() {
        let dir = tempdir().unwrap();
        for _ in 0..4 {
            allocate_id(dir.path(), TIMEOUT).unwrap();
        }
        fs::remove_dir(run_path(dir.path(), 3)).unwrap();

        let (id, _) = allocate_id(dir.path(), TIMEOUT).unwrap();
        assert_eq!(id, 3);
        let (id, _) = allocate_id(dir.path(), TIMEOUT).unwrap();
        assert_eq!(id, 5);
    }

    #[test]
    fn test_non_numeric_entries_are_ignored() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("scratch")).unwrap();
        fs::create_dir(dir.path().join("0")).unwrap();
        fs::write(dir.path().join("1"), "a file, not a run").unwrap();

        // "1" is a plain file, so mkdir collides with it.
        let err = allocate_id(dir.path(), TIMEOUT).unwrap_err();
        assert!(matches!(err, StoreError::Allocation { .. }));
    }

    #[test]
    fn test_concurrent_allocation_is_dense_and_unique() {
        let dir = tempdir().unwrap();
        let runs = Arc::new(dir.path().join("test_runs"));
        let n = 16;

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let runs = Arc::clone(&runs);
                std::thread::spawn(move || allocate_id(&runs, Duration::from_secs(30)).unwrap().0)
            })
            .collect();

        let mut ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        assert_eq!(ids, (1..=n as u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_allocation_times_out_when_lock_held() {
        let dir = tempdir().unwrap();
        let _held = LockFile::acquire(&dir.path().join(ID_LOCK_FN), TIMEOUT).unwrap();

        let err = allocate_id(dir.path(), Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, StoreError::AllocationTimeout { .. }));
        assert!(!run_path(dir.path(), 1).exists());
    }

    #[test]
    fn test_latest_runs_limits_and_orders() {
        let dir = tempdir().unwrap();
        for _ in 0..3 {
            allocate_id(dir.path(), TIMEOUT).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(latest_runs(dir.path(), 2).unwrap(), vec![2, 3]);
        assert_eq!(latest_runs(dir.path(), 10).unwrap(), vec![1, 2, 3]);
        assert!(latest_runs(&dir.path().join("missing"), 5).unwrap().is_empty());
    }
}
