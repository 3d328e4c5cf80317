//! Typed error hierarchy for the harness.
//!
//! Two top-level enums cover the two layers:
//! - `StoreError`: shared-filesystem primitives (locks, id allocation, config files)
//! - `RunError`: lifecycle failures of a single test run

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from the filesystem coordination layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Timed out after {timeout:?} waiting for the id lock in {dir}")]
    AllocationTimeout { dir: PathBuf, timeout: Duration },

    #[error("Could not create run directory {path} while holding the id lock: {source}")]
    Allocation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {timeout:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("I/O error on {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Storage {
            path: path.into(),
            source,
        }
    }
}

/// Errors from a test run's lifecycle.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("No test run with id {id} exists at {path}")]
    NotFound { id: u64, path: PathBuf },

    #[error("Run {id} timed out after {quiet:?} without output")]
    RunTimeout { id: u64, quiet: Duration },

    #[error("Timed out after {timeout:?} waiting for run {id} to complete")]
    CompletionTimeout { id: u64, timeout: Duration },

    #[error("Build was requested a second time for run {id}")]
    AlreadyBuilt { id: u64 },

    #[error("Run {id} has a failed build in {path}")]
    BuildFailed { id: u64, path: PathBuf },

    #[error("Options were written a second time for run {id}")]
    OptionsAlreadyWritten { id: u64 },

    #[error("Run {id} was already finalized")]
    AlreadyFinalized { id: u64 },

    #[error("Run {id} has not been finalized")]
    NotFinalized { id: u64 },

    #[error("Results were already saved for run {id}")]
    ResultsAlreadyWritten { id: u64 },

    #[error("Results requested for run {id}, which was never run")]
    NotRun { id: u64 },

    #[error("Failed to spawn {script}: {source}")]
    Spawn {
        script: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        RunError::Store(StoreError::Config(message.into()))
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RunError::Store(StoreError::storage(path, source))
    }

    /// True for configuration problems, which are always fatal.
    pub fn is_config(&self) -> bool {
        matches!(self, RunError::Store(StoreError::Config(_)))
    }
}
