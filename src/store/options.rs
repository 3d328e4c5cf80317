use crate::errors::StoreError;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Per-run options, written once when the run is created.
///
/// Unknown keys are ignored and missing keys take their defaults, so runs
/// written by older or newer versions still load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Only build this run, never execute it.
    pub build_only: bool,
    /// Deprecate the matching build and make a fresh one.
    pub rebuild: bool,
}

/// What happened when the options file was saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionsSave {
    Written,
    /// The file already existed and was left alone.
    AlreadyPresent,
}

impl RunOptions {
    pub fn save(&self, path: &Path) -> Result<OptionsSave, StoreError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| StoreError::Config(format!("could not serialize run options: {}", e)))?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Ok(OptionsSave::AlreadyPresent);
            }
            Err(e) => return Err(StoreError::storage(path, e)),
        };
        file.write_all(&json)
            .map_err(|e| StoreError::storage(path, e))?;

        Ok(OptionsSave::Written)
    }

    /// Load options, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| StoreError::storage(path, e))?;
        serde_json::from_str(&content).map_err(|e| {
            StoreError::Config(format!(
                "could not parse run options at {}: {}",
                path.display(),
                e
            ))
        })
    }
}
