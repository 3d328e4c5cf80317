//! Harness configuration.
//!
//! Read from `<working_dir>/harness.toml` (or an explicit path), layered as
//! file → environment → CLI.
//!
//! ```toml
//! working_dir = "/scratch/harness"
//!
//! [locks]
//! allocation_timeout_ms = 1000
//! config_timeout_ms = 3000
//! build_timeout_secs = 3600
//!
//! [wait]
//! poll_interval_ms = 500
//!
//! [sys]
//! sys_name = "cluster-a"
//! user = "ci"
//! ```

use crate::store::completion::DEFAULT_POLL_INTERVAL;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "harness.toml";
pub const WORKING_DIR_ENV: &str = "HARNESS_WORKING_DIR";

/// Lock timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksSection {
    /// How long to wait for the run id lock
    #[serde(default = "default_allocation_timeout_ms")]
    pub allocation_timeout_ms: u64,
    /// How long to wait for a run's config lock
    #[serde(default = "default_config_timeout_ms")]
    pub config_timeout_ms: u64,
    /// How long to wait for another process to finish the same build
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
}

fn default_allocation_timeout_ms() -> u64 {
    1000
}

fn default_config_timeout_ms() -> u64 {
    3000
}

fn default_build_timeout_secs() -> u64 {
    3600
}

impl Default for LocksSection {
    fn default() -> Self {
        Self {
            allocation_timeout_ms: default_allocation_timeout_ms(),
            config_timeout_ms: default_config_timeout_ms(),
            build_timeout_secs: default_build_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

impl Default for WaitSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Facts about the system, exposed to runs as the `sys` variable set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysSection {
    #[serde(default)]
    pub sys_name: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

/// Contents of `harness.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessToml {
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub locks: LocksSection,
    #[serde(default)]
    pub wait: WaitSection,
    #[serde(default)]
    pub sys: SysSection,
}

impl HarnessToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid harness configuration")
    }

    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Resolved settings every run needs.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub working_dir: PathBuf,
    pub allocation_timeout: Duration,
    pub config_lock_timeout: Duration,
    pub build_lock_timeout: Duration,
    pub poll_interval: Duration,
    pub sys_name: String,
    pub user: String,
}

impl HarnessConfig {
    /// Resolve the working directory (CLI → env → file → cwd) and load settings.
    pub fn resolve(cli_working_dir: Option<PathBuf>, config_file: Option<&Path>) -> Result<Self> {
        let env_dir = std::env::var_os(WORKING_DIR_ENV).map(PathBuf::from);
        let probe_dir = match cli_working_dir.clone().or_else(|| env_dir.clone()) {
            Some(dir) => dir,
            None => std::env::current_dir().context("Failed to get current directory")?,
        };

        let toml = match config_file {
            Some(path) => HarnessToml::load(path)?,
            None => HarnessToml::load_or_default(&probe_dir)?,
        };

        let working_dir = cli_working_dir
            .or(env_dir)
            .or_else(|| toml.working_dir.clone())
            .unwrap_or(probe_dir);

        Self::from_toml(working_dir, &toml)
    }

    pub fn from_toml(working_dir: PathBuf, toml: &HarnessToml) -> Result<Self> {
        std::fs::create_dir_all(&working_dir).with_context(|| {
            format!("Failed to create working directory {}", working_dir.display())
        })?;
        let working_dir = working_dir
            .canonicalize()
            .context("Failed to resolve working directory")?;

        Ok(Self {
            working_dir,
            allocation_timeout: Duration::from_millis(toml.locks.allocation_timeout_ms),
            config_lock_timeout: Duration::from_millis(toml.locks.config_timeout_ms),
            build_lock_timeout: Duration::from_secs(toml.locks.build_timeout_secs),
            poll_interval: Duration::from_millis(toml.wait.poll_interval_ms),
            sys_name: toml.sys.sys_name.clone().unwrap_or_else(host_name),
            user: toml
                .sys
                .user
                .clone()
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Defaults rooted at `working_dir`.
    pub fn for_dir(working_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::from_toml(working_dir.into(), &HarnessToml::default())
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.working_dir.join("test_runs")
    }

    pub fn builds_dir(&self) -> PathBuf {
        self.working_dir.join("builds")
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let toml = HarnessToml::parse("").unwrap();
        assert_eq!(toml.locks.allocation_timeout_ms, 1000);
        assert_eq!(toml.locks.config_timeout_ms, 3000);
        assert_eq!(toml.wait.poll_interval_ms, 500);
        assert!(toml.working_dir.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let toml = HarnessToml::parse(
            r#"
            [locks]
            config_timeout_ms = 250

            [sys]
            sys_name = "cluster-a"
            "#,
        )
        .unwrap();
        assert_eq!(toml.locks.config_timeout_ms, 250);
        assert_eq!(toml.locks.allocation_timeout_ms, 1000);
        assert_eq!(toml.sys.sys_name.as_deref(), Some("cluster-a"));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(HarnessToml::parse("[locks\n").is_err());
    }

    #[test]
    fn test_from_toml_resolves_dirs() {
        let dir = tempdir().unwrap();
        let toml = HarnessToml::parse("[sys]\nsys_name = \"box\"\nuser = \"me\"\n").unwrap();
        let config = HarnessConfig::from_toml(dir.path().join("work"), &toml).unwrap();

        let root = dir.path().join("work").canonicalize().unwrap();
        assert_eq!(config.working_dir, root);
        assert_eq!(config.runs_dir(), root.join("test_runs"));
        assert_eq!(config.builds_dir(), root.join("builds"));
        assert_eq!(config.sys_name, "box");
        assert_eq!(config.user, "me");
    }

    #[test]
    fn test_resolve_prefers_cli_dir_and_reads_its_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[wait]\npoll_interval_ms = 50\n",
        )
        .unwrap();

        let config = HarnessConfig::resolve(Some(dir.path().to_path_buf()), None).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.working_dir, dir.path().canonicalize().unwrap());
    }
}
