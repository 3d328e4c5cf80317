//! Build subsystem.
//!
//! The orchestrator only sees the `Builder` trait. `LocalBuilds` is the
//! bundled implementation: builds are keyed by a hash of the build script
//! and its config, shared between runs in `<working_dir>/builds/`, and made
//! under a per-build lock so concurrent runs wanting the same build wait for
//! one of them to finish it.

use crate::errors::{RunError, StoreError};
use crate::executor::{ScriptInvocation, Supervision, supervise};
use crate::store::{LockFile, LockGuard};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const DEPRECATED_FN: &str = ".deprecated";
pub const BUILD_LOG_FN: &str = "build.log";
const BUILD_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A handle on one build, as seen by a test run.
#[async_trait]
pub trait Builder: Send + Sync {
    fn name(&self) -> &str;
    /// Where the finished build lives.
    fn path(&self) -> &Path;
    /// Where a failed build's working tree is left.
    fn fail_path(&self) -> &Path;
    /// Make sure the build exists. `Ok(false)` is an ordinary build failure.
    async fn build(&self, cancel: CancellationToken) -> Result<bool, RunError>;
    /// Copy the finished build tree to `dest`.
    fn copy_build(&self, dest: &Path) -> Result<bool, RunError>;
}

/// What a run tells the build subsystem about itself.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub run_id: u64,
    pub script: &'a Path,
    pub section: &'a Map<String, Value>,
    pub timeout: Option<Duration>,
    /// Name recorded by an earlier process for this run.
    pub existing_name: Option<&'a str>,
    pub rebuild: bool,
}

pub trait BuildSubsystem: Send + Sync {
    fn builder(&self, request: BuildRequest<'_>) -> Result<Box<dyn Builder>, RunError>;
}

#[derive(Debug, Clone)]
pub struct LocalBuilds {
    builds_dir: PathBuf,
    lock_timeout: Duration,
}

impl LocalBuilds {
    pub fn new(builds_dir: PathBuf, lock_timeout: Duration) -> Self {
        Self {
            builds_dir,
            lock_timeout,
        }
    }

    fn build_hash(script: &Path, section: &Map<String, Value>) -> Result<String, RunError> {
        let mut hasher = Sha256::new();
        hasher.update(fs::read(script).map_err(|e| RunError::storage(script, e))?);
        hasher.update(
            serde_json::to_vec(section)
                .map_err(|e| RunError::config(format!("build config not serializable: {}", e)))?,
        );
        let digest = format!("{:x}", hasher.finalize());
        Ok(digest[..16].to_string())
    }

    /// First name for `hash` whose build is not deprecated. With `rebuild`,
    /// an existing build is deprecated and skipped.
    fn choose_name(&self, hash: &str, rebuild: bool) -> Result<String, RunError> {
        let mut n = 1;
        loop {
            let name = if n == 1 {
                hash.to_string()
            } else {
                format!("{}-{}", hash, n)
            };
            let dir = self.builds_dir.join(&name);
            n += 1;

            if !dir.exists() {
                return Ok(name);
            }
            if dir.join(DEPRECATED_FN).exists() {
                continue;
            }
            if rebuild {
                let marker = dir.join(DEPRECATED_FN);
                fs::write(&marker, "").map_err(|e| RunError::storage(&marker, e))?;
                info!(build = %name, "deprecated build for rebuild");
                continue;
            }
            return Ok(name);
        }
    }
}

impl BuildSubsystem for LocalBuilds {
    fn builder(&self, request: BuildRequest<'_>) -> Result<Box<dyn Builder>, RunError> {
        let name = match request.existing_name {
            Some(name) => name.to_string(),
            None => {
                let hash = Self::build_hash(request.script, request.section)?;
                self.choose_name(&hash, request.rebuild)?
            }
        };
        debug!(run_id = request.run_id, build = %name, "selected build");

        Ok(Box::new(LocalBuilder {
            path: self.builds_dir.join(&name),
            fail_path: self
                .builds_dir
                .join(format!(".staging-{}-{}", name, request.run_id)),
            lock_path: self.builds_dir.join(format!("{}.lock", name)),
            name,
            builds_dir: self.builds_dir.clone(),
            script: request.script.to_path_buf(),
            run_id: request.run_id,
            timeout: request.timeout,
            lock_timeout: self.lock_timeout,
        }))
    }
}

pub struct LocalBuilder {
    name: String,
    path: PathBuf,
    fail_path: PathBuf,
    lock_path: PathBuf,
    builds_dir: PathBuf,
    script: PathBuf,
    run_id: u64,
    timeout: Option<Duration>,
    lock_timeout: Duration,
}

impl LocalBuilder {
    /// Wait for the per-build lock. `None` means `cancel` fired first.
    async fn lock(&self, cancel: &CancellationToken) -> Result<Option<LockGuard>, RunError> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            if let Some(guard) = LockFile::try_acquire(&self.lock_path)? {
                return Ok(Some(guard));
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout {
                    path: self.lock_path.clone(),
                    timeout: self.lock_timeout,
                }
                .into());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(BUILD_LOCK_POLL_INTERVAL) => {}
            }
        }
    }
}

#[async_trait]
impl Builder for LocalBuilder {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn fail_path(&self) -> &Path {
        &self.fail_path
    }

    async fn build(&self, cancel: CancellationToken) -> Result<bool, RunError> {
        if self.path.is_dir() {
            debug!(build = %self.name, "reusing existing build");
            return Ok(true);
        }
        fs::create_dir_all(&self.builds_dir).map_err(|e| RunError::storage(&self.builds_dir, e))?;

        let Some(_guard) = self.lock(&cancel).await? else {
            info!(build = %self.name, "cancelled while waiting for the build lock");
            return Ok(false);
        };

        // Someone else may have finished it while we waited on the lock.
        if self.path.is_dir() {
            return Ok(true);
        }

        if self.fail_path.exists() {
            fs::remove_dir_all(&self.fail_path).map_err(|e| RunError::storage(&self.fail_path, e))?;
        }
        fs::create_dir_all(&self.fail_path).map_err(|e| RunError::storage(&self.fail_path, e))?;

        let invocation = ScriptInvocation {
            script: self.script.clone(),
            args: vec![self.run_id.to_string()],
            cwd: Some(self.fail_path.clone()),
            log_path: self.fail_path.join(BUILD_LOG_FN),
        };
        let mut child = invocation.spawn().await?;
        info!(build = %self.name, run_id = self.run_id, "building");

        match supervise(&mut child, &invocation.log_path, self.timeout, Some(&cancel)).await? {
            outcome if outcome.success() => {
                fs::rename(&self.fail_path, &self.path)
                    .map_err(|e| RunError::storage(&self.path, e))?;
                info!(build = %self.name, "build complete");
                Ok(true)
            }
            Supervision::Exited(status) => {
                warn!(build = %self.name, code = ?status.code(), "build script failed");
                Ok(false)
            }
            Supervision::QuietTimeout { quiet } => {
                warn!(build = %self.name, quiet_secs = quiet.as_secs(), "build timed out");
                Ok(false)
            }
            Supervision::Cancelled => {
                info!(build = %self.name, "build cancelled");
                Ok(false)
            }
        }
    }

    fn copy_build(&self, dest: &Path) -> Result<bool, RunError> {
        copy_tree(&self.path, dest)?;
        Ok(true)
    }
}

/// Recursively copy `src` to `dest`, recreating symlinks rather than following them.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<(), RunError> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| RunError::Other(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| RunError::Other(e.into()))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| RunError::storage(&target, e))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| RunError::storage(entry.path(), e))?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target).map_err(|e| RunError::storage(&target, e))?;
            #[cfg(not(unix))]
            fs::copy(entry.path(), &target).map_err(|e| RunError::storage(&target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| RunError::storage(&target, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_script(path: &Path, body: &str) {
        fs::write(path, format!("#!/bin/bash\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn request<'a>(
        script: &'a Path,
        section: &'a Map<String, Value>,
        rebuild: bool,
    ) -> BuildRequest<'a> {
        BuildRequest {
            run_id: 1,
            script,
            section,
            timeout: Some(Duration::from_secs(10)),
            existing_name: None,
            rebuild,
        }
    }

    #[test]
    fn test_same_script_same_name() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("build.sh");
        write_script(&script, "echo hi");
        let section = json!({"cmds": ["echo hi"]}).as_object().unwrap().clone();
        let builds = LocalBuilds::new(dir.path().join("builds"), Duration::from_secs(1));

        let a = builds.builder(request(&script, &section, false)).unwrap();
        let b = builds.builder(request(&script, &section, false)).unwrap();
        assert_eq!(a.name(), b.name());
        assert_eq!(a.name().len(), 16);

        let other = json!({"cmds": ["echo bye"]}).as_object().unwrap().clone();
        let c = builds.builder(request(&script, &other, false)).unwrap();
        assert_ne!(a.name(), c.name());
    }

    #[tokio::test]
    async fn test_build_success_and_copy() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("build.sh");
        write_script(&script, "echo built > artifact; mkdir sub; echo x > sub/y; ln -s artifact link");
        let section = Map::new();
        let builds = LocalBuilds::new(dir.path().join("builds"), Duration::from_secs(5));
        let builder = builds.builder(request(&script, &section, false)).unwrap();

        assert!(builder.build(CancellationToken::new()).await.unwrap());
        assert!(builder.path().join("artifact").exists());
        assert!(!builder.fail_path().exists());

        let dest = dir.path().join("copy");
        assert!(builder.copy_build(&dest).unwrap());
        assert_eq!(fs::read_to_string(dest.join("sub/y")).unwrap(), "x\n");
        assert!(fs::symlink_metadata(dest.join("link")).unwrap().file_type().is_symlink());

        // A second build of the same name reuses the first.
        assert!(builder.build(CancellationToken::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_build_failure_leaves_fail_path() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("build.sh");
        write_script(&script, "echo oops; exit 1");
        let section = Map::new();
        let builds = LocalBuilds::new(dir.path().join("builds"), Duration::from_secs(5));
        let builder = builds.builder(request(&script, &section, false)).unwrap();

        assert!(!builder.build(CancellationToken::new()).await.unwrap());
        assert!(!builder.path().exists());
        let log = fs::read_to_string(builder.fail_path().join(BUILD_LOG_FN)).unwrap();
        assert!(log.contains("oops"));
    }

    #[tokio::test]
    async fn test_cancelled_build_fails() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("build.sh");
        write_script(&script, "sleep 30");
        let section = Map::new();
        let builds = LocalBuilds::new(dir.path().join("builds"), Duration::from_secs(5));
        let builder = builds.builder(request(&script, &section, false)).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(!builder.build(token).await.unwrap());
        assert!(!builder.path().exists());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_build_lock() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("build.sh");
        write_script(&script, "echo built > artifact");
        let section = Map::new();
        let builds_dir = dir.path().join("builds");
        let builds = LocalBuilds::new(builds_dir.clone(), Duration::from_secs(600));
        let builder = builds.builder(request(&script, &section, false)).unwrap();

        fs::create_dir_all(&builds_dir).unwrap();
        let lock_path = builds_dir.join(format!("{}.lock", builder.name()));
        let _held = LockFile::acquire(&lock_path, Duration::from_secs(1)).unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        assert!(!builder.build(token).await.unwrap());
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(!builder.path().exists());
        assert!(!builder.fail_path().exists());
    }

    #[tokio::test]
    async fn test_build_lock_timeout() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("build.sh");
        write_script(&script, "echo built > artifact");
        let section = Map::new();
        let builds_dir = dir.path().join("builds");
        let builds = LocalBuilds::new(builds_dir.clone(), Duration::from_millis(200));
        let builder = builds.builder(request(&script, &section, false)).unwrap();

        fs::create_dir_all(&builds_dir).unwrap();
        let lock_path = builds_dir.join(format!("{}.lock", builder.name()));
        let _held = LockFile::acquire(&lock_path, Duration::from_secs(1)).unwrap();

        let err = builder.build(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Store(StoreError::LockTimeout { .. })));
    }

    #[tokio::test]
    async fn test_rebuild_deprecates_existing_build() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("build.sh");
        write_script(&script, "echo built > artifact");
        let section = Map::new();
        let builds = LocalBuilds::new(dir.path().join("builds"), Duration::from_secs(5));

        let first = builds.builder(request(&script, &section, false)).unwrap();
        assert!(first.build(CancellationToken::new()).await.unwrap());

        let second = builds.builder(request(&script, &section, true)).unwrap();
        assert_eq!(second.name(), format!("{}-2", first.name()));
        assert!(first.path().join(DEPRECATED_FN).exists());

        // Without rebuild, deprecated builds are still passed over.
        let third = builds.builder(request(&script, &section, false)).unwrap();
        assert_eq!(third.name(), second.name());
    }
}
