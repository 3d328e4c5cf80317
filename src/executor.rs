//! Quiet-timeout process supervision.
//!
//! A child is only killed once its output file has gone unmodified for the
//! whole timeout. A child that keeps writing may run for as long as it likes.

use crate::errors::RunError;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, SystemTime};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a supervised child ended.
#[derive(Debug)]
pub enum Supervision {
    Exited(ExitStatus),
    /// Killed after `quiet` without output.
    QuietTimeout { quiet: Duration },
    /// Killed because the cancellation token fired.
    Cancelled,
}

impl Supervision {
    pub fn success(&self) -> bool {
        matches!(self, Supervision::Exited(status) if status.code() == Some(0))
    }
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Cancelled,
}

/// A script invocation whose combined output goes to a log file.
#[derive(Debug, Clone)]
pub struct ScriptInvocation {
    pub script: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub log_path: PathBuf,
}

impl ScriptInvocation {
    /// Create/truncate the log and start the script with stdout and stderr
    /// both pointed at it.
    pub async fn spawn(&self) -> Result<Child, RunError> {
        let log = File::create(&self.log_path).map_err(|e| RunError::storage(&self.log_path, e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| RunError::storage(&self.log_path, e))?;

        let mut cmd = Command::new(&self.script);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        // A freshly written script can briefly be "text file busy" when another
        // thread forks while holding it open for writing.
        let mut attempts = 0;
        let child = loop {
            match cmd.spawn() {
                Ok(child) => break child,
                Err(e) if e.kind() == std::io::ErrorKind::ExecutableFileBusy && attempts < 10 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(source) => {
                    return Err(RunError::Spawn {
                        script: self.script.clone(),
                        source,
                    });
                }
            }
        };
        debug!(
            script = %self.script.display(),
            pid = child.id().unwrap_or(0),
            "spawned"
        );
        Ok(child)
    }
}

/// How long since `path` was last modified.
fn quiet_time(path: &Path) -> Result<Duration, RunError> {
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| RunError::storage(path, e))?;
    // An mtime in the future (clock skew on a shared filesystem) counts as fresh output.
    Ok(SystemTime::now()
        .duration_since(mtime)
        .unwrap_or(Duration::ZERO))
}

/// Wait for `child`, killing it if `log_path` stays quiet for `quiet_timeout`
/// or `cancel` fires. `None` for the timeout waits indefinitely.
///
/// Each wait lasts until the moment the log would have been quiet for the
/// full timeout; if output happened in the meantime the wait is re-armed for
/// the remainder.
pub async fn supervise(
    child: &mut Child,
    log_path: &Path,
    quiet_timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> Result<Supervision, RunError> {
    let mut budget = quiet_timeout;

    loop {
        let deadline = async move {
            match budget {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = async move {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            _ = deadline => Wake::Deadline,
            _ = cancelled => Wake::Cancelled,
        };

        match wake {
            Wake::Exited(status) => {
                let status = status.map_err(|e| RunError::Other(e.into()))?;
                debug!(code = ?status.code(), "child exited");
                return Ok(Supervision::Exited(status));
            }
            Wake::Cancelled => {
                info!("cancellation requested, killing child");
                kill(child).await;
                return Ok(Supervision::Cancelled);
            }
            Wake::Deadline => {
                let Some(limit) = quiet_timeout else {
                    continue;
                };
                let quiet = match quiet_time(log_path) {
                    Ok(quiet) => quiet,
                    Err(e) => {
                        kill(child).await;
                        return Err(e);
                    }
                };
                if quiet >= limit {
                    warn!(quiet_secs = quiet.as_secs_f64(), "no output within timeout, killing child");
                    kill(child).await;
                    return Ok(Supervision::QuietTimeout { quiet });
                }
                budget = Some(limit - quiet);
            }
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(err = %e, "failed to kill child");
    }
}
