use crate::errors::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize, Deserialize)]
struct MarkerBody {
    complete: String,
}

/// The `RUN_COMPLETE` file observers poll to learn that a run has finished.
///
/// It is written with a single unlocked `write`. A reader that catches it
/// half-written sees a parse failure and reports "not complete yet".
#[derive(Debug, Clone)]
pub struct CompletionMarker {
    path: PathBuf,
    poll_interval: Duration,
}

impl CompletionMarker {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the marker. A marker that already exists is left as it is.
    pub fn mark(&self) -> Result<(), StoreError> {
        let body = MarkerBody {
            complete: Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_vec(&body)
            .map_err(|e| StoreError::Config(format!("could not serialize marker: {}", e)))?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(path = %self.path.display(), "run already marked complete");
                return Ok(());
            }
            Err(e) => return Err(StoreError::storage(&self.path, e)),
        };
        file.write_all(&json)
            .and_then(|_| file.flush())
            .map_err(|e| StoreError::storage(&self.path, e))
    }

    /// When the run completed, or `None` if it has not (or the marker is unreadable).
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), err = %e, "failed to read run complete file");
                return None;
            }
        };

        let parsed = serde_json::from_str::<MarkerBody>(&content)
            .map_err(|e| e.to_string())
            .and_then(|body| {
                DateTime::parse_from_rfc3339(&body.complete).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!(path = %self.path.display(), err = %e, "malformed run complete file");
                None
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at().is_some()
    }

    /// Poll until the marker appears. `None` waits forever.
    ///
    /// Returns `None` if the deadline passes first.
    pub async fn wait(&self, timeout: Option<Duration>) -> Option<DateTime<Utc>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(ts) = self.completed_at() {
                return Some(ts);
            }

            tokio::time::sleep(self.poll_interval).await;

            if let Some(deadline) = deadline
                && Instant::now() > deadline
            {
                debug!(path = %self.path.display(), "gave up waiting for completion");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn marker(dir: &Path) -> CompletionMarker {
        CompletionMarker::new(dir.join("RUN_COMPLETE"), Duration::from_millis(20))
    }

    #[test]
    fn test_absent_marker_is_not_complete() {
        let dir = tempdir().unwrap();
        assert!(marker(dir.path()).completed_at().is_none());
    }

    #[test]
    fn test_mark_writes_iso_timestamp() {
        let dir = tempdir().unwrap();
        let m = marker(dir.path());
        m.mark().unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(m.path()).unwrap()).unwrap();
        let stamp = raw["complete"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(stamp).is_ok());
        assert!(m.is_complete());
    }

    #[test]
    fn test_second_mark_keeps_first_timestamp() {
        let dir = tempdir().unwrap();
        let m = marker(dir.path());
        m.mark().unwrap();
        let first = m.completed_at().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        m.mark().unwrap();
        assert_eq!(m.completed_at().unwrap(), first);
    }

    #[test]
    fn test_partial_marker_is_not_complete() {
        let dir = tempdir().unwrap();
        let m = marker(dir.path());
        fs::write(m.path(), r#"{"complete": "2024-"#).unwrap();
        assert!(m.completed_at().is_none());

        fs::write(m.path(), r#"{"complete": "yesterday"}"#).unwrap();
        assert!(m.completed_at().is_none());
    }

    #[tokio::test]
    async fn test_wait_returns_once_marked() {
        let dir = tempdir().unwrap();
        let m = marker(dir.path());
        m.mark().unwrap();
        assert!(m.wait(Some(Duration::from_millis(100))).await.is_some());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let dir = tempdir().unwrap();
        let m = marker(dir.path());
        let start = std::time::Instant::now();
        assert!(m.wait(Some(Duration::from_millis(100))).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_sees_marker_written_later() {
        let dir = tempdir().unwrap();
        let m = marker(dir.path());
        let writer = m.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            writer.mark().unwrap();
        });
        assert!(m.wait(Some(Duration::from_secs(5))).await.is_some());
    }
}
