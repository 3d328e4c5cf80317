//! Append-only status log.
//!
//! One line per entry: `STATE|message|timestamp`. Each entry goes out as a
//! single `O_APPEND` write, so concurrent writers interleave whole lines and
//! nobody needs a lock. The log does not police transitions; any state may
//! follow any other.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Longest message kept in one entry, in bytes.
const MAX_MESSAGE_LEN: usize = 2048;

/// The states a run moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusState {
    Created,
    Building,
    BuildDone,
    BuildFailed,
    BuildError,
    Aborted,
    PreppingRun,
    Running,
    RunTimeout,
    RunDone,
    RunError,
    Results,
    Complete,
    /// Informational note; not a lifecycle step.
    Info,
}

impl StatusState {
    pub fn all() -> &'static [StatusState] {
        &[
            StatusState::Created,
            StatusState::Building,
            StatusState::BuildDone,
            StatusState::BuildFailed,
            StatusState::BuildError,
            StatusState::Aborted,
            StatusState::PreppingRun,
            StatusState::Running,
            StatusState::RunTimeout,
            StatusState::RunDone,
            StatusState::RunError,
            StatusState::Results,
            StatusState::Complete,
            StatusState::Info,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Created => "CREATED",
            StatusState::Building => "BUILDING",
            StatusState::BuildDone => "BUILD_DONE",
            StatusState::BuildFailed => "BUILD_FAILED",
            StatusState::BuildError => "BUILD_ERROR",
            StatusState::Aborted => "ABORTED",
            StatusState::PreppingRun => "PREPPING_RUN",
            StatusState::Running => "RUNNING",
            StatusState::RunTimeout => "RUN_TIMEOUT",
            StatusState::RunDone => "RUN_DONE",
            StatusState::RunError => "RUN_ERROR",
            StatusState::Results => "RESULTS",
            StatusState::Complete => "COMPLETE",
            StatusState::Info => "INFO",
        }
    }
}

impl std::fmt::Display for StatusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for StatusState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatusState::all()
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown status state '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub state: StatusState,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusEntry {
    fn to_line(&self) -> String {
        format!(
            "{}|{}|{}\n",
            self.state,
            self.message,
            self.timestamp.to_rfc3339()
        )
    }

    /// Parse one log line. The message may itself contain `|`.
    fn parse(line: &str) -> Option<Self> {
        let (state, rest) = line.split_once('|')?;
        let (message, timestamp) = rest.rsplit_once('|')?;
        Some(StatusEntry {
            state: state.parse().ok()?,
            message: message.to_string(),
            timestamp: DateTime::parse_from_rfc3339(timestamp)
                .ok()?
                .with_timezone(&Utc),
        })
    }
}

/// Squash a message onto one line and cap its length.
fn clean_message(message: &str) -> String {
    let mut clean: String = message
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if clean.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN;
        while !clean.is_char_boundary(cut) {
            cut -= 1;
        }
        clean.truncate(cut);
    }
    clean
}

#[derive(Debug, Clone)]
pub struct StatusLog {
    path: PathBuf,
}

impl StatusLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry stamped with the current time.
    pub fn set(&self, state: StatusState, message: &str) -> anyhow::Result<StatusEntry> {
        let entry = StatusEntry {
            state,
            message: clean_message(message),
            timestamp: Utc::now(),
        };

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open status file")?;
        file.write_all(entry.to_line().as_bytes())
            .and_then(|_| file.flush())
            .context("Failed to write status entry")?;

        debug!(status = %state, message = %entry.message, "status");
        Ok(entry)
    }

    /// Append an entry, logging instead of failing. For recording a failure
    /// that is already being reported some other way.
    pub fn note(&self, state: StatusState, message: &str) {
        if let Err(e) = self.set(state, message) {
            warn!(path = %self.path.display(), err = %e, status = %state, "could not record status");
        }
    }

    /// Every complete entry, oldest first. Torn or unknown lines are skipped.
    pub fn history(&self) -> anyhow::Result<Vec<StatusEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).context("Failed to read status file")?;
        Ok(content
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let parsed = StatusEntry::parse(line);
                if parsed.is_none() {
                    warn!(path = %self.path.display(), line, "skipping unparsable status line");
                }
                parsed
            })
            .collect())
    }

    pub fn current(&self) -> anyhow::Result<Option<StatusEntry>> {
        Ok(self.history()?.pop())
    }

    /// The first entry in the given state.
    pub fn first(&self, state: StatusState) -> anyhow::Result<Option<StatusEntry>> {
        Ok(self.history()?.into_iter().find(|e| e.state == state))
    }

    /// The last entry in any of the given states.
    pub fn last_of(&self, states: &[StatusState]) -> anyhow::Result<Option<StatusEntry>> {
        Ok(self
            .history()?
            .into_iter()
            .rfind(|e| states.contains(&e.state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_log() -> (StatusLog, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let log = StatusLog::new(dir.path().join("status"));
        (log, dir)
    }

    #[test]
    fn test_empty_log() {
        let (log, _dir) = make_log();
        assert!(log.history().unwrap().is_empty());
        assert!(log.current().unwrap().is_none());
    }

    #[test]
    fn test_set_and_history_roundtrip() {
        let (log, _dir) = make_log();
        log.set(StatusState::Created, "created").unwrap();
        log.set(StatusState::Running, "going").unwrap();

        let history = log.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state, StatusState::Created);
        assert_eq!(history[1].message, "going");
        assert_eq!(log.current().unwrap().unwrap().state, StatusState::Running);
    }

    #[test]
    fn test_message_with_separator_and_newlines() {
        let (log, _dir) = make_log();
        log.set(StatusState::Info, "a|b\nc").unwrap();
        let entry = log.current().unwrap().unwrap();
        assert_eq!(entry.message, "a|b c");
    }

    #[test]
    fn test_long_message_is_capped() {
        let (log, _dir) = make_log();
        let long = "é".repeat(MAX_MESSAGE_LEN);
        log.set(StatusState::Info, &long).unwrap();
        let entry = log.current().unwrap().unwrap();
        assert!(entry.message.len() <= MAX_MESSAGE_LEN);
    }

    #[test]
    fn test_timestamps_non_decreasing_and_log_only_grows() {
        let (log, _dir) = make_log();
        let mut seen = Vec::new();
        for state in StatusState::all() {
            log.set(*state, state.as_str()).unwrap();
            let history = log.history().unwrap();
            assert_eq!(&history[..seen.len()], &seen[..]);
            seen = history;
        }
        assert_eq!(seen.len(), StatusState::all().len());
        assert!(seen.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let (log, _dir) = make_log();
        log.set(StatusState::Created, "ok").unwrap();
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap();
        file.write_all(b"RUNNI").unwrap();

        let history = log.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, StatusState::Created);
    }

    #[test]
    fn test_concurrent_writers_produce_whole_entries() {
        let (log, _dir) = make_log();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        log.set(StatusState::Info, &format!("writer {} entry {}", i, j))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let history = log.history().unwrap();
        assert_eq!(history.len(), 200);
        assert!(history.iter().all(|e| e.message.starts_with("writer ")));
    }

    #[test]
    fn test_first_and_last_of() {
        let (log, _dir) = make_log();
        log.set(StatusState::Running, "one").unwrap();
        log.set(StatusState::Running, "two").unwrap();
        log.set(StatusState::RunDone, "done").unwrap();

        assert_eq!(
            log.first(StatusState::Running).unwrap().unwrap().message,
            "one"
        );
        let last = log
            .last_of(&[StatusState::RunDone, StatusState::RunTimeout])
            .unwrap()
            .unwrap();
        assert_eq!(last.message, "done");
        assert!(log.first(StatusState::Complete).unwrap().is_none());
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!(
            "RUN_TIMEOUT".parse::<StatusState>().unwrap(),
            StatusState::RunTimeout
        );
        assert!("running".parse::<StatusState>().is_err());
    }

    #[test]
    fn test_recovery_after_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status");
        {
            let log = StatusLog::new(path.clone());
            log.set(StatusState::Created, "first process").unwrap();
        }
        {
            let log = StatusLog::new(path.clone());
            log.set(StatusState::Building, "second process").unwrap();
            assert_eq!(log.history().unwrap().len(), 2);
        }
    }
}
