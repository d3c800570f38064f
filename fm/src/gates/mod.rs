//! Cross-process gates
//!
//! The worker runs detached from the request-serving front end; the two
//! sides rendezvous through files in a per-project directory under the
//! system temp dir. All files are single-writer by convention: the worker
//! owns the live log, pid file, plan and question files; the front end owns
//! the abort flag, confirmations, answers, and queued user messages. Both
//! sides read the other's writes by polling. Whole-file JSON writes go
//! through a temp-file-then-rename so readers never observe a partial file.

pub mod inbox;
pub mod plan;
pub mod question;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

pub use inbox::{UserInbox, UserMessage};
pub use plan::{PlanDecision, PlanGate};
pub use question::QuestionGate;

/// Errors from gate file operations
#[derive(Debug, Error)]
pub enum GateError {
    #[error("gate I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gate JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type GateResult<T> = Result<T, GateError>;

/// Write a JSON value atomically: temp file in the same directory, then rename
pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> GateResult<()> {
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(value)?;
    let mut file = fs::File::create(&tmp)?;
    file.write_all(json.as_bytes())?;
    file.flush()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a JSON file if it exists; unparseable content reads as absent
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> GateResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    match serde_json::from_str(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Ignoring unparseable gate file");
            Ok(None)
        }
    }
}

/// The per-project gate directory: `<tmp>/foreman/<projectId>/`
#[derive(Debug, Clone)]
pub struct ProjectDir {
    root: PathBuf,
}

impl ProjectDir {
    /// Gate directory for a project id under the system temp dir
    pub fn for_project(project_id: &str) -> Self {
        Self {
            root: std::env::temp_dir().join("foreman").join(project_id),
        }
    }

    /// Gate directory rooted at an explicit path (tests, custom layouts)
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory if needed
    pub fn ensure(&self) -> GateResult<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Handle to the append-only live log
    pub fn live_log(&self) -> LiveLog {
        LiveLog {
            path: self.root.join("live.log"),
        }
    }

    /// Handle to the abort flag
    pub fn abort(&self) -> AbortFlag {
        AbortFlag {
            path: self.root.join("abort.flag"),
        }
    }

    // Gate file paths

    pub fn pid_path(&self) -> PathBuf {
        self.root.join("worker.pid")
    }

    pub fn plan_path(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("plan-{}.json", run_id))
    }

    pub fn plan_confirm_path(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("plan-confirm-{}.json", run_id))
    }

    pub fn question_path(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("question-{}.json", run_id))
    }

    pub fn answer_path(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("question-{}-answer.json", run_id))
    }

    /// Record this process as the worker
    pub fn write_pid(&self) -> GateResult<()> {
        self.ensure()?;
        fs::write(self.pid_path(), format!("{}", std::process::id()))?;
        Ok(())
    }

    /// Read the recorded worker pid
    pub fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(self.pid_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn remove_pid(&self) -> GateResult<()> {
        let path = self.pid_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Cross-process abort signal: presence of `abort.flag`
#[derive(Debug, Clone)]
pub struct AbortFlag {
    path: PathBuf,
}

impl AbortFlag {
    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    pub fn set(&self) -> GateResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, "")?;
        Ok(())
    }

    pub fn clear(&self) -> GateResult<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Append-only, UTF-8, human-readable pipeline output. The front end polls
/// this by offset; the health checker watches its mtime for staleness.
#[derive(Debug, Clone)]
pub struct LiveLog {
    path: PathBuf,
}

impl LiveLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line (a newline is added)
    pub fn append(&self, line: &str) {
        if let Some(parent) = self.path.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            debug!(error = %e, "Failed to create log directory");
            return;
        }
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = result {
            debug!(path = %self.path.display(), error = %e, "Failed to append to live log");
        }
    }

    /// Last modification time, if the log exists
    pub fn mtime(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).ok().and_then(|m| m.modified().ok())
    }

    /// Read from a byte offset; returns the chunk and the new offset
    pub fn read_from(&self, offset: u64) -> GateResult<(String, u64)> {
        if !self.path.exists() {
            return Ok((String::new(), offset));
        }
        let content = fs::read(&self.path)?;
        let start = (offset as usize).min(content.len());
        let chunk = String::from_utf8_lossy(&content[start..]).to_string();
        Ok((chunk, content.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_abort_flag_set_clear() {
        let temp = tempdir().unwrap();
        let dir = ProjectDir::at(temp.path());
        let abort = dir.abort();

        assert!(!abort.is_set());
        abort.set().unwrap();
        assert!(abort.is_set());
        abort.clear().unwrap();
        assert!(!abort.is_set());
    }

    #[test]
    fn test_pid_round_trip() {
        let temp = tempdir().unwrap();
        let dir = ProjectDir::at(temp.path());

        assert_eq!(dir.read_pid(), None);
        dir.write_pid().unwrap();
        assert_eq!(dir.read_pid(), Some(std::process::id()));
        dir.remove_pid().unwrap();
        assert_eq!(dir.read_pid(), None);
    }

    #[test]
    fn test_live_log_append_and_read() {
        let temp = tempdir().unwrap();
        let dir = ProjectDir::at(temp.path());
        let log = dir.live_log();

        log.append("first line");
        log.append("second line");

        let (all, offset) = log.read_from(0).unwrap();
        assert_eq!(all, "first line\nsecond line\n");
        assert!(log.mtime().is_some());

        log.append("third line");
        let (tail, _) = log.read_from(offset).unwrap();
        assert_eq!(tail, "third line\n");
    }

    #[test]
    fn test_atomic_write_and_read_json() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("value.json");

        atomic_write_json(&path, &serde_json::json!({"answer": 42})).unwrap();
        let back: Option<serde_json::Value> = read_json(&path).unwrap();
        assert_eq!(back.unwrap()["answer"], 42);

        // No stray temp file is left behind
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_read_json_tolerates_garbage() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("garbage.json");
        fs::write(&path, "not json at all").unwrap();

        let back: Option<serde_json::Value> = read_json(&path).unwrap();
        assert!(back.is_none());
    }

    #[test]
    fn test_gate_paths() {
        let dir = ProjectDir::for_project("proj-7");
        assert!(dir.root().ends_with("foreman/proj-7"));
        assert!(dir.plan_path("r1").ends_with("plan-r1.json"));
        assert!(dir.plan_confirm_path("r1").ends_with("plan-confirm-r1.json"));
        assert!(dir.question_path("r1").ends_with("question-r1.json"));
        assert!(dir.answer_path("r1").ends_with("question-r1-answer.json"));
    }
}
