//! User message inbox
//!
//! Mid-run user messages arrive as `user-msg-<runId>-<ts>.json`, one message
//! per file. The worker drains them in timestamp order, deleting each file
//! as it is consumed; new file names make the polling naturally idempotent.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{GateResult, ProjectDir, atomic_write_json, read_json};

/// One queued user message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub message: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// The per-run user message queue
pub struct UserInbox {
    dir: ProjectDir,
    run_id: String,
}

impl UserInbox {
    pub fn new(dir: ProjectDir, run_id: impl Into<String>) -> Self {
        Self {
            dir,
            run_id: run_id.into(),
        }
    }

    fn prefix(&self) -> String {
        format!("user-msg-{}-", self.run_id)
    }

    /// Queue a message (the front end side; tests use this too)
    pub fn post(&self, message: &str) -> GateResult<()> {
        self.dir.ensure()?;
        let now = Utc::now().timestamp_millis();
        let msg = UserMessage {
            message: message.to_string(),
            created_at: now,
        };

        // Bump the timestamp until the name is free so same-millisecond
        // posts keep their order
        let mut ts = now;
        loop {
            let path = self.dir.root().join(format!("{}{}.json", self.prefix(), ts));
            if !path.exists() {
                atomic_write_json(&path, &msg)?;
                return Ok(());
            }
            ts += 1;
        }
    }

    /// Consume all queued messages in timestamp order
    pub fn drain(&self) -> Vec<UserMessage> {
        let prefix = self.prefix();
        let Ok(entries) = std::fs::read_dir(self.dir.root()) else {
            return Vec::new();
        };

        let mut names: Vec<(i64, std::path::PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let name = path.file_name()?.to_str()?;
                let ts: i64 = name.strip_prefix(&prefix)?.strip_suffix(".json")?.parse().ok()?;
                Some((ts, path))
            })
            .collect();
        names.sort_by_key(|(ts, _)| *ts);

        let mut messages = Vec::with_capacity(names.len());
        for (_, path) in names {
            match read_json::<UserMessage>(&path) {
                Ok(Some(msg)) => messages.push(msg),
                Ok(None) => debug!(path = %path.display(), "Skipping unreadable user message"),
                Err(e) => debug!(path = %path.display(), error = %e, "User message read failed"),
            }
            let _ = std::fs::remove_file(&path);
        }
        messages
    }
}
