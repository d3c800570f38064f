//! PM question gate
//!
//! When the PM asks the user something mid-run, the worker writes
//! `question-<runId>.json` and polls for `question-<runId>-answer.json`.
//! A timeout reads as "no answer": blocked tasks are released without one.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{GateResult, ProjectDir, atomic_write_json, read_json};

/// `question-<runId>.json`, worker to front end
#[derive(Debug, Serialize, Deserialize)]
struct QuestionFile {
    question: String,
    #[serde(default)]
    context: Option<String>,
    #[serde(rename = "createdAt")]
    created_at: i64,
}

/// `question-<runId>-answer.json`, front end to worker
#[derive(Debug, Serialize, Deserialize)]
struct AnswerFile {
    answer: String,
    #[serde(rename = "answeredAt", default)]
    answered_at: Option<i64>,
}

/// File-based rendezvous for PM-to-user questions
pub struct QuestionGate {
    dir: ProjectDir,
    run_id: String,
}

impl QuestionGate {
    pub fn new(dir: ProjectDir, run_id: impl Into<String>) -> Self {
        Self {
            dir,
            run_id: run_id.into(),
        }
    }

    /// Publish a question for the front end
    pub fn ask(&self, question: &str, context: Option<&str>) -> GateResult<()> {
        self.dir.ensure()?;
        let file = QuestionFile {
            question: question.to_string(),
            context: context.map(str::to_string),
            created_at: Utc::now().timestamp_millis(),
        };
        atomic_write_json(&self.dir.question_path(&self.run_id), &file)?;
        info!(run_id = %self.run_id, "Question published for user");
        Ok(())
    }

    /// Poll for the user's answer; `None` on timeout
    pub async fn await_answer(&self, timeout: Duration, poll: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        let answer_path = self.dir.answer_path(&self.run_id);

        loop {
            match read_json::<AnswerFile>(&answer_path) {
                Ok(Some(file)) => {
                    debug!("User answer received");
                    self.cleanup();
                    return Some(file.answer);
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Answer poll failed"),
            }

            if tokio::time::Instant::now() >= deadline {
                info!(run_id = %self.run_id, "Question timed out with no answer");
                self.cleanup();
                return None;
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn cleanup(&self) {
        for path in [
            self.dir.question_path(&self.run_id),
            self.dir.answer_path(&self.run_id),
        ] {
            let _ = std::fs::remove_file(path);
        }
    }
}
