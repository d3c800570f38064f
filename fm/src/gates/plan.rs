//! Plan confirmation gate
//!
//! The worker publishes the PM's plan as `plan-<runId>.json` and polls for
//! `plan-confirm-<runId>.json` from the front end. A confirmation timeout is
//! treated as auto-continue.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{GateResult, ProjectDir, atomic_write_json, read_json};

/// `plan-<runId>.json`, worker to front end
#[derive(Debug, Serialize, Deserialize)]
struct PlanFile {
    status: String,
    plan: String,
    #[serde(rename = "createdAt")]
    created_at: i64,
}

/// `plan-confirm-<runId>.json`, front end to worker
#[derive(Debug, Serialize, Deserialize)]
struct PlanConfirmFile {
    action: String,
    #[serde(default)]
    notes: Option<String>,
}

/// The user's decision on a published plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    Confirmed,
    Rejected { notes: Option<String> },
    Modified { notes: Option<String> },
    /// No confirmation arrived before the timeout; treated as confirm
    TimedOut,
}

/// File-based rendezvous for plan approval
pub struct PlanGate {
    dir: ProjectDir,
    run_id: String,
}

impl PlanGate {
    pub fn new(dir: ProjectDir, run_id: impl Into<String>) -> Self {
        Self {
            dir,
            run_id: run_id.into(),
        }
    }

    /// Publish the plan for the front end to display
    pub fn publish(&self, plan: &str) -> GateResult<()> {
        self.dir.ensure()?;
        let file = PlanFile {
            status: "awaiting_confirmation".to_string(),
            plan: plan.to_string(),
            created_at: Utc::now().timestamp_millis(),
        };
        atomic_write_json(&self.dir.plan_path(&self.run_id), &file)?;
        info!(run_id = %self.run_id, "Plan published, awaiting confirmation");
        Ok(())
    }

    /// Poll for the user's decision until `timeout` elapses
    pub async fn await_decision(&self, timeout: Duration, poll: Duration) -> PlanDecision {
        let deadline = tokio::time::Instant::now() + timeout;
        let confirm_path = self.dir.plan_confirm_path(&self.run_id);

        loop {
            match read_json::<PlanConfirmFile>(&confirm_path) {
                Ok(Some(file)) => {
                    debug!(action = %file.action, "Plan confirmation received");
                    let decision = match file.action.as_str() {
                        "reject" => PlanDecision::Rejected { notes: file.notes },
                        "modify" => PlanDecision::Modified { notes: file.notes },
                        _ => PlanDecision::Confirmed,
                    };
                    self.cleanup();
                    return decision;
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Plan confirm poll failed"),
            }

            if tokio::time::Instant::now() >= deadline {
                info!(run_id = %self.run_id, "Plan confirmation timed out, continuing");
                self.cleanup();
                return PlanDecision::TimedOut;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Remove both gate files once the decision is consumed
    fn cleanup(&self) {
        for path in [
            self.dir.plan_path(&self.run_id),
            self.dir.plan_confirm_path(&self.run_id),
        ] {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_plan_confirm() {
        let temp = tempdir().unwrap();
        let dir = ProjectDir::at(temp.path());
        let gate = PlanGate::new(dir.clone(), "run-1");

        gate.publish("1. do the thing").unwrap();
        assert!(dir.plan_path("run-1").exists());

        atomic_write_json(
            &dir.plan_confirm_path("run-1"),
            &PlanConfirmFile {
                action: "confirm".to_string(),
                notes: None,
            },
        )
        .unwrap();

        let decision = gate
            .await_decision(Duration::from_secs(2), Duration::from_millis(10))
            .await;
        assert_eq!(decision, PlanDecision::Confirmed);
        assert!(!dir.plan_path("run-1").exists());
        assert!(!dir.plan_confirm_path("run-1").exists());
    }

    #[tokio::test]
    async fn test_plan_reject_with_notes() {
        let temp = tempdir().unwrap();
        let dir = ProjectDir::at(temp.path());
        let gate = PlanGate::new(dir.clone(), "run-2");

        gate.publish("plan").unwrap();
        atomic_write_json(
            &dir.plan_confirm_path("run-2"),
            &PlanConfirmFile {
                action: "reject".to_string(),
                notes: Some("wrong stack".to_string()),
            },
        )
        .unwrap();

        let decision = gate
            .await_decision(Duration::from_secs(2), Duration::from_millis(10))
            .await;
        assert_eq!(
            decision,
            PlanDecision::Rejected {
                notes: Some("wrong stack".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_plan_timeout_is_auto_continue() {
        let temp = tempdir().unwrap();
        let gate = PlanGate::new(ProjectDir::at(temp.path()), "run-3");
        gate.publish("plan").unwrap();

        let decision = gate
            .await_decision(Duration::from_millis(50), Duration::from_millis(10))
            .await;
        assert_eq!(decision, PlanDecision::TimedOut);
    }
}
