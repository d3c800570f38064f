//! Health-checked waiting
//!
//! The next-completion primitive races the outcome channel against a
//! recurring health timer. Each tick checks the abort flag (force-resolving
//! one outstanding task as failed when set), compares the live log's mtime
//! against the stale threshold, and drains the user-message gate for the
//! next PM cycle. Normal task resolution short-circuits all of it.

use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::gates::{LiveLog, ProjectDir, UserInbox};
use crate::runner::TaskOutcome;

/// What ended the wait
#[derive(Debug)]
pub enum WaitEvent {
    /// A task resolved normally
    Outcome(TaskOutcome),
    /// The health check force-resolved a task as failed
    Forced { task_id: String, error: String },
    /// All senders dropped; nothing will ever resolve
    Closed,
}

/// Log-activity tracking across waits
#[derive(Debug)]
pub struct HealthState {
    last_mtime: Option<SystemTime>,
    last_activity: Instant,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            last_mtime: None,
            last_activity: Instant::now(),
        }
    }

    /// Note log activity (called when executions launch, too)
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn observe(&mut self, log: &LiveLog) -> Duration {
        let mtime = log.mtime();
        if mtime != self.last_mtime {
            self.last_mtime = mtime;
            self.last_activity = Instant::now();
        }
        self.last_activity.elapsed()
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for the next completion, with periodic health checks
#[allow(clippy::too_many_arguments)]
pub async fn next_completion(
    rx: &mut mpsc::Receiver<TaskOutcome>,
    gates: &ProjectDir,
    inbox: &UserInbox,
    user_messages: &mut Vec<String>,
    running: &[String],
    health: &mut HealthState,
    interval: Duration,
    stale_after: Duration,
) -> WaitEvent {
    let log = gates.live_log();
    let abort = gates.abort();
    let mut ticker = tokio::time::interval(interval);
    // The first tick is immediate; skip it so a fresh wait is not a check
    ticker.tick().await;

    loop {
        tokio::select! {
            outcome = rx.recv() => {
                return match outcome {
                    Some(outcome) => WaitEvent::Outcome(outcome),
                    None => WaitEvent::Closed,
                };
            }
            _ = ticker.tick() => {
                if abort.is_set()
                    && let Some(task_id) = running.first()
                {
                    warn!(task = %task_id, "Abort flag set during wait, force-resolving");
                    return WaitEvent::Forced {
                        task_id: task_id.clone(),
                        error: "aborted by user".to_string(),
                    };
                }

                let idle = health.observe(&log);
                if idle >= stale_after
                    && let Some(task_id) = running.first()
                {
                    warn!(task = %task_id, idle_secs = idle.as_secs(), "No log activity, marking stale");
                    return WaitEvent::Forced {
                        task_id: task_id.clone(),
                        error: format!("Task appears stale — no log activity for {}s", idle.as_secs()),
                    };
                }

                let drained = inbox.drain();
                if !drained.is_empty() {
                    debug!(count = drained.len(), "User messages gathered during wait");
                    user_messages.extend(drained.into_iter().map(|m| m.message));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn outcome(task_id: &str) -> TaskOutcome {
        TaskOutcome {
            task_id: task_id.to_string(),
            success: true,
            output: "ok".to_string(),
            error: None,
            error_kind: None,
            attempts: 1,
            cost_usd: 0.0,
            provider_id: "mock".to_string(),
            model: "m".to_string(),
            fallback_used: false,
        }
    }

    #[tokio::test]
    async fn test_normal_outcome_short_circuits() {
        let temp = tempdir().unwrap();
        let gates = ProjectDir::at(temp.path());
        let inbox = UserInbox::new(gates.clone(), "run-1");
        let (tx, mut rx) = mpsc::channel(4);
        let mut user_messages = Vec::new();
        let mut health = HealthState::new();

        tx.send(outcome("t1")).await.unwrap();

        let event = next_completion(
            &mut rx,
            &gates,
            &inbox,
            &mut user_messages,
            &["t1".to_string()],
            &mut health,
            Duration::from_secs(30),
            Duration::from_secs(300),
        )
        .await;

        assert!(matches!(event, WaitEvent::Outcome(o) if o.task_id == "t1"));
    }

    #[tokio::test]
    async fn test_abort_forces_resolution() {
        let temp = tempdir().unwrap();
        let gates = ProjectDir::at(temp.path());
        gates.ensure().unwrap();
        let inbox = UserInbox::new(gates.clone(), "run-1");
        let (_tx, mut rx) = mpsc::channel::<TaskOutcome>(4);
        let mut user_messages = Vec::new();
        let mut health = HealthState::new();

        gates.abort().set().unwrap();

        let event = next_completion(
            &mut rx,
            &gates,
            &inbox,
            &mut user_messages,
            &["t1".to_string()],
            &mut health,
            Duration::from_millis(10),
            Duration::from_secs(300),
        )
        .await;

        match event {
            WaitEvent::Forced { task_id, error } => {
                assert_eq!(task_id, "t1");
                assert!(error.contains("aborted"));
            }
            other => panic!("expected forced resolution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_log_forces_resolution() {
        let temp = tempdir().unwrap();
        let gates = ProjectDir::at(temp.path());
        let inbox = UserInbox::new(gates.clone(), "run-1");
        let (_tx, mut rx) = mpsc::channel::<TaskOutcome>(4);
        let mut user_messages = Vec::new();
        let mut health = HealthState::new();

        let event = next_completion(
            &mut rx,
            &gates,
            &inbox,
            &mut user_messages,
            &["t2".to_string()],
            &mut health,
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .await;

        match event {
            WaitEvent::Forced { task_id, error } => {
                assert_eq!(task_id, "t2");
                assert!(error.contains("stale"));
            }
            other => panic!("expected stale resolution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_log_activity_defers_staleness() {
        let temp = tempdir().unwrap();
        let gates = ProjectDir::at(temp.path());
        let inbox = UserInbox::new(gates.clone(), "run-1");
        let (tx, mut rx) = mpsc::channel(4);
        let mut user_messages = Vec::new();
        let mut health = HealthState::new();

        // A writer keeps the log warm, then the task resolves
        let log = gates.live_log();
        let writer = tokio::spawn(async move {
            for i in 0..5 {
                log.append(&format!("progress {}", i));
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            tx.send(outcome("t1")).await.unwrap();
        });

        let event = next_completion(
            &mut rx,
            &gates,
            &inbox,
            &mut user_messages,
            &["t1".to_string()],
            &mut health,
            Duration::from_millis(10),
            Duration::from_millis(400),
        )
        .await;

        writer.await.unwrap();
        assert!(matches!(event, WaitEvent::Outcome(_)));
    }

    #[tokio::test]
    async fn test_user_messages_gathered() {
        let temp = tempdir().unwrap();
        let gates = ProjectDir::at(temp.path());
        let inbox = UserInbox::new(gates.clone(), "run-1");
        let (tx, mut rx) = mpsc::channel(4);
        let mut user_messages = Vec::new();
        let mut health = HealthState::new();

        inbox.post("please add logging").unwrap();

        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(outcome("t1")).await.unwrap();
        });

        let event = next_completion(
            &mut rx,
            &gates,
            &inbox,
            &mut user_messages,
            &["t1".to_string()],
            &mut health,
            Duration::from_millis(10),
            Duration::from_secs(300),
        )
        .await;

        sender.await.unwrap();
        assert!(matches!(event, WaitEvent::Outcome(_)));
        assert_eq!(user_messages, vec!["please add logging"]);
    }
}
