//! Decision triggers
//!
//! A trigger is the reason a PM decision is being requested right now. Only
//! one trigger is active at a time; a stronger trigger may replace a weaker
//! pending one (completions beat user messages beat idle).

use crate::domain::MessageKind;

/// Why the PM is being consulted
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Loop just started, with the initial ready tasks
    Initial { ready: Vec<String> },

    /// A launched task finished successfully
    TaskCompleted { task_id: String, summary: String },

    /// A launched task failed (including timeout and staleness)
    TaskFailed {
        task_id: String,
        error: String,
        attempts: u32,
    },

    /// The user posted messages while the pipeline runs
    UserMessage { messages: Vec<String> },

    /// An agent explicitly asked the PM a question
    AgentQuestion {
        agent: String,
        task_id: String,
        question: String,
    },

    /// An inter-agent message addressed to the PM
    AgentMessageToPm {
        agent: String,
        task_id: String,
        kind: MessageKind,
        content: String,
    },

    /// Nothing running, nothing ready
    AllIdle,

    /// Running cost crossed the caution threshold
    BudgetWarning { spent: f64, remaining: f64 },

    /// Worker restarted with prior state
    PipelineResumed {
        interrupted: Vec<String>,
        failed: Vec<String>,
    },
}

impl Trigger {
    /// Arming priority; a pending trigger is only replaced by a strictly
    /// higher one
    pub fn priority(&self) -> u8 {
        match self {
            Self::TaskCompleted { .. }
            | Self::TaskFailed { .. }
            | Self::AgentQuestion { .. }
            | Self::AgentMessageToPm { .. } => 4,
            Self::PipelineResumed { .. } => 4,
            Self::BudgetWarning { .. } => 3,
            Self::UserMessage { .. } => 2,
            Self::Initial { .. } | Self::AllIdle => 1,
        }
    }

    /// Human-readable rendering for the PM prompt's Trigger section
    pub fn render(&self) -> String {
        match self {
            Self::Initial { ready } => {
                format!("Pipeline started. Ready tasks: {}", join_or_none(ready))
            }
            Self::TaskCompleted { task_id, summary } => {
                if summary.is_empty() {
                    format!("Task {} completed.", task_id)
                } else {
                    format!("Task {} completed. Output summary: {}", task_id, summary)
                }
            }
            Self::TaskFailed {
                task_id,
                error,
                attempts,
            } => format!("Task {} failed after {} attempt(s): {}", task_id, attempts, error),
            Self::UserMessage { messages } => {
                format!("The user sent {} message(s) while the pipeline was running.", messages.len())
            }
            Self::AgentQuestion {
                agent,
                task_id,
                question,
            } => format!("Agent {} (task {}) asks you: {}", agent, task_id, question),
            Self::AgentMessageToPm {
                agent,
                task_id,
                kind,
                content,
            } => format!("Agent {} (task {}) sent you a {}: {}", agent, task_id, kind, content),
            Self::AllIdle => "No tasks are running and none are ready. Decide whether the pipeline is \
                              complete, stuck, or needs new tasks."
                .to_string(),
            Self::BudgetWarning { spent, remaining } => format!(
                "Budget warning: ${:.2} spent, ${:.2} remaining. Prefer wrapping up.",
                spent, remaining
            ),
            Self::PipelineResumed { interrupted, failed } => format!(
                "Pipeline resumed after a worker restart. Interrupted tasks: {}. Previously failed tasks: {}.",
                join_or_none(interrupted),
                join_or_none(failed)
            ),
        }
    }
}

fn join_or_none(ids: &[String]) -> String {
    if ids.is_empty() {
        "(none)".to_string()
    } else {
        ids.join(", ")
    }
}
