//! PM decision schema
//!
//! A decision is a reasoning string plus an ordered list of typed actions.
//! The JSON shapes here are the contract quoted verbatim in the PM's
//! instructions block.

use serde::{Deserialize, Serialize};

use crate::domain::{TaskChanges, TaskSpec};

/// One typed action in a PM decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PmAction {
    /// Launch the listed tasks (bounded by the parallelism budget)
    Execute {
        #[serde(alias = "taskIds")]
        task_ids: Vec<String>,
    },

    /// Insert new task nodes
    AddTasks { tasks: Vec<TaskSpec> },

    /// Cancel the listed tasks
    RemoveTasks {
        #[serde(alias = "taskIds")]
        task_ids: Vec<String>,
        #[serde(default)]
        reason: String,
    },

    /// Change a task's assignment without changing status
    Reassign {
        #[serde(alias = "taskId")]
        task_id: String,
        agent: String,
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        reason: String,
    },

    /// Reset a failed task to ready
    Retry {
        #[serde(alias = "taskId")]
        task_id: String,
        #[serde(default)]
        changes: Option<TaskChanges>,
    },

    /// Ask the user a question through the question gate
    AskUser {
        question: String,
        #[serde(default)]
        context: Option<String>,
        #[serde(default, alias = "blockingTaskIds")]
        blocking_task_ids: Vec<String>,
    },

    /// Answer a blocked or awaiting agent
    AnswerAgent {
        #[serde(alias = "taskId")]
        task_id: String,
        answer: String,
    },

    /// Terminate the pipeline successfully
    Complete { summary: String },

    /// Mark the listed tasks skipped
    Skip {
        #[serde(alias = "taskIds")]
        task_ids: Vec<String>,
        #[serde(default)]
        reason: String,
    },
}

/// The PM's reply to one decision point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PmDecision {
    #[serde(default)]
    pub reasoning: String,

    #[serde(default)]
    pub actions: Vec<PmAction>,
}

impl PmDecision {
    /// Render to the canonical envelope form
    pub fn render(&self) -> String {
        // Serialization of this type cannot fail
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("[PM_DECISION] {} [/PM_DECISION]", json)
    }

    /// Whether any action terminates the loop
    pub fn completes(&self) -> bool {
        self.actions.iter().any(|a| matches!(a, PmAction::Complete { .. }))
    }
}
