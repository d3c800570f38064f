//! Task node types
//!
//! A TaskNode is the fundamental unit of the task graph. Nodes are treated
//! as immutable: graph transitions produce new nodes rather than mutating in
//! place.

use serde::{Deserialize, Serialize};

/// Status of a task in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// At least one dependency is not yet terminal
    #[default]
    Pending,
    /// All dependencies terminal, eligible for launch
    Ready,
    /// An execution is in flight
    Running,
    /// Waiting on an answer from the PM or the user
    Blocked,
    /// Completed successfully
    Done,
    /// Completed with an error
    Failed,
    /// Skipped by PM decision
    Skipped,
    /// Removed by PM decision
    Cancelled,
}

impl TaskStatus {
    /// Terminal for dependency purposes: downstream tasks may proceed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped | Self::Cancelled)
    }

    /// Settled for completion purposes: no further work will happen
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Blocked => write!(f, "blocked"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A node in the task graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    /// Stable identifier, conventionally `t<N>`
    pub id: String,

    /// Human-readable title
    pub title: String,

    /// Free-form description of the work
    pub description: String,

    /// Acceptance criteria, in order
    #[serde(default)]
    pub acceptance: Vec<String>,

    /// Ids of tasks that must reach a terminal status first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// PM-supplied provider hint
    #[serde(default)]
    pub provider_hint: Option<String>,

    /// PM-supplied model hint
    #[serde(default)]
    pub model_hint: Option<String>,

    /// PM-supplied skill tags
    #[serde(default)]
    pub skill_hints: Vec<String>,

    /// Assigned agent type
    pub agent: String,

    /// Assigned role within the agent, if any
    #[serde(default)]
    pub role: Option<String>,

    /// Current status
    pub status: TaskStatus,

    /// Number of execution attempts so far (monotonically non-decreasing)
    #[serde(default)]
    pub attempts: u32,

    /// Output of the last successful execution
    #[serde(default)]
    pub output: Option<String>,

    /// Error of the last failed execution
    #[serde(default)]
    pub error: Option<String>,

    /// Accumulated cost across all attempts, USD
    #[serde(default)]
    pub cost_usd: f64,

    /// Question this task is blocked on, if any
    #[serde(default)]
    pub blocking_question: Option<String>,

    /// Decision round that added this task (0 = initial plan)
    #[serde(default)]
    pub added_in_round: u32,
}

impl TaskNode {
    /// Build a node from a spec, with readiness decided by the caller
    pub fn from_spec(id: String, spec: TaskSpec, status: TaskStatus, round: u32) -> Self {
        Self {
            id,
            title: spec.title,
            description: spec.description,
            acceptance: spec.acceptance,
            depends_on: spec.depends_on,
            provider_hint: spec.provider,
            model_hint: spec.model,
            skill_hints: spec.skills,
            agent: spec.agent,
            role: spec.role,
            status,
            attempts: 0,
            output: None,
            error: None,
            cost_usd: 0.0,
            blocking_question: None,
            added_in_round: round,
        }
    }

    /// Agent label including the role, e.g. `coder:reviewer`
    pub fn agent_label(&self) -> String {
        match &self.role {
            Some(role) => format!("{}:{}", self.agent, role),
            None => self.agent.clone(),
        }
    }
}

/// A new-task specification as the PM supplies it in `add_tasks`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    /// Optional explicit id; auto-assigned when omitted
    #[serde(default)]
    pub id: Option<String>,

    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub acceptance: Vec<String>,

    #[serde(default, rename = "dependsOn", alias = "depends_on")]
    pub depends_on: Vec<String>,

    pub agent: String,

    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub skills: Vec<String>,
}

/// Optional overrides supplied with a `retry` action
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskChanges {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub agent: Option<String>,

    #[serde(default)]
    pub role: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_settled() {
        assert!(TaskStatus::Failed.is_settled());
        assert!(TaskStatus::Done.is_settled());
        assert!(!TaskStatus::Blocked.is_settled());
        assert!(!TaskStatus::Ready.is_settled());
    }

    #[test]
    fn test_status_display_matches_serde() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::Running,
            TaskStatus::Blocked,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Skipped,
            TaskStatus::Cancelled,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
    }

    #[test]
    fn test_from_spec() {
        let spec = TaskSpec {
            id: None,
            title: "Write parser".to_string(),
            description: "Implement the config parser".to_string(),
            acceptance: vec!["parses valid input".to_string()],
            depends_on: vec!["t1".to_string()],
            agent: "coder".to_string(),
            role: Some("backend".to_string()),
            provider: Some("claude-cli".to_string()),
            model: None,
            skills: vec![],
        };

        let node = TaskNode::from_spec("t2".to_string(), spec, TaskStatus::Pending, 3);
        assert_eq!(node.id, "t2");
        assert_eq!(node.attempts, 0);
        assert_eq!(node.added_in_round, 3);
        assert_eq!(node.agent_label(), "coder:backend");
        assert_eq!(node.provider_hint.as_deref(), Some("claude-cli"));
    }

    #[test]
    fn test_spec_depends_on_aliases() {
        let camel: TaskSpec = serde_json::from_str(
            r#"{"title":"a","agent":"coder","dependsOn":["t1"]}"#,
        )
        .unwrap();
        let snake: TaskSpec = serde_json::from_str(
            r#"{"title":"a","agent":"coder","depends_on":["t1"]}"#,
        )
        .unwrap();
        assert_eq!(camel.depends_on, vec!["t1"]);
        assert_eq!(snake.depends_on, vec!["t1"]);
    }
}
