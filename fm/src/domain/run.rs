//! Pipeline run record
//!
//! The persisted state of one orchestration run. Created by the front end
//! before the worker starts; mutated only by the worker through checkpoint
//! writes.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::graph::TaskGraph;

/// Lifecycle status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    /// Plan published, waiting for user confirmation
    AwaitingPlan,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::AwaitingPlan => write!(f, "awaiting_plan"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Summary of one completed step, kept on the run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub agent: String,
    #[serde(default)]
    pub role: Option<String>,
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub output: Option<String>,
}

/// The persisted run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Opaque external run identifier
    pub run_id: String,

    /// Project this run belongs to
    pub project_id: String,

    /// The user's original request
    pub request: String,

    pub status: RunStatus,

    /// The serialized task graph
    pub graph: TaskGraph,

    /// Number of PM decisions taken so far
    pub decision_count: u32,

    /// Accumulated cost, USD
    pub running_cost: f64,

    /// Last worker heartbeat, Unix milliseconds
    pub heartbeat_at: i64,

    /// Completed step summaries, in completion order
    pub steps: Vec<StepSummary>,

    /// Explanatory error for failed/aborted runs
    #[serde(default)]
    pub error: Option<String>,
}

impl PipelineRun {
    /// Create a fresh run record
    pub fn new(run_id: impl Into<String>, project_id: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            project_id: project_id.into(),
            request: request.into(),
            status: RunStatus::Running,
            graph: TaskGraph::default(),
            decision_count: 0,
            running_cost: 0.0,
            heartbeat_at: Utc::now().timestamp_millis(),
            steps: Vec::new(),
            error: None,
        }
    }

    /// Touch the heartbeat timestamp
    pub fn beat(&mut self) {
        self.heartbeat_at = Utc::now().timestamp_millis();
    }
}
