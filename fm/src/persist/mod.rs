//! Persistence facade
//!
//! The relational store belongs to the front end; the worker talks to it
//! through this narrow repository contract. Everything here is best-effort
//! after critical checkpoints: individual write failures are logged and
//! swallowed, except `PipelineRun` lifecycle updates, which propagate.

pub mod jsonl;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::domain::{AgentMessage, PipelineRun, RunStatus, StepSummary};
use crate::graph::TaskGraph;

pub use jsonl::JsonlRepository;

/// Errors from repository operations
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Checkpoint fields for a pipeline run; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub graph: Option<TaskGraph>,
    pub decision_count: Option<u32>,
    pub running_cost: Option<f64>,
    pub heartbeat_at: Option<i64>,
    pub steps: Option<Vec<StepSummary>>,
    pub error: Option<String>,
}

impl RunPatch {
    /// A heartbeat-only checkpoint
    pub fn heartbeat(at: i64) -> Self {
        Self {
            heartbeat_at: Some(at),
            ..Default::default()
        }
    }
}

/// Per-task row, created at first launch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub run_id: String,
    pub graph_id: String,
    pub title: String,
    pub agent: String,
    #[serde(default)]
    pub role: Option<String>,
    pub status: String,
    pub created_at: i64,
}

/// Per-task update keyed by graph id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub status: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub attempts: Option<u32>,
    pub cost_usd: Option<f64>,
}

/// A note attached to a task (PM answers, operator remarks)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNoteRecord {
    pub run_id: String,
    pub task_id: String,
    pub note: String,
    pub created_at: i64,
}

/// One execution attempt by the agent runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunRecord {
    pub id: String,
    pub run_id: String,
    pub task_id: String,
    pub agent: String,
    #[serde(default)]
    pub role: Option<String>,
    pub provider: String,
    pub model: String,
    pub attempt: u32,
    pub success: bool,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    /// Truncated to 10 000 chars
    pub input_excerpt: String,
    /// Truncated to 50 000 chars
    pub output_excerpt: String,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: i64,
}

/// An event-log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogRecord {
    pub run_id: String,
    pub event_type: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// One PM decision, logged for audit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmDecisionRecord {
    pub run_id: String,
    pub round: u32,
    pub trigger: String,
    pub reply_excerpt: String,
    pub parsed_ok: bool,
    pub action_count: usize,
    pub created_at: i64,
}

/// Project settings read from the persistence layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Working directory agents execute in
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Provider override per agent or `agent:role`
    #[serde(default)]
    pub provider_overrides: HashMap<String, String>,
    /// Model override per agent or `agent:role`
    #[serde(default)]
    pub model_overrides: HashMap<String, String>,
}

/// The repository contract consumed from the persistence layer
#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_pipeline_run(&self, run: &PipelineRun) -> RepoResult<()>;

    async fn update_pipeline_run(&self, run_id: &str, patch: RunPatch) -> RepoResult<()>;

    async fn get_pipeline_run(&self, run_id: &str) -> RepoResult<Option<PipelineRun>>;

    async fn create_task(&self, record: TaskRecord) -> RepoResult<()>;

    async fn update_task_by_graph_id(&self, run_id: &str, graph_id: &str, patch: TaskPatch) -> RepoResult<()>;

    async fn create_task_note(&self, record: TaskNoteRecord) -> RepoResult<()>;

    async fn create_agent_run(&self, record: AgentRunRecord) -> RepoResult<()>;

    async fn create_agent_message(&self, run_id: &str, message: &AgentMessage) -> RepoResult<()>;

    async fn inbox_messages(&self, run_id: &str, agent: &str) -> RepoResult<Vec<AgentMessage>>;

    async fn create_event_log(&self, record: EventLogRecord) -> RepoResult<()>;

    async fn create_pm_decision_log(&self, record: PmDecisionRecord) -> RepoResult<()>;

    async fn find_project_by_id(&self, project_id: &str) -> RepoResult<Option<ProjectSettings>>;
}

/// Run a repository write whose failure must not stop the pipeline
pub async fn best_effort<T>(what: &str, result: RepoResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(what, error = %e, "Best-effort persistence write failed");
            None
        }
    }
}
