//! JSONL-backed repository
//!
//! A file-backed implementation of the repository contract used by the
//! worker (and tests) when no relational front end is attached. Run records
//! are whole-file JSON snapshots rewritten per checkpoint; everything else
//! is an append-only `.jsonl` collection.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::domain::{AgentMessage, PipelineRun};

use super::{
    AgentRunRecord, EventLogRecord, PmDecisionRecord, ProjectSettings, RepoError, RepoResult, Repository, RunPatch,
    TaskNoteRecord, TaskPatch, TaskRecord,
};

/// Repository rooted at a directory of JSON/JSONL files
pub struct JsonlRepository {
    root: PathBuf,
    runs: Mutex<HashMap<String, PipelineRun>>,
}

impl JsonlRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Default location under the user data dir
    pub fn default_location() -> Self {
        let root = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("foreman")
            .join("store");
        Self::new(root)
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("run-{}.json", run_id))
    }

    async fn ensure_dir(&self) -> RepoResult<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn append_jsonl<T: Serialize>(&self, collection: &str, record: &T) -> RepoResult<()> {
        self.ensure_dir().await?;
        let path = self.root.join(format!("{}.jsonl", collection));
        let line = serde_json::to_string(record)? + "\n";

        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_jsonl<T: DeserializeOwned>(&self, collection: &str) -> RepoResult<Vec<T>> {
        let path = self.root.join(format!("{}.jsonl", collection));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).await?;
        Ok(content.lines().filter_map(|line| serde_json::from_str(line).ok()).collect())
    }

    async fn write_run_snapshot(&self, run: &PipelineRun) -> RepoResult<()> {
        self.ensure_dir().await?;
        let path = self.run_path(&run.run_id);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(run)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_run_from_disk(&self, run_id: &str) -> RepoResult<Option<PipelineRun>> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

#[async_trait]
impl Repository for JsonlRepository {
    async fn create_pipeline_run(&self, run: &PipelineRun) -> RepoResult<()> {
        self.write_run_snapshot(run).await?;
        self.runs.lock().await.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn update_pipeline_run(&self, run_id: &str, patch: RunPatch) -> RepoResult<()> {
        let mut runs = self.runs.lock().await;
        if !runs.contains_key(run_id) {
            let loaded = self
                .load_run_from_disk(run_id)
                .await?
                .ok_or_else(|| RepoError::NotFound(format!("pipeline run {}", run_id)))?;
            runs.insert(run_id.to_string(), loaded);
        }
        let Some(run) = runs.get_mut(run_id) else {
            return Err(RepoError::NotFound(format!("pipeline run {}", run_id)));
        };

        if let Some(status) = patch.status {
            run.status = status;
        }
        if let Some(graph) = patch.graph {
            run.graph = graph;
        }
        if let Some(count) = patch.decision_count {
            run.decision_count = count;
        }
        if let Some(cost) = patch.running_cost {
            run.running_cost = cost;
        }
        if let Some(at) = patch.heartbeat_at {
            run.heartbeat_at = at;
        }
        if let Some(steps) = patch.steps {
            run.steps = steps;
        }
        if let Some(error) = patch.error {
            run.error = Some(error);
        }

        let snapshot = run.clone();
        drop(runs);
        self.write_run_snapshot(&snapshot).await
    }

    async fn get_pipeline_run(&self, run_id: &str) -> RepoResult<Option<PipelineRun>> {
        if let Some(run) = self.runs.lock().await.get(run_id) {
            return Ok(Some(run.clone()));
        }
        self.load_run_from_disk(run_id).await
    }

    async fn create_task(&self, record: TaskRecord) -> RepoResult<()> {
        self.append_jsonl("tasks", &record).await
    }

    async fn update_task_by_graph_id(&self, run_id: &str, graph_id: &str, patch: TaskPatch) -> RepoResult<()> {
        #[derive(Serialize)]
        struct TaskUpdateRow<'a> {
            run_id: &'a str,
            graph_id: &'a str,
            #[serde(flatten)]
            patch: &'a TaskPatch,
        }
        self.append_jsonl(
            "task_updates",
            &TaskUpdateRow {
                run_id,
                graph_id,
                patch: &patch,
            },
        )
        .await
    }

    async fn create_task_note(&self, record: TaskNoteRecord) -> RepoResult<()> {
        self.append_jsonl("task_notes", &record).await
    }

    async fn create_agent_run(&self, record: AgentRunRecord) -> RepoResult<()> {
        self.append_jsonl("agent_runs", &record).await
    }

    async fn create_agent_message(&self, run_id: &str, message: &AgentMessage) -> RepoResult<()> {
        #[derive(Serialize)]
        struct MessageRow<'a> {
            run_id: &'a str,
            #[serde(flatten)]
            message: &'a AgentMessage,
        }
        self.append_jsonl("agent_messages", &MessageRow { run_id, message }).await
    }

    async fn inbox_messages(&self, run_id: &str, agent: &str) -> RepoResult<Vec<AgentMessage>> {
        #[derive(serde::Deserialize)]
        struct MessageRow {
            run_id: String,
            #[serde(flatten)]
            message: AgentMessage,
        }
        let rows: Vec<MessageRow> = self.read_jsonl("agent_messages").await?;
        Ok(rows
            .into_iter()
            .filter(|row| row.run_id == run_id && row.message.to == agent)
            .map(|row| row.message)
            .collect())
    }

    async fn create_event_log(&self, record: EventLogRecord) -> RepoResult<()> {
        self.append_jsonl("event_log", &record).await
    }

    async fn create_pm_decision_log(&self, record: PmDecisionRecord) -> RepoResult<()> {
        self.append_jsonl("pm_decisions", &record).await
    }

    async fn find_project_by_id(&self, project_id: &str) -> RepoResult<Option<ProjectSettings>> {
        let path = self.root.join("projects.json");
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        let projects: Vec<ProjectSettings> = serde_json::from_str(&content)?;
        Ok(projects.into_iter().find(|p| p.id == project_id))
    }
}

/// Read agent-run rows back (tests, status display)
impl JsonlRepository {
    pub async fn agent_runs(&self) -> RepoResult<Vec<AgentRunRecord>> {
        self.read_jsonl("agent_runs").await
    }

    pub async fn event_log(&self) -> RepoResult<Vec<EventLogRecord>> {
        self.read_jsonl("event_log").await
    }

    pub async fn pm_decisions(&self) -> RepoResult<Vec<PmDecisionRecord>> {
        self.read_jsonl("pm_decisions").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageKind, RunStatus};
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(task: &str, attempt: u32) -> AgentRunRecord {
        AgentRunRecord {
            id: format!("ar-{}-{}", task, attempt),
            run_id: "run-1".to_string(),
            task_id: task.to_string(),
            agent: "coder".to_string(),
            role: None,
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4".to_string(),
            attempt,
            success: true,
            duration_ms: 5,
            input_tokens: 10,
            output_tokens: 20,
            cost_usd: 0.01,
            input_excerpt: "in".to_string(),
            output_excerpt: "out".to_string(),
            error: None,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn test_run_create_update_get() {
        let temp = tempdir().unwrap();
        let repo = JsonlRepository::new(temp.path());

        let run = PipelineRun::new("run-1", "proj-1", "do it");
        repo.create_pipeline_run(&run).await.unwrap();

        repo.update_pipeline_run(
            "run-1",
            RunPatch {
                status: Some(RunStatus::Completed),
                decision_count: Some(5),
                running_cost: Some(2.5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let back = repo.get_pipeline_run("run-1").await.unwrap().unwrap();
        assert_eq!(back.status, RunStatus::Completed);
        assert_eq!(back.decision_count, 5);
        assert!((back.running_cost - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_update_unknown_run_fails() {
        let temp = tempdir().unwrap();
        let repo = JsonlRepository::new(temp.path());
        let result = repo.update_pipeline_run("ghost", RunPatch::default()).await;
        assert!(matches!(result, Err(RepoError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_run_survives_process_restart() {
        let temp = tempdir().unwrap();
        {
            let repo = JsonlRepository::new(temp.path());
            repo.create_pipeline_run(&PipelineRun::new("run-2", "p", "req"))
                .await
                .unwrap();
        }

        // New repository instance, same directory
        let repo = JsonlRepository::new(temp.path());
        let back = repo.get_pipeline_run("run-2").await.unwrap().unwrap();
        assert_eq!(back.project_id, "p");

        // And updates through the fresh instance work
        repo.update_pipeline_run(
            "run-2",
            RunPatch {
                status: Some(RunStatus::Aborted),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_agent_runs_append() {
        let temp = tempdir().unwrap();
        let repo = JsonlRepository::new(temp.path());

        repo.create_agent_run(record("t1", 1)).await.unwrap();
        repo.create_agent_run(record("t1", 2)).await.unwrap();

        let rows = repo.agent_runs().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].attempt, 2);
    }

    #[tokio::test]
    async fn test_inbox_messages_filtered() {
        let temp = tempdir().unwrap();
        let repo = JsonlRepository::new(temp.path());

        let msg = |to: &str| AgentMessage {
            from: "coder".to_string(),
            to: to.to_string(),
            kind: MessageKind::Handoff,
            content: "done".to_string(),
            task_id: "t1".to_string(),
        };
        repo.create_agent_message("run-1", &msg("tester")).await.unwrap();
        repo.create_agent_message("run-1", &msg("pm")).await.unwrap();
        repo.create_agent_message("run-2", &msg("tester")).await.unwrap();

        let inbox = repo.inbox_messages("run-1", "tester").await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].to, "tester");
    }

    #[tokio::test]
    async fn test_find_project() {
        let temp = tempdir().unwrap();
        let repo = JsonlRepository::new(temp.path());
        assert!(repo.find_project_by_id("p1").await.unwrap().is_none());

        std::fs::write(
            temp.path().join("projects.json"),
            r#"[{"id": "p1", "name": "demo"}]"#,
        )
        .unwrap();
        let project = repo.find_project_by_id("p1").await.unwrap().unwrap();
        assert_eq!(project.name, "demo");
    }
}
