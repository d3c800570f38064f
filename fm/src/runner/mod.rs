//! Agent runner
//!
//! Executes one agent-role assignment exactly once from the decision loop's
//! point of view, handling provider resolution, bounded retries, and
//! cross-provider fallback internally. Every attempt is persisted as an
//! `AgentRun` row; costs accumulate across attempts.

pub mod resolve;
pub mod skills;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eyre::{Result, eyre};
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{AgentCatalog, TaskNode};
use crate::gates::ProjectDir;
use crate::persist::{AgentRunRecord, EventLogRecord, ProjectSettings, Repository, best_effort};
use crate::providers::{ErrorKind, ExecutionContext, ExecutionResult, ProviderAdapter, ProviderRegistry};

pub use resolve::{Resolution, acceptable_for, fallback_provider, resolve};
pub use skills::Skill;

/// Max execution attempts per task launch
const MAX_ATTEMPTS: u32 = 3;

/// Truncation limits for persisted attempt rows
const INPUT_EXCERPT_CHARS: usize = 10_000;
const OUTPUT_EXCERPT_CHARS: usize = 50_000;

/// Runner knobs
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub default_provider: String,
    pub task_timeout: Duration,
    pub skills_dir: Option<PathBuf>,
    /// Delay between attempts on the same provider
    pub backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_provider: "claude-cli".to_string(),
            task_timeout: Duration::from_secs(1800),
            skills_dir: None,
            backoff: Duration::from_secs(2),
        }
    }
}

/// The final result of one task launch
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Attempts consumed by this launch
    pub attempts: u32,
    pub cost_usd: f64,
    pub provider_id: String,
    pub model: String,
    pub fallback_used: bool,
}

impl TaskOutcome {
    /// A failure produced without reaching any provider
    pub fn aborted_before_execution(task_id: &str, error: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            error_kind: Some(kind),
            attempts: 0,
            cost_usd: 0.0,
            provider_id: String::new(),
            model: String::new(),
            fallback_used: false,
        }
    }
}

/// Executes task assignments against the provider layer
pub struct AgentRunner {
    registry: &'static ProviderRegistry,
    repo: Arc<dyn Repository>,
    catalog: Arc<AgentCatalog>,
    gates: ProjectDir,
    run_id: String,
    project_id: String,
    config: RunnerConfig,
}

impl AgentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: &'static ProviderRegistry,
        repo: Arc<dyn Repository>,
        catalog: Arc<AgentCatalog>,
        gates: ProjectDir,
        run_id: impl Into<String>,
        project_id: impl Into<String>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            registry,
            repo,
            catalog,
            gates,
            run_id: run_id.into(),
            project_id: project_id.into(),
            config,
        }
    }

    /// Execute one task to its final outcome
    pub async fn run_task(&self, node: &TaskNode, project: Option<&ProjectSettings>, context: &str) -> TaskOutcome {
        let agent = self.catalog.get(&node.agent);
        let resolution = resolve(node, agent, project, &self.config.default_provider);

        // Resolved provider, with capability-aware substitution when it is
        // missing or unavailable
        let mut adapter = match self.pick_adapter(&resolution, agent).await {
            Ok(adapter) => adapter,
            Err(e) => {
                return TaskOutcome::aborted_before_execution(&node.id, e.to_string(), ErrorKind::Permanent);
            }
        };
        let mut model = resolution
            .model
            .clone()
            .unwrap_or_else(|| resolve::default_model(adapter.as_ref()));

        let cwd = self.working_dir(project, adapter.as_ref());
        if let Some(cwd) = &cwd
            && let Err(e) = ensure_cwd_safe(cwd, install_root().as_deref())
        {
            warn!(task = %node.id, error = %e, "Refusing execution in unsafe working directory");
            return TaskOutcome::aborted_before_execution(&node.id, e.to_string(), ErrorKind::Permanent);
        }

        let prompt = self.build_prompt(node, adapter.as_ref(), cwd.as_deref(), context);
        let system_prompt = agent.map(|a| a.system_prompt_for(node.role.as_deref()).to_string()).unwrap_or_default();

        let mut cost_usd = 0.0;
        let mut fallback_used = false;
        let mut last: Option<ExecutionResult> = None;
        let mut attempts = 0;

        for attempt in 1..=MAX_ATTEMPTS {
            attempts = attempt;
            let ctx = ExecutionContext {
                prompt: prompt.clone(),
                system_prompt: system_prompt.clone(),
                model: model.clone(),
                cwd: cwd.clone(),
                project_id: self.project_id.clone(),
                session_id: None,
                enable_tools: adapter.capabilities().tool_use,
                timeout: self.config.task_timeout,
                max_output_tokens: None,
                log: Some(self.gates.live_log()),
                abort: Some(self.gates.abort()),
            };

            info!(task = %node.id, attempt, provider = adapter.id(), model = %model, "Executing task");
            let result = adapter.execute(&ctx).await;

            cost_usd += result
                .usage
                .as_ref()
                .map(|usage| adapter.pricing(&model).cost(usage))
                .unwrap_or(0.0);

            self.persist_attempt(node, adapter.as_ref(), &model, attempt, &prompt, &result, cost_usd)
                .await;

            if result.success {
                return TaskOutcome {
                    task_id: node.id.clone(),
                    success: true,
                    output: result.output,
                    error: None,
                    error_kind: None,
                    attempts,
                    cost_usd,
                    provider_id: adapter.id().to_string(),
                    model,
                    fallback_used,
                };
            }

            let kind = result.error_kind.unwrap_or(ErrorKind::Unknown);
            last = Some(result);

            if !kind.is_retryable() {
                debug!(task = %node.id, "Permanent error, not retrying");
                break;
            }
            if attempt == MAX_ATTEMPTS {
                break;
            }

            if attempt == 1 {
                // Same provider after a short backoff
                self.backoff().await;
            } else if kind.allows_provider_switch() && !fallback_used {
                // Second transient failure: try a cross-provider fallback
                match fallback_provider(self.registry, agent, adapter.id()).await {
                    Some(other) => {
                        info!(
                            task = %node.id,
                            from = adapter.id(),
                            to = other.id(),
                            "Falling back to another provider"
                        );
                        self.log_fallback(node, adapter.id(), other.id()).await;
                        adapter = other;
                        model = resolve::default_model(adapter.as_ref());
                        fallback_used = true;
                    }
                    None => {
                        debug!(task = %node.id, "No acceptable fallback provider available");
                        self.backoff().await;
                    }
                }
            } else {
                self.backoff().await;
            }
        }

        let last = last.unwrap_or_else(|| ExecutionResult::failed("no attempts executed", 0));
        TaskOutcome {
            task_id: node.id.clone(),
            success: false,
            output: last.output,
            error: last.error,
            error_kind: last.error_kind,
            attempts,
            cost_usd,
            provider_id: adapter.id().to_string(),
            model,
            fallback_used,
        }
    }

    /// Backoff between attempts, jittered so parallel tasks do not retry
    /// in lockstep
    async fn backoff(&self) {
        let jitter = rand::rng().random_range(0..=self.config.backoff.as_millis() as u64 / 4);
        tokio::time::sleep(self.config.backoff + Duration::from_millis(jitter)).await;
    }

    /// The resolved adapter, or the first available acceptable substitute
    async fn pick_adapter(
        &self,
        resolution: &Resolution,
        agent: Option<&crate::domain::AgentDefinition>,
    ) -> Result<Arc<dyn ProviderAdapter>> {
        if let Some(adapter) = self.registry.get(&resolution.provider_id) {
            let available = self
                .registry
                .availability(adapter.id(), false)
                .await
                .map(|a| a.available)
                .unwrap_or(false);
            if available {
                return Ok(adapter);
            }
            debug!(provider = %resolution.provider_id, "Resolved provider unavailable, substituting");
        } else {
            debug!(provider = %resolution.provider_id, "Resolved provider not registered, substituting");
        }

        fallback_provider(self.registry, agent, &resolution.provider_id)
            .await
            .ok_or_else(|| eyre!("no available provider acceptable for agent"))
    }

    /// Working directory for file-access providers
    fn working_dir(&self, project: Option<&ProjectSettings>, adapter: &dyn ProviderAdapter) -> Option<PathBuf> {
        if !adapter.capabilities().file_access {
            return None;
        }
        Some(
            project
                .and_then(|p| p.working_dir.clone())
                .unwrap_or_else(|| self.gates.root().join("workspace")),
        )
    }

    /// Task prompt: skills preamble (file-access only), task body, context
    fn build_prompt(
        &self,
        node: &TaskNode,
        adapter: &dyn ProviderAdapter,
        cwd: Option<&Path>,
        context: &str,
    ) -> String {
        let mut prompt = String::new();

        if adapter.capabilities().file_access
            && let (Some(dir), Some(cwd)) = (&self.config.skills_dir, cwd)
        {
            let loaded = skills::load_skills(dir);
            let picked = skills::select(&loaded, &node.skill_hints);
            if let Err(e) = std::fs::create_dir_all(cwd) {
                warn!(error = %e, "Failed to create working directory");
            }
            if let Err(e) = skills::inject(cwd, &picked) {
                warn!(error = %e, "Skill injection failed");
            } else {
                prompt.push_str(&skills::preamble(&picked));
            }
        }

        prompt.push_str(&format!("# Task {}: {}\n\n{}\n", node.id, node.title, node.description));
        if !node.acceptance.is_empty() {
            prompt.push_str("\nAcceptance criteria:\n");
            for criterion in &node.acceptance {
                prompt.push_str(&format!("- {}\n", criterion));
            }
        }
        if !context.is_empty() {
            prompt.push_str(&format!("\n## Context from completed dependencies\n{}\n", context));
        }
        prompt
    }

    async fn persist_attempt(
        &self,
        node: &TaskNode,
        adapter: &dyn ProviderAdapter,
        model: &str,
        attempt: u32,
        prompt: &str,
        result: &ExecutionResult,
        cost_so_far: f64,
    ) {
        let record = AgentRunRecord {
            id: Uuid::now_v7().to_string(),
            run_id: self.run_id.clone(),
            task_id: node.id.clone(),
            agent: node.agent.clone(),
            role: node.role.clone(),
            provider: adapter.id().to_string(),
            model: model.to_string(),
            attempt,
            success: result.success,
            duration_ms: result.duration_ms,
            input_tokens: result.usage.map(|u| u.input_tokens).unwrap_or(0),
            output_tokens: result.usage.map(|u| u.output_tokens).unwrap_or(0),
            cost_usd: cost_so_far,
            input_excerpt: truncate_chars(prompt, INPUT_EXCERPT_CHARS),
            output_excerpt: truncate_chars(&result.output, OUTPUT_EXCERPT_CHARS),
            error: result.error.clone(),
            created_at: Utc::now().timestamp_millis(),
        };
        best_effort("agent run row", self.repo.create_agent_run(record).await).await;
    }

    async fn log_fallback(&self, node: &TaskNode, from: &str, to: &str) {
        let record = EventLogRecord {
            run_id: self.run_id.clone(),
            event_type: "provider_fallback".to_string(),
            agent: Some(node.agent.clone()),
            task_id: Some(node.id.clone()),
            payload: serde_json::json!({ "from": from, "to": to }),
            created_at: Utc::now().timestamp_millis(),
        };
        best_effort("provider fallback event", self.repo.create_event_log(record).await).await;
    }
}

/// The orchestrator's own installation root (the directory of the binary)
fn install_root() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .and_then(|dir| dir.canonicalize().ok())
}

/// The working directory must not equal or contain the installation root
pub fn ensure_cwd_safe(cwd: &Path, install_root: Option<&Path>) -> Result<()> {
    let Some(root) = install_root else {
        return Ok(());
    };
    let cwd = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());

    if root == cwd || root.starts_with(&cwd) {
        return Err(eyre!(
            "working directory {} would contain the foreman installation at {}",
            cwd.display(),
            root.display()
        ));
    }
    Ok(())
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}
