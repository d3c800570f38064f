//! Worker process lifecycle
//!
//! The worker is the detached process that owns one pipeline run: it writes
//! its pid gate, publishes the PM's plan for confirmation, heartbeats the
//! run record while alive, drives the decision loop, and writes the final
//! checkpoint before exiting.

use std::sync::Arc;

use chrono::Utc;
use eyre::{Context, Result, eyre};
use tracing::{info, warn};

use crate::config::Config;
use crate::conflict::{MemorySink, NoopSink};
use crate::domain::{AgentCatalog, PipelineRun, RunStatus, TaskStatus};
use crate::gates::{PlanDecision, PlanGate, ProjectDir, UserInbox};
use crate::persist::{Repository, RunPatch, best_effort};
use crate::pipeline::{EngineConfig, EngineDeps, PipelineEngine, PipelineOutcome, Trigger};
use crate::pm::{PmAction, PmClient, RegistryPm, compose_prompt, parse_decision};
use crate::providers::ProviderRegistry;
use crate::runner::{AgentRunner, RunnerConfig};

/// Drives one pipeline run end to end
pub struct Worker {
    config: Config,
    repo: Arc<dyn Repository>,
    registry: &'static ProviderRegistry,
    pm: Arc<dyn PmClient>,
    sink: Arc<dyn MemorySink>,
}

impl Worker {
    pub fn new(config: Config, repo: Arc<dyn Repository>, registry: &'static ProviderRegistry) -> Self {
        Self {
            config,
            repo,
            registry,
            pm: Arc::new(RegistryPm::new(registry)),
            sink: Arc::new(NoopSink),
        }
    }

    /// Substitute the PM client (tests)
    pub fn with_pm(mut self, pm: Arc<dyn PmClient>) -> Self {
        self.pm = pm;
        self
    }

    /// Substitute the memory sink
    pub fn with_sink(mut self, sink: Arc<dyn MemorySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Create and persist a fresh run record (the front end's step)
    pub async fn create_run(&self, project_id: &str, request: &str) -> Result<PipelineRun> {
        let run = PipelineRun::new(uuid::Uuid::now_v7().to_string(), project_id, request);
        self.repo
            .create_pipeline_run(&run)
            .await
            .context("failed to create pipeline run")?;
        Ok(run)
    }

    /// Run the worker for an existing run id
    pub async fn run(self, run_id: &str) -> Result<PipelineOutcome> {
        let mut run = self
            .repo
            .get_pipeline_run(run_id)
            .await?
            .ok_or_else(|| eyre!("pipeline run {} not found", run_id))?;

        let gates = ProjectDir::for_project(&run.project_id);
        gates.ensure()?;
        gates.write_pid()?;
        // A stale abort flag from an earlier run must not kill this one
        gates.abort().clear().ok();

        let resume = !run.graph.is_empty();
        let interrupted = run.graph.ids_with_status(TaskStatus::Running);
        let previously_failed = run.graph.ids_with_status(TaskStatus::Failed);

        let catalog = Arc::new(AgentCatalog::load(self.config.storage.agents_dir.as_deref())?);
        let project = self.repo.find_project_by_id(&run.project_id).await.unwrap_or(None);

        // Fresh runs go through planning and the plan-confirmation gate
        if !resume {
            match self.plan(&mut run, &gates, &catalog).await? {
                PlanPhase::Proceed => {}
                PlanPhase::Rejected(reason) => {
                    run.status = RunStatus::Failed;
                    run.error = Some(reason.clone());
                    self.repo
                        .update_pipeline_run(
                            run_id,
                            RunPatch {
                                status: Some(RunStatus::Failed),
                                graph: Some(run.graph.clone()),
                                error: Some(reason.clone()),
                                heartbeat_at: Some(Utc::now().timestamp_millis()),
                                ..Default::default()
                            },
                        )
                        .await
                        .context("failed to record plan rejection")?;
                    gates.remove_pid().ok();
                    return Ok(PipelineOutcome {
                        status: RunStatus::Failed,
                        error: Some(reason),
                        decision_count: run.decision_count,
                        running_cost: run.running_cost,
                        steps: run.steps,
                    });
                }
            }
        }

        // Heartbeat on a fixed cadence while the loop runs
        let heartbeat = {
            let repo = Arc::clone(&self.repo);
            let run_id = run_id.to_string();
            let interval = self.config.timeouts.heartbeat_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    best_effort(
                        "heartbeat",
                        repo.update_pipeline_run(&run_id, RunPatch::heartbeat(Utc::now().timestamp_millis()))
                            .await,
                    )
                    .await;
                }
            })
        };

        let runner = Arc::new(AgentRunner::new(
            self.registry,
            Arc::clone(&self.repo),
            Arc::clone(&catalog),
            gates.clone(),
            run_id,
            &run.project_id,
            RunnerConfig {
                default_provider: self.config.providers.default.clone(),
                task_timeout: self.config.timeouts.task_timeout(),
                skills_dir: self.config.storage.skills_dir.clone(),
                ..Default::default()
            },
        ));

        let deps = EngineDeps {
            pm: Arc::clone(&self.pm),
            runner,
            repo: Arc::clone(&self.repo),
            catalog,
            gates: gates.clone(),
            project,
            sink: Arc::clone(&self.sink),
        };

        let mut engine = PipelineEngine::new(run, EngineConfig::from(&self.config), deps);
        if resume {
            info!(?interrupted, failed = ?previously_failed, "Resuming pipeline");
            engine = engine.resume(interrupted, previously_failed);
        }
        let outcome = engine.run().await;

        heartbeat.abort();
        gates.remove_pid().ok();

        outcome
    }

    /// Ask the PM for an initial plan, publish it, and wait for the user
    async fn plan(&self, run: &mut PipelineRun, gates: &ProjectDir, catalog: &Arc<AgentCatalog>) -> Result<PlanPhase> {
        best_effort(
            "awaiting-plan status",
            self.repo
                .update_pipeline_run(
                    &run.run_id,
                    RunPatch {
                        status: Some(RunStatus::AwaitingPlan),
                        ..Default::default()
                    },
                )
                .await,
        )
        .await;

        let trigger = Trigger::Initial { ready: vec![] };
        let user_messages = [run.request.clone()];
        let prompt = {
            let ctx = crate::pm::DecisionContext {
                graph: &run.graph,
                running: vec![],
                completed: vec![],
                failed: vec![],
                ready: vec![],
                budget: crate::pm::BudgetView {
                    spent: 0.0,
                    limit: self.config.budget.limit_usd,
                },
                messages_to_pm: &[],
                recent_messages: &[],
                user_messages: &user_messages,
                elapsed: std::time::Duration::ZERO,
                catalog,
            };
            compose_prompt(&trigger.render(), &ctx)
        };

        match self.pm.decide(&prompt).await.ok().and_then(|reply| parse_decision(&reply)) {
            Some(decision) => {
                for action in decision.actions {
                    if let PmAction::AddTasks { tasks } = action {
                        let (graph, _) = run.graph.add_tasks(tasks, 0);
                        run.graph = graph;
                    }
                }
            }
            // Plan parsing is non-fatal; the loop re-consults the PM
            None => warn!("Initial plan unparseable, continuing without one"),
        }

        let plan_text = render_plan(run);
        let gate = PlanGate::new(gates.clone(), &run.run_id);
        if let Err(e) = gate.publish(&plan_text) {
            warn!(error = %e, "Failed to publish plan gate");
        }

        let decision = gate
            .await_decision(
                self.config.timeouts.plan_confirm_timeout(),
                self.config.timeouts.gate_poll(),
            )
            .await;

        match decision {
            PlanDecision::Rejected { notes } => {
                let reason = match notes {
                    Some(notes) => format!("plan rejected by user: {}", notes),
                    None => "plan rejected by user".to_string(),
                };
                info!(%reason, "Plan rejected");
                Ok(PlanPhase::Rejected(reason))
            }
            PlanDecision::Modified { notes } => {
                // Modification notes reach the PM as the first user message
                if let Some(notes) = notes {
                    let inbox = UserInbox::new(gates.clone(), &run.run_id);
                    inbox.post(&notes).ok();
                }
                self.mark_running(run).await;
                Ok(PlanPhase::Proceed)
            }
            PlanDecision::Confirmed | PlanDecision::TimedOut => {
                self.mark_running(run).await;
                Ok(PlanPhase::Proceed)
            }
        }
    }

    async fn mark_running(&self, run: &PipelineRun) {
        best_effort(
            "running status",
            self.repo
                .update_pipeline_run(
                    &run.run_id,
                    RunPatch {
                        status: Some(RunStatus::Running),
                        graph: Some(run.graph.clone()),
                        ..Default::default()
                    },
                )
                .await,
        )
        .await;
    }
}

enum PlanPhase {
    Proceed,
    Rejected(String),
}

/// Human-readable plan listing for the confirmation gate
fn render_plan(run: &PipelineRun) -> String {
    let mut out = format!("Request: {}\n\nPlanned tasks:\n", run.request);
    for (index, node) in run.graph.tasks().enumerate() {
        out.push_str(&format!("{}. {} — {} ({})", index + 1, node.id, node.title, node.agent_label()));
        if !node.depends_on.is_empty() {
            out.push_str(&format!(" [after {}]", node.depends_on.join(", ")));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskSpec;

    fn run_with_tasks() -> PipelineRun {
        let mut run = PipelineRun::new("run-1", "proj-1", "add auth");
        let (graph, _) = run.graph.add_tasks(
            vec![
                TaskSpec {
                    id: Some("t1".to_string()),
                    title: "Design schema".to_string(),
                    description: String::new(),
                    acceptance: vec![],
                    depends_on: vec![],
                    agent: "researcher".to_string(),
                    role: None,
                    provider: None,
                    model: None,
                    skills: vec![],
                },
                TaskSpec {
                    id: Some("t2".to_string()),
                    title: "Implement".to_string(),
                    description: String::new(),
                    acceptance: vec![],
                    depends_on: vec!["t1".to_string()],
                    agent: "coder".to_string(),
                    role: Some("backend".to_string()),
                    provider: None,
                    model: None,
                    skills: vec![],
                },
            ],
            0,
        );
        run.graph = graph;
        run
    }

    #[test]
    fn test_render_plan() {
        let run = run_with_tasks();
        let plan = render_plan(&run);
        assert!(plan.contains("Request: add auth"));
        assert!(plan.contains("1. t1 — Design schema (researcher)"));
        assert!(plan.contains("2. t2 — Implement (coder:backend) [after t1]"));
    }
}
