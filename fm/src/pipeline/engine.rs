//! The decision loop
//!
//! Drives one pipeline run from its initial ready tasks to termination:
//! obtain a trigger, ask the PM, apply the decision. The engine owns the
//! task graph; mutations happen only between suspension points, so
//! executions never race graph state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conflict::MemorySink;
use crate::domain::{AgentCatalog, MessageKind, PipelineRun, RunStatus, StepSummary, TaskStatus};
use crate::gates::{ProjectDir, QuestionGate, UserInbox};
use crate::graph::{StatusFields, validate};
use crate::persist::{ProjectSettings, Repository, RunPatch, TaskPatch, TaskRecord, best_effort};
use crate::pm::{BudgetView, DecisionContext, PmAction, PmClient, PmDecision, compose_prompt, parse_decision};
use crate::router::MessageRouter;
use crate::runner::{AgentRunner, TaskOutcome};

use super::post;
use super::trigger::Trigger;
use super::waiter::{HealthState, WaitEvent, next_completion};

use chrono::Utc;

/// How long the all-settled drain waits for each straggler
const DRAIN_WAIT: Duration = Duration::from_secs(30);

/// Engine knobs, extracted from [`Config`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_parallel: usize,
    pub max_decisions: u32,
    pub budget_limit: f64,
    pub budget_warn_fraction: f64,
    pub task_timeout: Duration,
    pub health_interval: Duration,
    pub stale_threshold: Duration,
    pub question_timeout: Duration,
    pub gate_poll: Duration,
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_parallel: config.concurrency.max_parallel_tasks,
            max_decisions: config.limits.max_decisions,
            budget_limit: config.budget.limit_usd,
            budget_warn_fraction: config.budget.warn_fraction,
            task_timeout: config.timeouts.task_timeout(),
            health_interval: config.timeouts.health_interval(),
            stale_threshold: config.timeouts.stale_threshold(),
            question_timeout: config.timeouts.question_timeout(),
            gate_poll: config.timeouts.gate_poll(),
        }
    }
}

/// Collaborators the engine drives
pub struct EngineDeps {
    pub pm: Arc<dyn PmClient>,
    pub runner: Arc<AgentRunner>,
    pub repo: Arc<dyn Repository>,
    pub catalog: Arc<AgentCatalog>,
    pub gates: ProjectDir,
    pub project: Option<ProjectSettings>,
    pub sink: Arc<dyn MemorySink>,
}

/// Aggregated result of a finished run
#[derive(Debug)]
pub struct PipelineOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
    pub decision_count: u32,
    pub running_cost: f64,
    pub steps: Vec<StepSummary>,
}

struct ExitState {
    status: RunStatus,
    error: Option<String>,
}

/// The trigger-driven control loop for one run
pub struct PipelineEngine {
    run: PipelineRun,
    cfg: EngineConfig,
    pm: Arc<dyn PmClient>,
    runner: Arc<AgentRunner>,
    repo: Arc<dyn Repository>,
    catalog: Arc<AgentCatalog>,
    gates: ProjectDir,
    inbox: UserInbox,
    project: Option<ProjectSettings>,
    sink: Arc<dyn MemorySink>,

    router: MessageRouter,
    user_messages: Vec<String>,
    pending: Option<Trigger>,
    running: HashMap<String, JoinHandle<()>>,
    outcome_tx: mpsc::Sender<TaskOutcome>,
    outcome_rx: mpsc::Receiver<TaskOutcome>,
    /// Force-resolved task ids whose late real outcomes must be ignored
    forced: HashSet<String>,
    health: HealthState,
    started: Instant,
    warn_due: bool,
    budget_warned: bool,
    exit: Option<ExitState>,
}

impl PipelineEngine {
    pub fn new(run: PipelineRun, cfg: EngineConfig, deps: EngineDeps) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        let inbox = UserInbox::new(deps.gates.clone(), &run.run_id);
        Self {
            run,
            cfg,
            pm: deps.pm,
            runner: deps.runner,
            repo: deps.repo,
            catalog: deps.catalog,
            gates: deps.gates,
            inbox,
            project: deps.project,
            sink: deps.sink,
            router: MessageRouter::new(),
            user_messages: Vec::new(),
            pending: None,
            running: HashMap::new(),
            outcome_tx,
            outcome_rx,
            forced: HashSet::new(),
            health: HealthState::new(),
            started: Instant::now(),
            warn_due: false,
            budget_warned: false,
            exit: None,
        }
    }

    /// Seed the entry trigger for a resumed run
    pub fn resume(mut self, interrupted: Vec<String>, failed: Vec<String>) -> Self {
        self.pending = Some(Trigger::PipelineResumed { interrupted, failed });
        self
    }

    /// Arm a trigger; a pending one is only replaced by a strictly higher
    /// priority
    fn arm(&mut self, trigger: Trigger) {
        match &self.pending {
            Some(current) if current.priority() >= trigger.priority() => {
                debug!(?trigger, "Trigger dropped in favor of pending one");
            }
            _ => self.pending = Some(trigger),
        }
    }

    fn set_exit(&mut self, status: RunStatus, error: Option<String>) {
        if self.exit.is_none() {
            self.exit = Some(ExitState { status, error });
        }
    }

    /// Run the loop to termination and return aggregated results
    pub async fn run(mut self) -> Result<PipelineOutcome> {
        info!(run_id = %self.run.run_id, "Decision loop started");
        self.gates.ensure().ok();

        loop {
            if self.exit.is_some() {
                break;
            }

            // Abort flag is checked at the top of every iteration
            if self.gates.abort().is_set() {
                self.set_exit(RunStatus::Aborted, Some("aborted by user".to_string()));
                break;
            }

            // Drain the user-message gate non-blockingly
            let drained = self.inbox.drain();
            if !drained.is_empty() {
                self.user_messages.extend(drained.into_iter().map(|m| m.message));
            }
            if !self.user_messages.is_empty() {
                self.arm(Trigger::UserMessage {
                    messages: self.user_messages.clone(),
                });
            }

            // Block on next-completion-with-health-check while work is in
            // flight and nothing else demands a decision
            if self.pending.is_none() && !self.running.is_empty() {
                let running_ids: Vec<String> = {
                    let mut ids: Vec<&String> = self.running.keys().collect();
                    ids.sort();
                    ids.into_iter().cloned().collect()
                };
                let event = next_completion(
                    &mut self.outcome_rx,
                    &self.gates,
                    &self.inbox,
                    &mut self.user_messages,
                    &running_ids,
                    &mut self.health,
                    self.cfg.health_interval,
                    self.cfg.stale_threshold,
                )
                .await;

                match event {
                    WaitEvent::Outcome(outcome) => self.on_outcome(outcome).await,
                    WaitEvent::Forced { task_id, error } => self.force_resolve(task_id, error).await,
                    WaitEvent::Closed => {
                        warn!("Outcome channel closed with executions outstanding");
                        self.running.clear();
                    }
                }
            }

            // Idle: either the run is complete or the PM must be consulted
            if self.pending.is_none() && self.running.is_empty() {
                if self.run.graph.is_complete() {
                    self.set_exit(RunStatus::Completed, None);
                    break;
                }
                let ready = self.run.graph.ready_tasks();
                if ready.is_empty() {
                    self.arm(Trigger::AllIdle);
                } else {
                    self.arm(Trigger::Initial { ready });
                }
            }

            // Deferred budget warning once nothing stronger is pending
            if self.warn_due && self.pending.is_none() {
                self.warn_due = false;
                self.arm(Trigger::BudgetWarning {
                    spent: self.run.running_cost,
                    remaining: (self.cfg.budget_limit - self.run.running_cost).max(0.0),
                });
            }

            // Calling the PM commits budget; re-check abort first
            if self.gates.abort().is_set() {
                self.set_exit(RunStatus::Aborted, Some("aborted by user".to_string()));
                break;
            }

            let Some(trigger) = self.pending.take() else {
                continue;
            };

            if self.run.decision_count >= self.cfg.max_decisions {
                self.set_exit(
                    RunStatus::Aborted,
                    Some(format!("decision cap of {} reached", self.cfg.max_decisions)),
                );
                break;
            }

            let decision = self.decide(&trigger).await;
            self.run.decision_count += 1;

            for action in decision.actions {
                self.apply(action).await;
            }

            // Accumulators are take-and-clear per cycle
            self.router.take();
            self.user_messages.clear();

            // Budget ceiling
            if self.run.running_cost > self.cfg.budget_limit {
                self.run.steps.push(StepSummary {
                    agent: "pm".to_string(),
                    role: None,
                    title: "Budget exceeded".to_string(),
                    status: "aborted".to_string(),
                    output: Some(format!(
                        "Run stopped: ${:.2} spent against a ${:.2} limit",
                        self.run.running_cost, self.cfg.budget_limit
                    )),
                });
                self.set_exit(
                    RunStatus::Aborted,
                    Some(format!(
                        "budget exceeded: ${:.2} > ${:.2}",
                        self.run.running_cost, self.cfg.budget_limit
                    )),
                );
                break;
            }

            // Cheap checkpoint: counters only; graph and steps at exit
            best_effort(
                "cheap checkpoint",
                self.repo
                    .update_pipeline_run(
                        &self.run.run_id,
                        RunPatch {
                            decision_count: Some(self.run.decision_count),
                            running_cost: Some(self.run.running_cost),
                            heartbeat_at: Some(Utc::now().timestamp_millis()),
                            ..Default::default()
                        },
                    )
                    .await,
            )
            .await;
        }

        let exit = self.exit.take().unwrap_or(ExitState {
            status: RunStatus::Completed,
            error: None,
        });

        // Await outstanding executions with all-settled semantics. Aborted
        // runs keep their running nodes' last-known state for resume.
        let apply_stragglers = exit.status != RunStatus::Aborted;
        self.drain_outstanding(apply_stragglers).await;

        self.run.status = exit.status;
        self.run.error = exit.error.clone();

        // Final checkpoint is a lifecycle write: failures propagate
        self.repo
            .update_pipeline_run(
                &self.run.run_id,
                RunPatch {
                    status: Some(self.run.status),
                    graph: Some(self.run.graph.clone()),
                    decision_count: Some(self.run.decision_count),
                    running_cost: Some(self.run.running_cost),
                    heartbeat_at: Some(Utc::now().timestamp_millis()),
                    steps: Some(self.run.steps.clone()),
                    error: exit.error.clone(),
                },
            )
            .await
            .context("final checkpoint failed")?;

        info!(
            run_id = %self.run.run_id,
            status = %self.run.status,
            decisions = self.run.decision_count,
            cost = self.run.running_cost,
            "Decision loop finished"
        );

        Ok(PipelineOutcome {
            status: self.run.status,
            error: exit.error,
            decision_count: self.run.decision_count,
            running_cost: self.run.running_cost,
            steps: self.run.steps,
        })
    }

    /// Compose the prompt, invoke the PM, parse tolerantly. Unparseable
    /// replies fall back to auto-launching ready tasks for this cycle.
    async fn decide(&mut self, trigger: &Trigger) -> PmDecision {
        let trigger_text = trigger.render();
        let prompt = {
            let graph = &self.run.graph;
            let ctx = DecisionContext {
                graph,
                running: graph.ids_with_status(TaskStatus::Running),
                completed: graph.ids_with_status(TaskStatus::Done),
                failed: graph.ids_with_status(TaskStatus::Failed),
                ready: graph.ready_tasks(),
                budget: BudgetView {
                    spent: self.run.running_cost,
                    limit: self.cfg.budget_limit,
                },
                messages_to_pm: self.router.pm_messages(),
                recent_messages: self.router.recent_messages(),
                user_messages: &self.user_messages,
                elapsed: self.started.elapsed(),
                catalog: &self.catalog,
            };
            compose_prompt(&trigger_text, &ctx)
        };

        let reply = match self.pm.decide(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "PM invocation failed, auto-launching ready tasks");
                String::new()
            }
        };

        let parsed = parse_decision(&reply);
        let parsed_ok = parsed.is_some();
        let decision = parsed.unwrap_or_else(|| {
            warn!("PM reply unparseable, auto-launching ready tasks");
            PmDecision {
                reasoning: "fallback: auto-launch ready tasks".to_string(),
                actions: vec![PmAction::Execute {
                    task_ids: self.run.graph.ready_tasks(),
                }],
            }
        });

        best_effort(
            "pm decision log",
            self.repo
                .create_pm_decision_log(crate::persist::PmDecisionRecord {
                    run_id: self.run.run_id.clone(),
                    round: self.run.decision_count + 1,
                    trigger: trigger_text,
                    reply_excerpt: reply.chars().take(2000).collect(),
                    parsed_ok,
                    action_count: decision.actions.len(),
                    created_at: Utc::now().timestamp_millis(),
                })
                .await,
        )
        .await;

        decision
    }

    /// Apply one PM action
    async fn apply(&mut self, action: PmAction) {
        match action {
            PmAction::Execute { task_ids } => {
                let slots = self.cfg.max_parallel.saturating_sub(self.running.len());
                if task_ids.len() > slots {
                    debug!(
                        requested = task_ids.len(),
                        slots, "Execute exceeds parallelism budget; extras stay ready"
                    );
                }
                let launch_now: Vec<String> = task_ids.into_iter().take(slots).collect();
                for task_id in launch_now {
                    self.launch(&task_id).await;
                }
            }

            PmAction::AddTasks { tasks } => {
                let round = self.run.decision_count + 1;
                let (graph, added) = self.run.graph.add_tasks(tasks, round);
                if let Err(e) = validate::check(&graph) {
                    warn!(error = %e, "Graph invalid after add_tasks");
                }
                info!(?added, "Tasks added");
                self.run.graph = graph;
            }

            PmAction::RemoveTasks { task_ids, reason } => {
                info!(?task_ids, %reason, "Tasks removed");
                self.run.graph = self.run.graph.remove_tasks(&task_ids);
                self.log_event("tasks_removed", serde_json::json!({ "task_ids": task_ids, "reason": reason }))
                    .await;
            }

            PmAction::Reassign {
                task_id,
                agent,
                role,
                reason,
            } => {
                info!(%task_id, %agent, ?role, %reason, "Task reassigned");
                self.run.graph = self.run.graph.reassign(&task_id, &agent, role.as_deref());
            }

            PmAction::Retry { task_id, changes } => {
                info!(%task_id, "Task reset for retry");
                self.run.graph = self.run.graph.retry(&task_id, changes.as_ref());
            }

            PmAction::AskUser {
                question,
                context,
                blocking_task_ids,
            } => {
                self.ask_user(&question, context.as_deref(), &blocking_task_ids).await;
            }

            PmAction::AnswerAgent { task_id, answer } => {
                best_effort(
                    "task note",
                    self.repo
                        .create_task_note(crate::persist::TaskNoteRecord {
                            run_id: self.run.run_id.clone(),
                            task_id: task_id.clone(),
                            note: answer,
                            created_at: Utc::now().timestamp_millis(),
                        })
                        .await,
                )
                .await;
                self.run.graph = self.run.graph.unblock(&task_id);
            }

            PmAction::Complete { summary } => {
                info!(%summary, "PM declared the pipeline complete");
                self.run.steps.push(StepSummary {
                    agent: "pm".to_string(),
                    role: None,
                    title: "Pipeline complete".to_string(),
                    status: "done".to_string(),
                    output: Some(summary),
                });
                self.set_exit(RunStatus::Completed, None);
            }

            PmAction::Skip { task_ids, reason } => {
                info!(?task_ids, %reason, "Tasks skipped");
                self.run.graph = self.run.graph.skip_tasks(&task_ids);
                self.log_event("tasks_skipped", serde_json::json!({ "task_ids": task_ids, "reason": reason }))
                    .await;
            }
        }
    }

    /// Transition a task to running and spawn its execution
    async fn launch(&mut self, task_id: &str) {
        if self.running.contains_key(task_id) {
            debug!(%task_id, "Already running, not launching again");
            return;
        }
        let Some(node) = self.run.graph.get(task_id).cloned() else {
            warn!(%task_id, "Execute names an unknown task");
            return;
        };

        // Context from completed dependencies
        let context: String = node
            .depends_on
            .iter()
            .filter_map(|dep| self.run.graph.get(dep))
            .filter_map(|dep| dep.output.as_ref().map(|o| format!("### {}\n{}\n", dep.id, o)))
            .collect();

        self.run.graph = self.run.graph.update_status(task_id, TaskStatus::Running);
        self.gates
            .live_log()
            .append(&format!("▶ {} {} ({})", node.id, node.title, node.agent_label()));

        best_effort(
            "task row",
            self.repo
                .create_task(TaskRecord {
                    run_id: self.run.run_id.clone(),
                    graph_id: node.id.clone(),
                    title: node.title.clone(),
                    agent: node.agent.clone(),
                    role: node.role.clone(),
                    status: "running".to_string(),
                    created_at: Utc::now().timestamp_millis(),
                })
                .await,
        )
        .await;

        let runner = Arc::clone(&self.runner);
        let project = self.project.clone();
        let tx = self.outcome_tx.clone();
        let timeout = self.cfg.task_timeout;
        let spawn_node = node.clone();

        let handle = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, runner.run_task(&spawn_node, project.as_ref(), &context))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => TaskOutcome {
                    task_id: spawn_node.id.clone(),
                    success: false,
                    output: String::new(),
                    error: Some("timed out".to_string()),
                    error_kind: Some(crate::providers::classify("timed out")),
                    attempts: 1,
                    cost_usd: 0.0,
                    provider_id: String::new(),
                    model: String::new(),
                    fallback_used: false,
                },
            };
            let _ = tx.send(outcome).await;
        });

        self.running.insert(task_id.to_string(), handle);
        self.health.touch();
        info!(%task_id, "Task launched");
    }

    /// A health check decided this task will never resolve on its own
    async fn force_resolve(&mut self, task_id: String, error: String) {
        if let Some(handle) = self.running.get(&task_id) {
            handle.abort();
        }
        self.forced.insert(task_id.clone());

        let outcome = TaskOutcome {
            task_id: task_id.clone(),
            success: false,
            output: String::new(),
            error: Some(error.clone()),
            error_kind: Some(crate::providers::classify(&error)),
            attempts: 1,
            cost_usd: 0.0,
            provider_id: String::new(),
            model: String::new(),
            fallback_used: false,
        };
        // Process the synthetic failure like any other outcome
        self.running.remove(&task_id);
        self.apply_outcome(outcome).await;
    }

    /// A task resolved; update graph, persist, post-process, arm a trigger
    async fn on_outcome(&mut self, outcome: TaskOutcome) {
        if self.forced.remove(&outcome.task_id) {
            debug!(task = %outcome.task_id, "Ignoring late outcome for force-resolved task");
            return;
        }
        self.running.remove(&outcome.task_id);
        self.apply_outcome(outcome).await;
    }

    async fn apply_outcome(&mut self, outcome: TaskOutcome) {
        let Some(node) = self.run.graph.get(&outcome.task_id).cloned() else {
            warn!(task = %outcome.task_id, "Outcome for a task not in the graph");
            return;
        };

        let result = post::process(
            &self.repo,
            &self.sink,
            &mut self.router,
            &self.catalog,
            &self.run.run_id,
            &node,
            &outcome,
        )
        .await;
        self.run.steps.push(result.step);

        let status = if outcome.success { TaskStatus::Done } else { TaskStatus::Failed };
        self.run.graph = self.run.graph.update_status_with(
            &outcome.task_id,
            status,
            StatusFields {
                output: outcome.success.then(|| result.stripped_output.clone()),
                error: outcome.error.clone(),
                cost_delta: outcome.cost_usd,
                attempts_delta: outcome.attempts,
            },
        );
        self.run.running_cost += outcome.cost_usd;

        best_effort(
            "task update",
            self.repo
                .update_task_by_graph_id(
                    &self.run.run_id,
                    &outcome.task_id,
                    TaskPatch {
                        status: Some(status.to_string()),
                        output: outcome.success.then(|| result.stripped_output.clone()),
                        error: outcome.error.clone(),
                        attempts: self.run.graph.get(&outcome.task_id).map(|n| n.attempts),
                        cost_usd: self.run.graph.get(&outcome.task_id).map(|n| n.cost_usd),
                    },
                )
                .await,
        )
        .await;

        self.gates.live_log().append(&format!(
            "{} {} {}",
            if outcome.success { "✔" } else { "✘" },
            outcome.task_id,
            if outcome.success { "completed" } else { "failed" }
        ));

        // Budget caution threshold arms a one-shot warning
        if !self.budget_warned && self.run.running_cost >= self.cfg.budget_limit * self.cfg.budget_warn_fraction {
            self.budget_warned = true;
            self.warn_due = true;
        }

        // Arm the next trigger. A question to the PM outranks the plain
        // completion payload; both beat gathered user messages.
        if outcome.success {
            let pm_question = self
                .router
                .pm_messages()
                .iter()
                .rev()
                .find(|m| m.task_id == outcome.task_id && m.kind == MessageKind::Question)
                .cloned();
            let pm_other = self
                .router
                .pm_messages()
                .iter()
                .rev()
                .find(|m| m.task_id == outcome.task_id)
                .cloned();

            if let Some(question) = pm_question {
                self.arm(Trigger::AgentQuestion {
                    agent: node.agent.clone(),
                    task_id: outcome.task_id.clone(),
                    question: question.content,
                });
            } else if let Some(message) = pm_other {
                self.arm(Trigger::AgentMessageToPm {
                    agent: node.agent.clone(),
                    task_id: outcome.task_id.clone(),
                    kind: message.kind,
                    content: message.content,
                });
            } else {
                let summary: String = result.stripped_output.chars().take(200).collect();
                self.arm(Trigger::TaskCompleted {
                    task_id: outcome.task_id.clone(),
                    summary: summary.trim().to_string(),
                });
            }
        } else {
            let attempts = self.run.graph.get(&outcome.task_id).map(|n| n.attempts).unwrap_or(0);
            self.arm(Trigger::TaskFailed {
                task_id: outcome.task_id.clone(),
                error: outcome.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                attempts,
            });
        }

        self.health.touch();
    }

    /// Publish a PM question, block the listed tasks, wait for the reply
    async fn ask_user(&mut self, question: &str, context: Option<&str>, blocking: &[String]) {
        for task_id in blocking {
            self.run.graph = self.run.graph.block(task_id, question);
        }

        let gate = QuestionGate::new(self.gates.clone(), &self.run.run_id);
        if let Err(e) = gate.ask(question, context) {
            warn!(error = %e, "Failed to publish question gate");
        } else {
            let answer = gate.await_answer(self.cfg.question_timeout, self.cfg.gate_poll).await;
            match answer {
                Some(answer) => {
                    // Seed the next cycle with the user's reply
                    self.user_messages.push(answer);
                    self.arm(Trigger::UserMessage {
                        messages: self.user_messages.clone(),
                    });
                }
                None => info!("Question timed out; unblocking without an answer"),
            }
        }

        for task_id in blocking {
            self.run.graph = self.run.graph.unblock(task_id);
        }
    }

    async fn log_event(&self, event_type: &str, payload: serde_json::Value) {
        best_effort(
            "event row",
            self.repo
                .create_event_log(crate::persist::EventLogRecord {
                    run_id: self.run.run_id.clone(),
                    event_type: event_type.to_string(),
                    agent: None,
                    task_id: None,
                    payload,
                    created_at: Utc::now().timestamp_millis(),
                })
                .await,
        )
        .await;
    }

    /// Await outstanding executions. When `apply` is false (aborted runs),
    /// handles are dropped and the graph keeps the running nodes' last
    /// known state for resume.
    async fn drain_outstanding(&mut self, apply: bool) {
        if !apply {
            for (_, handle) in self.running.drain() {
                handle.abort();
            }
            return;
        }

        while !self.running.is_empty() {
            match tokio::time::timeout(DRAIN_WAIT, self.outcome_rx.recv()).await {
                Ok(Some(outcome)) => self.on_outcome(outcome).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(outstanding = self.running.len(), "Drain timed out; aborting stragglers");
                    for (_, handle) in self.running.drain() {
                        handle.abort();
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::NoopSink;
    use crate::persist::JsonlRepository;
    use crate::pm::ScriptedPm;
    use crate::providers::testing::MockAdapter;
    use crate::providers::{Capabilities, ExecutionResult, ProviderRegistry};
    use crate::runner::RunnerConfig;
    use tempfile::tempdir;

    fn decision(json: &str) -> String {
        format!("[PM_DECISION] {} [/PM_DECISION]", json)
    }

    fn engine_config() -> EngineConfig {
        EngineConfig {
            max_parallel: 3,
            max_decisions: 20,
            budget_limit: 25.0,
            budget_warn_fraction: 0.8,
            task_timeout: Duration::from_secs(10),
            health_interval: Duration::from_millis(20),
            stale_threshold: Duration::from_secs(60),
            question_timeout: Duration::from_millis(100),
            gate_poll: Duration::from_millis(10),
        }
    }

    struct Fixture {
        run: PipelineRun,
        deps: EngineDeps,
        repo: Arc<JsonlRepository>,
        _temp: tempfile::TempDir,
    }

    fn fixture(pm_replies: Vec<String>, mock_results: Vec<ExecutionResult>) -> Fixture {
        let temp = tempdir().unwrap();
        let repo = Arc::new(JsonlRepository::new(temp.path().join("store")));
        let gates = ProjectDir::at(temp.path().join("gates"));

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockAdapter::new(
            "mock-a",
            Capabilities::prompt_only(),
            mock_results,
        )));
        let registry: &'static ProviderRegistry = Box::leak(Box::new(registry));

        let catalog = Arc::new(AgentCatalog::builtin().unwrap());
        let runner = Arc::new(AgentRunner::new(
            registry,
            Arc::clone(&repo) as Arc<dyn Repository>,
            Arc::clone(&catalog),
            gates.clone(),
            "run-1",
            "proj-1",
            RunnerConfig {
                default_provider: "mock-a".to_string(),
                backoff: Duration::from_millis(1),
                ..Default::default()
            },
        ));

        let mut run = PipelineRun::new("run-1", "proj-1", "do the thing");
        let (graph, _) = run.graph.add_tasks(
            vec![crate::domain::TaskSpec {
                id: Some("t1".to_string()),
                title: "first".to_string(),
                description: "work".to_string(),
                acceptance: vec![],
                depends_on: vec![],
                agent: "researcher".to_string(),
                role: None,
                provider: Some("mock-a".to_string()),
                model: None,
                skills: vec![],
            }],
            0,
        );
        run.graph = graph;

        Fixture {
            run,
            deps: EngineDeps {
                pm: Arc::new(ScriptedPm::new(pm_replies)),
                runner,
                repo: Arc::clone(&repo) as Arc<dyn Repository>,
                catalog,
                gates,
                project: None,
                sink: Arc::new(NoopSink),
            },
            repo,
            _temp: temp,
        }
    }

    #[tokio::test]
    async fn test_single_task_to_completion() {
        let fx = fixture(
            vec![
                decision(r#"{"reasoning":"go","actions":[{"type":"execute","task_ids":["t1"]}]}"#),
                decision(r#"{"reasoning":"done","actions":[{"type":"complete","summary":"shipped"}]}"#),
            ],
            vec![ExecutionResult::ok("output one", 5, None)],
        );
        fx.deps.repo.create_pipeline_run(&fx.run).await.unwrap();

        let engine = PipelineEngine::new(fx.run, engine_config(), fx.deps);
        let outcome = engine.run().await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.decision_count, 2);
        // Agent step plus the PM completion step
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.steps[0].status, "done");

        let run = fx.repo.get_pipeline_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.graph.is_complete());
    }

    #[tokio::test]
    async fn test_unparseable_pm_auto_launches() {
        let fx = fixture(
            vec![
                "I can't decide, sorry!".to_string(),
                decision(r#"{"reasoning":"done","actions":[{"type":"complete","summary":"ok"}]}"#),
            ],
            vec![ExecutionResult::ok("auto", 5, None)],
        );
        fx.deps.repo.create_pipeline_run(&fx.run).await.unwrap();

        let engine = PipelineEngine::new(fx.run, engine_config(), fx.deps);
        let outcome = engine.run().await.unwrap();

        // The fallback still launched and completed t1
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(outcome.steps.iter().any(|s| s.status == "done"));

        let decisions = fx.repo.pm_decisions().await.unwrap();
        assert!(!decisions[0].parsed_ok);
    }

    #[tokio::test]
    async fn test_execute_respects_parallelism_budget() {
        let mut fx = fixture(
            vec![
                decision(
                    r#"{"reasoning":"all","actions":[{"type":"execute","task_ids":["t1","t2","t3"]}]}"#,
                ),
                decision(r#"{"reasoning":"done","actions":[{"type":"complete","summary":"ok"}]}"#),
            ],
            vec![
                ExecutionResult::ok("a", 5, None),
                ExecutionResult::ok("b", 5, None),
                ExecutionResult::ok("c", 5, None),
            ],
        );
        // Two more independent tasks
        let (graph, _) = fx.run.graph.add_tasks(
            vec![
                crate::domain::TaskSpec {
                    id: Some("t2".to_string()),
                    title: "second".to_string(),
                    description: String::new(),
                    acceptance: vec![],
                    depends_on: vec![],
                    agent: "researcher".to_string(),
                    role: None,
                    provider: Some("mock-a".to_string()),
                    model: None,
                    skills: vec![],
                },
                crate::domain::TaskSpec {
                    id: Some("t3".to_string()),
                    title: "third".to_string(),
                    description: String::new(),
                    acceptance: vec![],
                    depends_on: vec![],
                    agent: "researcher".to_string(),
                    role: None,
                    provider: Some("mock-a".to_string()),
                    model: None,
                    skills: vec![],
                },
            ],
            0,
        );
        fx.run.graph = graph;
        fx.deps.repo.create_pipeline_run(&fx.run).await.unwrap();

        let mut cfg = engine_config();
        cfg.max_parallel = 1;

        let engine = PipelineEngine::new(fx.run, cfg, fx.deps);
        let outcome = engine.run().await.unwrap();

        // With max_parallel = 1 only t1 launches on the first decision; the
        // second decision completes the run with t2/t3 still ready
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.decision_count, 2);
        assert_eq!(outcome.steps.iter().filter(|s| s.status == "done").count(), 2);
    }

    #[tokio::test]
    async fn test_decision_cap_aborts() {
        let fx = fixture(
            // PM never makes progress: always an empty action list
            vec![decision(r#"{"reasoning":"hmm","actions":[]}"#)],
            vec![],
        );
        fx.deps.repo.create_pipeline_run(&fx.run).await.unwrap();

        let mut cfg = engine_config();
        cfg.max_decisions = 3;

        let engine = PipelineEngine::new(fx.run, cfg, fx.deps);
        let outcome = engine.run().await.unwrap();

        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(outcome.decision_count, 3);
        assert!(outcome.error.unwrap().contains("decision cap"));
    }

    #[tokio::test]
    async fn test_abort_flag_stops_run() {
        let fx = fixture(vec![decision(r#"{"reasoning":"x","actions":[]}"#)], vec![]);
        fx.deps.repo.create_pipeline_run(&fx.run).await.unwrap();
        fx.deps.gates.ensure().unwrap();
        fx.deps.gates.abort().set().unwrap();

        let engine = PipelineEngine::new(fx.run, engine_config(), fx.deps);
        let outcome = engine.run().await.unwrap();

        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(outcome.decision_count, 0);
    }

    #[tokio::test]
    async fn test_complete_action_wins_over_idle_detection() {
        let fx = fixture(
            vec![decision(
                r#"{"reasoning":"nothing to do","actions":[{"type":"skip","task_ids":["t1"],"reason":"moot"},{"type":"complete","summary":"trivial"}]}"#,
            )],
            vec![],
        );
        fx.deps.repo.create_pipeline_run(&fx.run).await.unwrap();

        let engine = PipelineEngine::new(fx.run, engine_config(), fx.deps);
        let outcome = engine.run().await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.decision_count, 1);
        assert!(outcome.steps.iter().any(|s| s.title == "Pipeline complete"));
    }
}
