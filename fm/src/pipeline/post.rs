//! Post-task processing
//!
//! After a task resolves (success or failure) the loop runs these steps in
//! order, each individually non-fatal: record a step summary, extract and
//! route inter-agent messages, evaluate debates, append an event-log row,
//! and fire-and-forget ingestion into the external memory stores.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::conflict::{self, MemorySink};
use crate::domain::{AgentCatalog, StepSummary, TaskNode};
use crate::persist::{EventLogRecord, Repository, best_effort};
use crate::router::{MessageRouter, extract_messages};
use crate::runner::TaskOutcome;

/// What post-processing produced for the caller
pub struct PostResult {
    /// The outcome output with message envelopes stripped
    pub stripped_output: String,
    /// The step summary to append to the run record
    pub step: StepSummary,
}

/// Run the post-task steps for one resolved task
pub async fn process(
    repo: &Arc<dyn Repository>,
    sink: &Arc<dyn MemorySink>,
    router: &mut MessageRouter,
    catalog: &AgentCatalog,
    run_id: &str,
    node: &TaskNode,
    outcome: &TaskOutcome,
) -> PostResult {
    // 1. Step summary
    let status = if outcome.success { "done" } else { "failed" };
    let step = StepSummary {
        agent: node.agent.clone(),
        role: node.role.clone(),
        title: node.title.clone(),
        status: status.to_string(),
        output: if outcome.success {
            Some(outcome.output.clone())
        } else {
            outcome.error.clone()
        },
    };

    // 2. Inter-agent messages: extract, persist, route, strip
    let (messages, stripped_output) = extract_messages(&outcome.output, &node.agent, &node.id);
    for message in &messages {
        best_effort("agent message row", repo.create_agent_message(run_id, message).await).await;
    }
    for message in &messages {
        router.route(message.clone());
    }

    // 3. Debate evaluation (delegated)
    let conflicts = conflict::detect_conflicts(router.recent_messages());
    for found in conflicts {
        debug!(between = ?found.between, "Debate exchange detected");
        let sink = Arc::clone(sink);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            sink.evaluate_debate(&run_id, &found).await;
        });
    }

    // 4. Event log entry typed by agent role
    let event_type = catalog
        .get(&node.agent)
        .and_then(|a| a.event_type.clone())
        .unwrap_or_else(|| node.agent.clone());
    best_effort(
        "task event row",
        repo.create_event_log(EventLogRecord {
            run_id: run_id.to_string(),
            event_type,
            agent: Some(node.agent.clone()),
            task_id: Some(node.id.clone()),
            payload: serde_json::json!({
                "status": status,
                "attempts": outcome.attempts,
                "provider": outcome.provider_id,
                "cost_usd": outcome.cost_usd,
            }),
            created_at: Utc::now().timestamp_millis(),
        })
        .await,
    )
    .await;

    // 5. Memory and personality ingestion, fire-and-forget
    {
        let sink = Arc::clone(sink);
        let run_id = run_id.to_string();
        let agent = node.agent.clone();
        let task_id = node.id.clone();
        let summary = step.output.clone().unwrap_or_default();
        let opinions = conflict::extract_opinions(&stripped_output);
        tokio::spawn(async move {
            sink.ingest_event(&run_id, &agent, &task_id, &summary).await;
            for opinion in opinions {
                sink.ingest_opinion(&agent, &opinion).await;
            }
        });
    }

    // 6. Relationship updates from the extracted messages, fire-and-forget
    for message in messages {
        let sink = Arc::clone(sink);
        tokio::spawn(async move {
            sink.update_relationship(&message.from, &message.to, message.kind).await;
        });
    }

    PostResult {
        stripped_output,
        step,
    }
}
