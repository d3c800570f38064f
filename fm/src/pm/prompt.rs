//! PM prompt composition
//!
//! Each decision point composes one prompt from labelled sections in a fixed
//! order, ending with the instructions block that stipulates the decision
//! envelope and enumerates every action's JSON shape.

use std::time::Duration;

use crate::domain::{AgentCatalog, AgentMessage, TaskStatus};
use crate::graph::TaskGraph;

/// System prompt for the PM model itself
pub const PM_SYSTEM_PROMPT: &str = "You are the Project Manager of a team of AI agents working on a \
software-engineering request. You are called at each decision point with the current task graph and \
recent events; you reply with exactly one decision envelope.";

/// The closing instructions block, quoted verbatim in every PM prompt
const INSTRUCTIONS: &str = r#"## Instructions

Before deciding, consult any tools available to you: search the project history and read past step
outputs. Consider work already completed in prior runs instead of re-planning it.

Reply with exactly one decision envelope:

[PM_DECISION] {"reasoning": "<why>", "actions": [<action>, ...]} [/PM_DECISION]

Actions are applied in order. The shapes are:

- {"type": "execute", "task_ids": ["t1", ...]} — launch ready tasks (parallelism is capped; extras stay ready)
- {"type": "add_tasks", "tasks": [{"id": "t9"?, "title": "...", "description": "...", "acceptance": ["..."],
   "dependsOn": ["t1"], "agent": "coder", "role": "backend"?, "provider": "..."?, "model": "..."?, "skills": ["..."]?}]}
- {"type": "remove_tasks", "task_ids": ["t1"], "reason": "..."}
- {"type": "reassign", "task_id": "t1", "agent": "reviewer", "role": "verifier"?, "reason": "..."}
- {"type": "retry", "task_id": "t1", "changes": {"description": "..."?, "agent": "..."?, "role": "..."?}?}
- {"type": "ask_user", "question": "...", "context": "..."?, "blocking_task_ids": ["t1"]?}
- {"type": "answer_agent", "task_id": "t1", "answer": "..."}
- {"type": "complete", "summary": "..."} — only when the request is fulfilled
- {"type": "skip", "task_ids": ["t1"], "reason": "..."}
"#;

/// Budget figures shown to the PM
#[derive(Debug, Clone, Copy)]
pub struct BudgetView {
    pub spent: f64,
    pub limit: f64,
}

impl BudgetView {
    pub fn remaining(&self) -> f64 {
        (self.limit - self.spent).max(0.0)
    }
}

/// Everything the PM sees at one decision point
pub struct DecisionContext<'a> {
    pub graph: &'a TaskGraph,
    pub running: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub ready: Vec<String>,
    pub budget: BudgetView,
    pub messages_to_pm: &'a [AgentMessage],
    pub recent_messages: &'a [AgentMessage],
    pub user_messages: &'a [String],
    pub elapsed: Duration,
    pub catalog: &'a AgentCatalog,
}

/// Truncate to a character budget, marking the cut
fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{}…", head)
    }
}

/// One compact line per task for the graph table
fn render_task_line(graph: &TaskGraph, id: &str) -> String {
    let Some(node) = graph.get(id) else {
        return format!("{} [?]", id);
    };

    let mut line = format!("{} [{}] {} {}", node.id, node.status, node.agent_label(), node.title);
    if !node.depends_on.is_empty() {
        line.push_str(&format!(" (depends: {})", node.depends_on.join(", ")));
    }
    match node.status {
        TaskStatus::Done => {
            if let Some(output) = &node.output {
                line.push_str(&format!(" — {}", truncate(output, 120)));
            }
        }
        TaskStatus::Failed => {
            if let Some(error) = &node.error {
                line.push_str(&format!(" — error: {}", truncate(error, 120)));
            }
        }
        _ => {}
    }
    line
}

fn push_section(out: &mut String, label: &str, body: &str) {
    out.push_str("## ");
    out.push_str(label);
    out.push('\n');
    if body.is_empty() {
        out.push_str("(none)\n");
    } else {
        out.push_str(body);
        if !body.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push('\n');
}

/// Compose the full PM prompt for one decision
pub fn compose_prompt(trigger: &str, ctx: &DecisionContext) -> String {
    let mut out = String::with_capacity(4096);

    push_section(&mut out, "Trigger", trigger);

    let graph_table: String = ctx
        .graph
        .tasks()
        .map(|n| render_task_line(ctx.graph, &n.id))
        .collect::<Vec<_>>()
        .join("\n");
    push_section(&mut out, "Task Graph", &graph_table);

    push_section(&mut out, "Currently Running", &ctx.running.join(", "));

    let completed: String = ctx
        .completed
        .iter()
        .filter_map(|id| ctx.graph.get(id))
        .map(|n| format!("{} (${:.4})", n.id, n.cost_usd))
        .collect::<Vec<_>>()
        .join(", ");
    push_section(&mut out, "Completed Tasks", &completed);

    let failed: String = ctx
        .failed
        .iter()
        .filter_map(|id| ctx.graph.get(id))
        .map(|n| format!("{} ({} attempts)", n.id, n.attempts))
        .collect::<Vec<_>>()
        .join(", ");
    push_section(&mut out, "Failed Tasks", &failed);

    push_section(&mut out, "Ready Tasks", &ctx.ready.join(", "));

    let to_pm: String = ctx
        .messages_to_pm
        .iter()
        .map(AgentMessage::render)
        .collect::<Vec<_>>()
        .join("\n");
    push_section(&mut out, "Messages From Your Team", &to_pm);

    let recent: String = ctx
        .recent_messages
        .iter()
        .map(AgentMessage::render)
        .collect::<Vec<_>>()
        .join("\n");
    push_section(&mut out, "Inter-Team Communication", &recent);

    let user: String = ctx
        .user_messages
        .iter()
        .map(|m| format!("- {}", m))
        .collect::<Vec<_>>()
        .join("\n");
    push_section(&mut out, "User Messages", &user);

    push_section(
        &mut out,
        "Budget",
        &format!(
            "spent ${:.2} of ${:.2} (${:.2} remaining)",
            ctx.budget.spent,
            ctx.budget.limit,
            ctx.budget.remaining()
        ),
    );

    push_section(&mut out, "Available Agents", &ctx.catalog.render_for_prompt());

    let minutes = ctx.elapsed.as_secs() / 60;
    let seconds = ctx.elapsed.as_secs() % 60;
    push_section(&mut out, "Elapsed Time", &format!("{}m {}s", minutes, seconds));

    out.push_str(INSTRUCTIONS);
    out
}
