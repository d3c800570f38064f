//! Inter-agent message router
//!
//! Agents embed `[AGENT_MESSAGE]{"to":"...","type":"...","message":"..."}`
//! `[/AGENT_MESSAGE]` blocks in their output. The router extracts and
//! validates them, strips the blocks from the output, and accumulates
//! messages for the next PM cycle: those addressed to `pm` in one bucket,
//! everything else in a recent-messages window. Accumulators are
//! take-and-clear to avoid double delivery.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::domain::{AgentMessage, MessageKind};

static MESSAGE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[AGENT_MESSAGE\](.*?)\[/AGENT_MESSAGE\]").expect("message block regex"));

/// How many non-PM messages the awareness window keeps
const RECENT_WINDOW: usize = 20;

#[derive(Debug, Deserialize)]
struct RawMessage {
    to: String,
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// Extract valid message blocks and return the output with every block
/// stripped. Invalid blocks (bad JSON, unknown type, empty fields) are
/// stripped too, but produce no message.
pub fn extract_messages(output: &str, from: &str, task_id: &str) -> (Vec<AgentMessage>, String) {
    let mut messages = Vec::new();

    for captures in MESSAGE_BLOCK.captures_iter(output) {
        let inner = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        let raw: RawMessage = match serde_json::from_str(inner) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "Dropping unparseable agent message block");
                continue;
            }
        };

        let kind: MessageKind = match serde_json::from_value(serde_json::Value::String(raw.kind.clone())) {
            Ok(kind) => kind,
            Err(_) => {
                debug!(kind = %raw.kind, "Dropping agent message with unknown type");
                continue;
            }
        };

        if raw.to.trim().is_empty() || raw.message.trim().is_empty() {
            debug!("Dropping agent message with empty to/message");
            continue;
        }

        messages.push(AgentMessage {
            from: from.to_string(),
            to: raw.to,
            kind,
            content: raw.message,
            task_id: task_id.to_string(),
        });
    }

    let stripped = MESSAGE_BLOCK.replace_all(output, "").to_string();
    (messages, stripped)
}

/// Per-cycle message accumulators
#[derive(Debug, Default)]
pub struct MessageRouter {
    to_pm: Vec<AgentMessage>,
    recent: Vec<AgentMessage>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one extracted message into the right accumulator
    pub fn route(&mut self, message: AgentMessage) {
        if message.is_for_pm() {
            self.to_pm.push(message);
        } else {
            self.recent.push(message);
            if self.recent.len() > RECENT_WINDOW {
                self.recent.remove(0);
            }
        }
    }

    pub fn pm_messages(&self) -> &[AgentMessage] {
        &self.to_pm
    }

    pub fn recent_messages(&self) -> &[AgentMessage] {
        &self.recent
    }

    /// Whether anything is waiting for the PM
    pub fn has_pm_messages(&self) -> bool {
        !self.to_pm.is_empty()
    }

    /// Take and clear both accumulators (consumed per decision cycle)
    pub fn take(&mut self) -> (Vec<AgentMessage>, Vec<AgentMessage>) {
        (std::mem::take(&mut self.to_pm), std::mem::take(&mut self.recent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_single_message() {
        let output = r#"I finished the work.
[AGENT_MESSAGE]{"to": "tester", "type": "handoff", "message": "API ready on port 8080"}[/AGENT_MESSAGE]
All done."#;

        let (messages, stripped) = extract_messages(output, "coder", "t1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from, "coder");
        assert_eq!(messages[0].to, "tester");
        assert_eq!(messages[0].kind, MessageKind::Handoff);
        assert_eq!(messages[0].task_id, "t1");
        assert!(!stripped.contains("AGENT_MESSAGE"));
        assert!(stripped.contains("I finished the work."));
        assert!(stripped.contains("All done."));
    }

    #[test]
    fn test_extract_multiple_blocks() {
        let output = r#"[AGENT_MESSAGE]{"to":"pm","type":"question","message":"use redis?"}[/AGENT_MESSAGE]
between
[AGENT_MESSAGE]{"to":"reviewer","type":"flag","message":"check auth"}[/AGENT_MESSAGE]"#;

        let (messages, stripped) = extract_messages(output, "coder", "t2");
        assert_eq!(messages.len(), 2);
        assert_eq!(stripped.trim(), "between");
    }

    #[test]
    fn test_strip_reconstruction_law() {
        let before = "prefix ";
        let block = r#"[AGENT_MESSAGE]{"to":"pm","type":"flag","message":"watch out"}[/AGENT_MESSAGE]"#;
        let after = " suffix";
        let output = format!("{}{}{}", before, block, after);

        let (messages, stripped) = extract_messages(&output, "coder", "t1");
        // Non-envelope text is untouched
        assert_eq!(stripped, format!("{}{}", before, after));
        assert_eq!(messages[0].content, "watch out");
    }

    #[test]
    fn test_invalid_blocks_stripped_but_dropped() {
        let output = r#"[AGENT_MESSAGE]{not json}[/AGENT_MESSAGE]
[AGENT_MESSAGE]{"to":"x","type":"unknown_kind","message":"m"}[/AGENT_MESSAGE]
[AGENT_MESSAGE]{"to":"","type":"flag","message":"m"}[/AGENT_MESSAGE]
[AGENT_MESSAGE]{"to":"pm","type":"flag","message":""}[/AGENT_MESSAGE]
text survives"#;

        let (messages, stripped) = extract_messages(output, "coder", "t1");
        assert!(messages.is_empty());
        assert!(!stripped.contains("AGENT_MESSAGE"));
        assert!(stripped.contains("text survives"));
    }

    #[test]
    fn test_all_kinds_accepted() {
        for kind in [
            "question", "flag", "suggestion", "handoff", "response", "challenge", "counter", "concede", "escalate",
            "moderate",
        ] {
            let output = format!(
                r#"[AGENT_MESSAGE]{{"to":"pm","type":"{}","message":"m"}}[/AGENT_MESSAGE]"#,
                kind
            );
            let (messages, _) = extract_messages(&output, "a", "t1");
            assert_eq!(messages.len(), 1, "kind {}", kind);
        }
    }

    #[test]
    fn test_router_buckets_and_take() {
        let mut router = MessageRouter::new();
        let msg = |to: &str| AgentMessage {
            from: "coder".to_string(),
            to: to.to_string(),
            kind: MessageKind::Flag,
            content: "c".to_string(),
            task_id: "t1".to_string(),
        };

        router.route(msg("pm"));
        router.route(msg("tester"));
        assert!(router.has_pm_messages());
        assert_eq!(router.pm_messages().len(), 1);
        assert_eq!(router.recent_messages().len(), 1);

        let (pm, recent) = router.take();
        assert_eq!(pm.len(), 1);
        assert_eq!(recent.len(), 1);
        assert!(!router.has_pm_messages());
        assert!(router.recent_messages().is_empty());
    }

    #[test]
    fn test_recent_window_caps() {
        let mut router = MessageRouter::new();
        for i in 0..30 {
            router.route(AgentMessage {
                from: "a".to_string(),
                to: "b".to_string(),
                kind: MessageKind::Flag,
                content: format!("m{}", i),
                task_id: "t1".to_string(),
            });
        }
        assert_eq!(router.recent_messages().len(), RECENT_WINDOW);
        // Oldest dropped first
        assert_eq!(router.recent_messages()[0].content, "m10");
    }
}
