//! Inter-agent messages
//!
//! Agents embed `[AGENT_MESSAGE]{json}[/AGENT_MESSAGE]` blocks in their
//! output; the router extracts them into these types.

use serde::{Deserialize, Serialize};

/// Kind of inter-agent message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Question,
    Flag,
    Suggestion,
    Handoff,
    Response,
    Challenge,
    Counter,
    Concede,
    Escalate,
    Moderate,
}

impl MessageKind {
    /// Message kinds that participate in a debate exchange
    pub fn is_debate(&self) -> bool {
        matches!(
            self,
            Self::Challenge | Self::Counter | Self::Concede | Self::Escalate | Self::Moderate
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Question => "question",
            Self::Flag => "flag",
            Self::Suggestion => "suggestion",
            Self::Handoff => "handoff",
            Self::Response => "response",
            Self::Challenge => "challenge",
            Self::Counter => "counter",
            Self::Concede => "concede",
            Self::Escalate => "escalate",
            Self::Moderate => "moderate",
        };
        write!(f, "{}", s)
    }
}

/// A message between agents (or to the PM)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Sending agent type
    pub from: String,

    /// Receiving agent type, or `pm`
    pub to: String,

    pub kind: MessageKind,

    pub content: String,

    /// Task the sender was working on
    pub task_id: String,
}

impl AgentMessage {
    /// Whether this message is addressed to the PM
    pub fn is_for_pm(&self) -> bool {
        self.to.eq_ignore_ascii_case("pm")
    }

    /// One-line rendering used in PM prompt sections
    pub fn render(&self) -> String {
        format!("[{}] {} -> {}: {}", self.kind, self.from, self.to, self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serde() {
        let kind: MessageKind = serde_json::from_str("\"handoff\"").unwrap();
        assert_eq!(kind, MessageKind::Handoff);
        assert_eq!(serde_json::to_string(&MessageKind::Escalate).unwrap(), "\"escalate\"");
    }

    #[test]
    fn test_is_debate() {
        assert!(MessageKind::Challenge.is_debate());
        assert!(MessageKind::Concede.is_debate());
        assert!(!MessageKind::Question.is_debate());
        assert!(!MessageKind::Handoff.is_debate());
    }

    #[test]
    fn test_is_for_pm() {
        let msg = AgentMessage {
            from: "coder".to_string(),
            to: "PM".to_string(),
            kind: MessageKind::Question,
            content: "which database?".to_string(),
            task_id: "t1".to_string(),
        };
        assert!(msg.is_for_pm());
    }

    #[test]
    fn test_render() {
        let msg = AgentMessage {
            from: "coder".to_string(),
            to: "tester".to_string(),
            kind: MessageKind::Handoff,
            content: "API is ready".to_string(),
            task_id: "t2".to_string(),
        };
        assert_eq!(msg.render(), "[handoff] coder -> tester: API is ready");
    }
}
