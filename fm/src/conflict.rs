//! Opinion and conflict detection
//!
//! Post-task processing skims agent output for opinion-like phrases (fed to
//! the personality memory store) and watches the recent message window for
//! challenge/counter exchanges. The stores themselves are external; they
//! are reached through the fire-and-forget [`MemorySink`] hooks and a
//! failure there never stops the pipeline.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::domain::{AgentMessage, MessageKind};

static OPINION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(i (strongly )?(think|believe|prefer|recommend|disagree|doubt)|we should(n't| not)?|in my opinion|my concern is)\b",
    )
    .expect("opinion regex")
});

/// Sentences in the output that read like opinions
pub fn extract_opinions(output: &str) -> Vec<String> {
    output
        .split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty() && OPINION.is_match(sentence))
        .map(str::to_string)
        .collect()
}

/// An open disagreement between two agents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub between: (String, String),
    pub exchanges: usize,
}

/// Find agent pairs with a live challenge/counter exchange in the window.
/// A pair is in conflict once each side has sent the other a debate message
/// and neither has conceded.
pub fn detect_conflicts(messages: &[AgentMessage]) -> Vec<Conflict> {
    let mut conflicts: Vec<Conflict> = Vec::new();

    for msg in messages.iter().filter(|m| m.kind.is_debate()) {
        if msg.kind == MessageKind::Concede {
            conflicts.retain(|c| c.between != pair_key(&msg.from, &msg.to));
            continue;
        }

        let reply_exists = messages.iter().any(|other| {
            other.kind.is_debate() && other.from == msg.to && other.to == msg.from
        });
        if !reply_exists {
            continue;
        }

        let key = pair_key(&msg.from, &msg.to);
        match conflicts.iter_mut().find(|c| c.between == key) {
            Some(conflict) => conflict.exchanges += 1,
            None => conflicts.push(Conflict {
                between: key,
                exchanges: 1,
            }),
        }
    }

    conflicts
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Fire-and-forget hooks into the external memory stores
#[async_trait]
pub trait MemorySink: Send + Sync {
    /// Ingest a completed-step event into the project memory store
    async fn ingest_event(&self, run_id: &str, agent: &str, task_id: &str, summary: &str);

    /// Ingest an opinion-like phrase into the personality store
    async fn ingest_opinion(&self, agent: &str, phrase: &str);

    /// Update the relationship score between two agents
    async fn update_relationship(&self, from: &str, to: &str, kind: MessageKind);

    /// Evaluate a detected debate exchange (delegated; default no-op)
    async fn evaluate_debate(&self, _run_id: &str, _conflict: &Conflict) {}
}

/// Default sink: everything is discarded
pub struct NoopSink;

#[async_trait]
impl MemorySink for NoopSink {
    async fn ingest_event(&self, _run_id: &str, _agent: &str, _task_id: &str, _summary: &str) {}
    async fn ingest_opinion(&self, _agent: &str, _phrase: &str) {}
    async fn update_relationship(&self, _from: &str, _to: &str, _kind: MessageKind) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_opinions() {
        let output = "I ran the tests. I think we should use postgres here. \
                      The build passed! In my opinion the cache is premature. Plain statement.";
        let opinions = extract_opinions(output);
        assert_eq!(opinions.len(), 2);
        assert!(opinions[0].contains("postgres"));
        assert!(opinions[1].contains("cache"));
    }

    #[test]
    fn test_extract_opinions_none() {
        assert!(extract_opinions("Ran 42 tests. All passed.").is_empty());
    }

    fn msg(from: &str, to: &str, kind: MessageKind) -> AgentMessage {
        AgentMessage {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            content: "c".to_string(),
            task_id: "t1".to_string(),
        }
    }

    #[test]
    fn test_detect_conflict_requires_both_sides() {
        // One-sided challenge: no conflict yet
        let messages = vec![msg("coder", "reviewer", MessageKind::Challenge)];
        assert!(detect_conflicts(&messages).is_empty());

        // Counter comes back: conflict
        let messages = vec![
            msg("coder", "reviewer", MessageKind::Challenge),
            msg("reviewer", "coder", MessageKind::Counter),
        ];
        let conflicts = detect_conflicts(&messages);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].between, ("coder".to_string(), "reviewer".to_string()));
    }

    #[test]
    fn test_concede_clears_conflict() {
        let messages = vec![
            msg("coder", "reviewer", MessageKind::Challenge),
            msg("reviewer", "coder", MessageKind::Counter),
            msg("coder", "reviewer", MessageKind::Concede),
        ];
        assert!(detect_conflicts(&messages).is_empty());
    }

    #[test]
    fn test_non_debate_messages_ignored() {
        let messages = vec![
            msg("coder", "reviewer", MessageKind::Handoff),
            msg("reviewer", "coder", MessageKind::Response),
        ];
        assert!(detect_conflicts(&messages).is_empty());
    }
}
