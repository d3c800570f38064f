//! PM output parsing
//!
//! Strict envelope first: `[PM_DECISION] <json> [/PM_DECISION]`. When the
//! model deviates, a looser heuristic strips Markdown code fences and takes
//! the first balanced `{…}` or `[…]` from the reply.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::decision::{PmAction, PmDecision};

static ENVELOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[PM_DECISION\](.*?)\[/PM_DECISION\]").expect("envelope regex"));

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[a-zA-Z]*\n?|```").expect("code fence regex"));

/// Parse a PM reply into a decision, tolerantly
pub fn parse_decision(text: &str) -> Option<PmDecision> {
    if let Some(captures) = ENVELOPE.captures(text) {
        let inner = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        match serde_json::from_str::<PmDecision>(inner) {
            Ok(decision) => return Some(decision),
            Err(e) => debug!(error = %e, "Envelope present but JSON unparseable, trying loose extraction"),
        }
    }

    loose_extract(text)
}

/// The fallback path: defenced text, first balanced JSON value
fn loose_extract(text: &str) -> Option<PmDecision> {
    let stripped = CODE_FENCE.replace_all(text, "");
    let candidate = first_balanced(&stripped)?;

    if candidate.starts_with('{') {
        serde_json::from_str::<PmDecision>(candidate).ok()
    } else {
        // A bare array reads as an action list with no reasoning
        serde_json::from_str::<Vec<PmAction>>(candidate)
            .ok()
            .map(|actions| PmDecision {
                reasoning: String::new(),
                actions,
            })
    }
}

/// Find the first balanced `{…}` or `[…]`, respecting string literals
fn first_balanced(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_envelope() {
        let text = r#"Thinking about it.
[PM_DECISION] {"reasoning": "launch first task", "actions": [{"type": "execute", "task_ids": ["t1"]}]} [/PM_DECISION]"#;

        let decision = parse_decision(text).unwrap();
        assert_eq!(decision.reasoning, "launch first task");
        assert_eq!(decision.actions.len(), 1);
    }

    #[test]
    fn test_envelope_round_trip() {
        let decision = PmDecision {
            reasoning: "retry the flaky task".to_string(),
            actions: vec![
                PmAction::Retry {
                    task_id: "t2".to_string(),
                    changes: None,
                },
                PmAction::Execute {
                    task_ids: vec!["t3".to_string()],
                },
            ],
        };
        let parsed = parse_decision(&decision.render()).unwrap();
        assert_eq!(parsed, decision);
    }

    #[test]
    fn test_code_fence_fallback() {
        let text = r#"Here is my decision:
```json
{"reasoning": "all done", "actions": [{"type": "complete", "summary": "shipped"}]}
```"#;

        let decision = parse_decision(text).unwrap();
        assert_eq!(decision.reasoning, "all done");
        assert!(decision.completes());
    }

    #[test]
    fn test_bare_object_fallback() {
        let text = r#"I'll execute t1. {"reasoning": "go", "actions": [{"type": "execute", "task_ids": ["t1"]}]} Hope that helps!"#;
        let decision = parse_decision(text).unwrap();
        assert_eq!(decision.reasoning, "go");
    }

    #[test]
    fn test_bare_array_fallback() {
        let text = r#"[{"type": "skip", "task_ids": ["t4"], "reason": "obsolete"}]"#;
        let decision = parse_decision(text).unwrap();
        assert!(decision.reasoning.is_empty());
        assert_eq!(decision.actions.len(), 1);
    }

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"{"reasoning": "handle {braces} and \"quotes\"", "actions": []}"#;
        let decision = parse_decision(text).unwrap();
        assert!(decision.reasoning.contains("{braces}"));
    }

    #[test]
    fn test_garbage_returns_none() {
        assert!(parse_decision("no json here at all").is_none());
        assert!(parse_decision("{ unbalanced").is_none());
    }

    #[test]
    fn test_envelope_with_bad_json_falls_through() {
        // Broken envelope, but a good object later in the reply
        let text = r#"[PM_DECISION] {not json} [/PM_DECISION]
Actually: {"reasoning": "fixed", "actions": []}"#;
        let decision = parse_decision(text);
        // The loose pass finds the first balanced object, which is the broken
        // one; it fails to parse, so the reply reads as unparseable
        assert!(decision.is_none());

        let text = r#"[PM_DECISION] oops [/PM_DECISION] {"reasoning": "fixed", "actions": []}"#;
        let decision = parse_decision(text).unwrap();
        assert_eq!(decision.reasoning, "fixed");
    }
}
