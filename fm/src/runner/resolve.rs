//! Provider/model resolution
//!
//! Resolution chain, highest priority first: project-settings override per
//! agent or `agent:role` → PM hint on the task → role metadata → agent
//! metadata → configured default. Capability-aware fallback: a provider can
//! stand in for an agent only if it exposes both file access and tool use,
//! or the agent declares no full-capability tags.

use std::sync::Arc;

use tracing::debug;

use crate::domain::{AgentDefinition, TaskNode};
use crate::persist::ProjectSettings;
use crate::providers::{ProviderAdapter, ProviderRegistry};

/// The outcome of provider/model resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub provider_id: String,
    pub model: Option<String>,
}

fn override_key(node: &TaskNode) -> Vec<String> {
    // role-specific override wins over the agent-wide one
    let mut keys = Vec::with_capacity(2);
    if let Some(role) = &node.role {
        keys.push(format!("{}:{}", node.agent, role));
    }
    keys.push(node.agent.clone());
    keys
}

/// Resolve the provider and model for a task assignment
pub fn resolve(
    node: &TaskNode,
    agent: Option<&AgentDefinition>,
    project: Option<&ProjectSettings>,
    default_provider: &str,
) -> Resolution {
    let role = node.role.as_deref().and_then(|r| agent.and_then(|a| a.role(r)));

    let provider_id = project
        .and_then(|p| {
            override_key(node)
                .into_iter()
                .find_map(|key| p.provider_overrides.get(&key).cloned())
        })
        .or_else(|| node.provider_hint.clone())
        .or_else(|| role.and_then(|r| r.provider.clone()))
        .or_else(|| agent.and_then(|a| a.provider.clone()))
        .unwrap_or_else(|| default_provider.to_string());

    let model = project
        .and_then(|p| {
            override_key(node)
                .into_iter()
                .find_map(|key| p.model_overrides.get(&key).cloned())
        })
        .or_else(|| node.model_hint.clone())
        .or_else(|| role.and_then(|r| r.model.clone()))
        .or_else(|| agent.and_then(|a| a.model.clone()));

    debug!(task = %node.id, provider = %provider_id, ?model, "Resolved provider");
    Resolution { provider_id, model }
}

/// Whether an adapter may serve as a fallback for the agent
pub fn acceptable_for(agent: Option<&AgentDefinition>, adapter: &dyn ProviderAdapter) -> bool {
    let caps = adapter.capabilities();
    if caps.file_access && caps.tool_use {
        return true;
    }
    // Prompt-only adapters are fine for agents without full-capability tags
    agent.map(|a| !a.needs_full_capabilities()).unwrap_or(true)
}

/// First available adapter, other than `exclude`, acceptable to the agent
pub async fn fallback_provider(
    registry: &ProviderRegistry,
    agent: Option<&AgentDefinition>,
    exclude: &str,
) -> Option<Arc<dyn ProviderAdapter>> {
    for adapter in registry.available_adapters().await {
        if adapter.id() != exclude && acceptable_for(agent, adapter.as_ref()) {
            return Some(adapter);
        }
    }
    None
}

/// Default model for an adapter when resolution produced none
pub fn default_model(adapter: &dyn ProviderAdapter) -> String {
    adapter.models().first().map(|m| m.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentCatalog, TaskSpec, TaskStatus};

    fn node(agent: &str, role: Option<&str>) -> TaskNode {
        TaskNode::from_spec(
            "t1".to_string(),
            TaskSpec {
                id: Some("t1".to_string()),
                title: "t".to_string(),
                description: String::new(),
                acceptance: vec![],
                depends_on: vec![],
                agent: agent.to_string(),
                role: role.map(str::to_string),
                provider: None,
                model: None,
                skills: vec![],
            },
            TaskStatus::Ready,
            0,
        )
    }

    #[test]
    fn test_default_when_nothing_declared() {
        let resolution = resolve(&node("ghost", None), None, None, "claude-cli");
        assert_eq!(resolution.provider_id, "claude-cli");
        assert!(resolution.model.is_none());
    }

    #[test]
    fn test_agent_metadata_over_default() {
        let catalog = AgentCatalog::builtin().unwrap();
        let researcher = catalog.get("researcher");
        let resolution = resolve(&node("researcher", None), researcher, None, "claude-cli");
        assert_eq!(resolution.provider_id, "anthropic");
    }

    #[test]
    fn test_task_hint_over_agent_metadata() {
        let catalog = AgentCatalog::builtin().unwrap();
        let mut task = node("researcher", None);
        task.provider_hint = Some("copilot".to_string());
        task.model_hint = Some("gpt-4o".to_string());

        let resolution = resolve(&task, catalog.get("researcher"), None, "claude-cli");
        assert_eq!(resolution.provider_id, "copilot");
        assert_eq!(resolution.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_project_override_wins() {
        let catalog = AgentCatalog::builtin().unwrap();
        let mut task = node("researcher", None);
        task.provider_hint = Some("copilot".to_string());

        let mut project = ProjectSettings::default();
        project
            .provider_overrides
            .insert("researcher".to_string(), "claude-cli".to_string());

        let resolution = resolve(&task, catalog.get("researcher"), Some(&project), "anthropic");
        assert_eq!(resolution.provider_id, "claude-cli");
    }

    #[test]
    fn test_role_specific_override_beats_agent_override() {
        let mut project = ProjectSettings::default();
        project
            .provider_overrides
            .insert("coder".to_string(), "anthropic".to_string());
        project
            .provider_overrides
            .insert("coder:backend".to_string(), "copilot".to_string());

        let resolution = resolve(&node("coder", Some("backend")), None, Some(&project), "claude-cli");
        assert_eq!(resolution.provider_id, "copilot");

        let resolution = resolve(&node("coder", Some("frontend")), None, Some(&project), "claude-cli");
        assert_eq!(resolution.provider_id, "anthropic");
    }

    #[test]
    fn test_acceptable_for() {
        use crate::providers::Capabilities;
        use crate::providers::testing::MockAdapter;

        let catalog = AgentCatalog::builtin().unwrap();
        let full = MockAdapter::new("full", Capabilities::full(), vec![]);
        let prompt_only = MockAdapter::new("po", Capabilities::prompt_only(), vec![]);

        // coder needs file access: only the full adapter qualifies
        assert!(acceptable_for(catalog.get("coder"), &full));
        assert!(!acceptable_for(catalog.get("coder"), &prompt_only));

        // researcher declares no full-capability tags: both qualify
        assert!(acceptable_for(catalog.get("researcher"), &full));
        assert!(acceptable_for(catalog.get("researcher"), &prompt_only));
    }
}
