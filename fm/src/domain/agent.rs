//! Agent definitions and the catalog
//!
//! Agent definitions live on disk as YAML; foreman consumes a fixed set of
//! fields (name, capabilities, provider/model defaults, roles) and ignores
//! the rest of the format. Definitions are loaded from:
//! 1. Builtin (embedded in binary)
//! 2. The configured agents directory
//!
//! Later definitions override earlier ones with the same name.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Capability tag: the agent needs a filesystem to work in
pub const CAP_FILE_ACCESS: &str = "file-access";

/// Capability tag: the agent needs to run shell commands
pub const CAP_SHELL_ACCESS: &str = "shell-access";

/// A role variant within an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRole {
    /// System prompt for this role
    #[serde(rename = "system-prompt", default)]
    pub system_prompt: String,

    /// Provider override for this role
    #[serde(default)]
    pub provider: Option<String>,

    /// Model override for this role
    #[serde(default)]
    pub model: Option<String>,

    /// Role receives the confirmed plan in its prompt
    #[serde(rename = "receives-plan-context", default)]
    pub receives_plan_context: bool,

    /// Role output ends with an explicit pass/fail verdict
    #[serde(rename = "produces-pass-fail", default)]
    pub produces_pass_fail: bool,

    /// Role evaluates another agent's output
    #[serde(rename = "evaluates-output", default)]
    pub evaluates_output: bool,
}

/// An agent definition as loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Display name
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Capability tags, e.g. `file-access`, `shell-access`
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Default provider id
    #[serde(default)]
    pub provider: Option<String>,

    /// Default model id
    #[serde(default)]
    pub model: Option<String>,

    /// Event-type label for event-log rows
    #[serde(rename = "event-type", default)]
    pub event_type: Option<String>,

    /// System prompt used when no role is selected
    #[serde(rename = "system-prompt", default)]
    pub system_prompt: String,

    /// Named role variants
    #[serde(default)]
    pub roles: HashMap<String, AgentRole>,
}

impl AgentDefinition {
    /// Whether the agent declares any full-capability tag
    pub fn needs_full_capabilities(&self) -> bool {
        self.capabilities
            .iter()
            .any(|c| c == CAP_FILE_ACCESS || c == CAP_SHELL_ACCESS)
    }

    /// Look up a role by name
    pub fn role(&self, name: &str) -> Option<&AgentRole> {
        self.roles.get(name)
    }

    /// System prompt for the given role, falling back to the agent's own
    pub fn system_prompt_for(&self, role: Option<&str>) -> &str {
        match role.and_then(|r| self.roles.get(r)) {
            Some(r) if !r.system_prompt.is_empty() => &r.system_prompt,
            _ => &self.system_prompt,
        }
    }
}

// Builtin agent definitions (embedded in binary)
const BUILTIN_CODER: &str = include_str!("builtin_agents/coder.yml");
const BUILTIN_REVIEWER: &str = include_str!("builtin_agents/reviewer.yml");
const BUILTIN_RESEARCHER: &str = include_str!("builtin_agents/researcher.yml");

/// The catalog of available agents
#[derive(Debug, Clone, Default)]
pub struct AgentCatalog {
    agents: HashMap<String, AgentDefinition>,
}

impl AgentCatalog {
    /// Load builtins plus any definitions in the given directory
    pub fn load(agents_dir: Option<&Path>) -> Result<Self> {
        let mut catalog = Self::builtin()?;

        if let Some(dir) = agents_dir {
            if dir.exists() {
                catalog.load_from_directory(dir)?;
            } else {
                debug!(?dir, "Agents directory does not exist, skipping");
            }
        }

        info!(count = catalog.agents.len(), "Loaded agent definitions");
        Ok(catalog)
    }

    /// Only the embedded builtin agents
    pub fn builtin() -> Result<Self> {
        let mut catalog = Self::default();
        for (name, yaml) in [
            ("coder", BUILTIN_CODER),
            ("reviewer", BUILTIN_REVIEWER),
            ("researcher", BUILTIN_RESEARCHER),
        ] {
            let def: AgentDefinition =
                serde_yaml::from_str(yaml).with_context(|| format!("Failed to parse builtin agent: {}", name))?;
            catalog.agents.insert(name.to_string(), def);
        }
        Ok(catalog)
    }

    /// Load all .yml files from a directory; the file stem is the agent type
    fn load_from_directory(&mut self, dir: &Path) -> Result<()> {
        for entry in walkdir::WalkDir::new(dir).max_depth(1).into_iter().flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match fs::read_to_string(path) {
                Ok(content) => match serde_yaml::from_str::<AgentDefinition>(&content) {
                    Ok(def) => {
                        debug!(agent = %stem, path = %path.display(), "Loaded agent definition");
                        self.agents.insert(stem.to_string(), def);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unparseable agent definition"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to read agent definition"),
            }
        }
        Ok(())
    }

    /// Look up an agent by type name
    pub fn get(&self, agent_type: &str) -> Option<&AgentDefinition> {
        self.agents.get(agent_type)
    }

    /// All agent type names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Render the available-agent section of the PM prompt
    pub fn render_for_prompt(&self) -> String {
        let mut out = String::new();
        for name in self.names() {
            let def = &self.agents[name];
            let mut roles: Vec<&str> = def.roles.keys().map(String::as_str).collect();
            roles.sort_unstable();
            if roles.is_empty() {
                out.push_str(&format!("- {} ({}): {}\n", def.name, name, def.description));
            } else {
                out.push_str(&format!(
                    "- {} ({}): {} [roles: {}]\n",
                    def.name,
                    name,
                    def.description,
                    roles.join(", ")
                ));
            }
        }
        out
    }
}
