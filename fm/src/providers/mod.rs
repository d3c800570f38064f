//! Provider adapter layer
//!
//! A uniform execution contract over heterogeneous backends: a subprocess
//! CLI emitting line-delimited JSON, and prompt-only HTTP APIs. Adapters
//! declare capabilities and models; the registry resolves ids and models and
//! caches availability.

pub mod accounts;
pub mod anthropic;
pub mod claude_cli;
pub mod classify;
pub mod copilot;
mod registry;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gates::{AbortFlag, LiveLog};

pub use anthropic::AnthropicAdapter;
pub use claude_cli::ClaudeCliAdapter;
pub use classify::{ErrorKind, classify};
pub use copilot::CopilotAdapter;
pub use registry::{ProviderRegistry, global_registry};

/// Capability flags declared by an adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(rename = "fileAccess")]
    pub file_access: bool,
    #[serde(rename = "shellAccess")]
    pub shell_access: bool,
    #[serde(rename = "toolUse")]
    pub tool_use: bool,
    #[serde(rename = "subAgents")]
    pub sub_agents: bool,
}

impl Capabilities {
    /// Full capability set: filesystem, shell, tools, sub-agents
    pub fn full() -> Self {
        Self {
            file_access: true,
            shell_access: true,
            tool_use: true,
            sub_agents: true,
        }
    }

    /// Prompt-only: no filesystem, no tools
    pub fn prompt_only() -> Self {
        Self::default()
    }
}

/// Result of an availability probe
#[derive(Debug, Clone)]
pub struct Availability {
    pub available: bool,
    pub reason: Option<String>,
}

impl Availability {
    pub fn up() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn down(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// Adapter description exposed to callers and the PM prompt
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub models: Vec<String>,
    pub capabilities: Capabilities,
}

/// Flat per-model pricing, USD per million tokens. CLI alias models price at
/// zero; ranking by cost alone is therefore degenerate and best-available
/// uses the tier table instead.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

impl Pricing {
    pub fn per_1m(input: f64, output: f64) -> Self {
        Self {
            input_per_1m: input,
            output_per_1m: output,
        }
    }

    /// Cost of a concrete usage at this pricing
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_1m + usage.output_tokens as f64 * self.output_per_1m) / 1_000_000.0
    }
}

/// Token usage reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(rename = "outputTokens")]
    pub output_tokens: u64,
}

/// Everything one execution needs
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub prompt: String,
    pub system_prompt: String,
    pub model: String,
    /// Working directory for file-access providers
    pub cwd: Option<PathBuf>,
    pub project_id: String,
    /// Session id for stateful conversations
    pub session_id: Option<String>,
    pub enable_tools: bool,
    pub timeout: Duration,
    pub max_output_tokens: Option<u32>,
    /// Stream target: adapters append human-readable lines here
    pub log: Option<LiveLog>,
    /// Cross-process abort signal, polled by subprocess adapters
    pub abort: Option<AbortFlag>,
}

impl ExecutionContext {
    /// Minimal context for a prompt-only call
    pub fn prompt_only(prompt: impl Into<String>, system_prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: system_prompt.into(),
            model: model.into(),
            cwd: None,
            project_id: String::new(),
            session_id: None,
            enable_tools: false,
            timeout: Duration::from_secs(300),
            max_output_tokens: None,
            log: None,
            abort: None,
        }
    }

    fn log_line(&self, line: &str) {
        if let Some(log) = &self.log {
            log.append(line);
        }
    }
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
    pub usage: Option<TokenUsage>,
}

impl ExecutionResult {
    pub fn ok(output: impl Into<String>, duration_ms: u64, usage: Option<TokenUsage>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            error_kind: None,
            duration_ms,
            usage,
        }
    }

    /// Build a failure result, classifying the error text
    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        let error = error.into();
        let error_kind = Some(classify(&error));
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
            error_kind,
            duration_ms,
            usage: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.error_kind, Some(ErrorKind::Transient))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self.error_kind, Some(ErrorKind::Permanent))
    }
}

/// The uniform adapter contract
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Supported model ids; drives auto-resolution by model name
    fn models(&self) -> &[&'static str];

    /// Flat pricing for a model
    fn pricing(&self, model: &str) -> Pricing;

    /// Probe whether the backend is usable right now
    async fn detect(&self) -> Availability;

    /// Run one prompt against one model
    async fn execute(&self, ctx: &ExecutionContext) -> ExecutionResult;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scriptable adapter for runner and engine tests

    use std::sync::Mutex;

    use super::*;

    /// Adapter that replays a scripted list of results
    pub struct MockAdapter {
        pub mock_id: &'static str,
        pub caps: Capabilities,
        pub results: Mutex<Vec<ExecutionResult>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockAdapter {
        pub fn new(mock_id: &'static str, caps: Capabilities, results: Vec<ExecutionResult>) -> Self {
            Self {
                mock_id,
                caps,
                results: Mutex::new(results),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockAdapter {
        fn id(&self) -> &'static str {
            self.mock_id
        }

        fn name(&self) -> &'static str {
            "Mock"
        }

        fn capabilities(&self) -> Capabilities {
            self.caps
        }

        fn models(&self) -> &[&'static str] {
            &["mock-model"]
        }

        fn pricing(&self, _model: &str) -> Pricing {
            Pricing::per_1m(1.0, 2.0)
        }

        async fn detect(&self) -> Availability {
            Availability::up()
        }

        async fn execute(&self, ctx: &ExecutionContext) -> ExecutionResult {
            self.calls.lock().unwrap().push(ctx.prompt.clone());
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                ExecutionResult::ok("mock output", 1, None)
            } else {
                results.remove(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pricing_cost() {
        let pricing = Pricing::per_1m(3.0, 15.0);
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 200_000,
        };
        assert!((pricing.cost(&usage) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_result_classifies() {
        let result = ExecutionResult::failed("HTTP 429 rate limit", 10);
        assert!(result.is_transient());

        let result = ExecutionResult::failed("401 unauthorized", 10);
        assert!(result.is_permanent());
    }

    #[test]
    fn test_capability_presets() {
        assert!(Capabilities::full().file_access);
        assert!(Capabilities::full().tool_use);
        assert!(!Capabilities::prompt_only().file_access);
    }
}
