//! Anthropic Messages API adapter
//!
//! Prompt-only: one request with system prompt, user prompt, and a token
//! cap. No tools, no filesystem; agents that need those resolve to the CLI
//! adapter instead.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{Availability, Capabilities, ExecutionContext, ExecutionResult, Pricing, ProviderAdapter, TokenUsage};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 8192;

const MODELS: &[&str] = &["claude-sonnet-4", "claude-opus-4", "claude-haiku-4"];

/// Anthropic Messages API as a prompt-only provider
pub struct AnthropicAdapter {
    api_key: Option<String>,
    base_url: String,
    http: Client,
}

impl AnthropicAdapter {
    pub fn new(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.into(),
            http: Client::new(),
        }
    }

    /// Key from `ANTHROPIC_API_KEY`, base URL from `ANTHROPIC_BASE_URL`
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("ANTHROPIC_API_KEY").ok(),
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        )
    }

    fn build_request_body(&self, ctx: &ExecutionContext) -> serde_json::Value {
        serde_json::json!({
            "model": ctx.model,
            "max_tokens": ctx.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "system": ctx.system_prompt,
            "messages": [{ "role": "user", "content": ctx.prompt }],
        })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &'static str {
        "anthropic"
    }

    fn name(&self) -> &'static str {
        "Anthropic API"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::prompt_only()
    }

    fn models(&self) -> &[&'static str] {
        MODELS
    }

    fn pricing(&self, model: &str) -> Pricing {
        match model {
            "claude-opus-4" => Pricing::per_1m(15.0, 75.0),
            "claude-sonnet-4" => Pricing::per_1m(3.0, 15.0),
            "claude-haiku-4" => Pricing::per_1m(0.8, 4.0),
            _ => Pricing::per_1m(3.0, 15.0),
        }
    }

    async fn detect(&self) -> Availability {
        match &self.api_key {
            Some(_) => Availability::up(),
            None => Availability::down("ANTHROPIC_API_KEY not set"),
        }
    }

    async fn execute(&self, ctx: &ExecutionContext) -> ExecutionResult {
        let start = Instant::now();

        let Some(api_key) = &self.api_key else {
            return ExecutionResult::failed("ANTHROPIC_API_KEY not set: api key missing", 0);
        };

        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .timeout(ctx.timeout.min(Duration::from_secs(600)))
            .json(&self.build_request_body(ctx))
            .send()
            .await;

        let duration_ms = start.elapsed().as_millis() as u64;

        let response = match response {
            Ok(r) => r,
            Err(e) => return ExecutionResult::failed(format!("fetch failed: {}", e), duration_ms),
        };

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("60");
            return ExecutionResult::failed(
                format!("HTTP 429 rate limited, retry-after {}s", retry_after),
                duration_ms,
            );
        }
        if status >= 400 {
            let text = response.text().await.unwrap_or_default();
            return ExecutionResult::failed(format!("HTTP {}: {}", status, text), duration_ms);
        }

        let api_response: ApiResponse = match response.json().await {
            Ok(r) => r,
            Err(e) => return ExecutionResult::failed(format!("invalid response body: {}", e), duration_ms),
        };

        let output: String = api_response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
            })
            .collect::<Vec<_>>()
            .join("\n");

        if let Some(log) = &ctx.log {
            for line in output.lines().filter(|l| !l.trim().is_empty()) {
                log.append(line);
            }
        }

        ExecutionResult::ok(
            output,
            start.elapsed().as_millis() as u64,
            Some(TokenUsage {
                input_tokens: api_response.usage.input_tokens
                    + api_response.usage.cache_read_input_tokens.unwrap_or(0)
                    + api_response.usage.cache_creation_input_tokens.unwrap_or(0),
                output_tokens: api_response.usage.output_tokens,
            }),
        )
    }
}

// Messages API response types

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
    cache_read_input_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
}
