//! GitHub Copilot chat adapter
//!
//! Prompt-only adapter over the Copilot chat-completions endpoint. Auth is a
//! pool of OAuth-backed accounts: the long-lived device grant mints a
//! short-lived bearer token, refreshed inside a buffer before expiry. On a
//! 429 the current account is parked on a cooldown and the request rotates
//! to the next account, up to a retry limit.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::accounts::AccountPool;
use super::{Availability, Capabilities, ExecutionContext, ExecutionResult, Pricing, ProviderAdapter, TokenUsage};

const DEFAULT_TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const DEFAULT_CHAT_URL: &str = "https://api.githubcopilot.com/chat/completions";

/// Mint a fresh bearer this long before the current one expires
const REFRESH_BUFFER: Duration = Duration::from_secs(120);

/// Cooldown for a rate-limited account
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(90);

/// How many accounts to try before giving up on a 429
const ACCOUNT_RETRY_LIMIT: usize = 3;

const MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini"];

/// Copilot chat as a prompt-only provider
pub struct CopilotAdapter {
    pool: AccountPool,
    token_url: String,
    chat_url: String,
    http: Client,
}

impl CopilotAdapter {
    pub fn new(pool: AccountPool) -> Self {
        Self {
            pool,
            token_url: DEFAULT_TOKEN_URL.to_string(),
            chat_url: DEFAULT_CHAT_URL.to_string(),
            http: Client::new(),
        }
    }

    /// Accounts from the file named by `FOREMAN_COPILOT_ACCOUNTS`
    pub fn from_env() -> Self {
        match std::env::var("FOREMAN_COPILOT_ACCOUNTS") {
            Ok(path) => Self::from_accounts_file(std::path::Path::new(&path)),
            Err(_) => Self::new(AccountPool::empty()),
        }
    }

    /// Accounts from an explicit file; an unreadable file yields an empty
    /// (unavailable) pool
    pub fn from_accounts_file(path: &std::path::Path) -> Self {
        let pool = AccountPool::load(path, RATE_LIMIT_COOLDOWN)
            .map_err(|e| warn!(error = %e, "Failed to load copilot accounts"))
            .unwrap_or_else(|_| AccountPool::empty());
        Self::new(pool)
    }

    /// Exchange the OAuth grant for a bearer token
    async fn mint_bearer(&self, account_id: &str, oauth_token: &str) -> Result<String, String> {
        let response = self
            .http
            .get(&self.token_url)
            .header("authorization", format!("token {}", oauth_token))
            .header("user-agent", "foreman")
            .send()
            .await
            .map_err(|e| format!("fetch failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("HTTP {} from token endpoint", response.status().as_u16()));
        }

        let token: TokenResponse = response.json().await.map_err(|e| format!("bad token body: {}", e))?;
        let expires_at = token.expires_at * 1000;
        self.pool.store_bearer(account_id, token.token.clone(), expires_at).await;
        debug!(account = %account_id, "Minted bearer token");
        Ok(token.token)
    }
}

#[async_trait]
impl ProviderAdapter for CopilotAdapter {
    fn id(&self) -> &'static str {
        "copilot"
    }

    fn name(&self) -> &'static str {
        "GitHub Copilot"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::prompt_only()
    }

    fn models(&self) -> &[&'static str] {
        MODELS
    }

    fn pricing(&self, _model: &str) -> Pricing {
        // Subscription-billed
        Pricing::default()
    }

    async fn detect(&self) -> Availability {
        if self.pool.is_empty().await {
            Availability::down("no copilot accounts configured")
        } else {
            Availability::up()
        }
    }

    async fn execute(&self, ctx: &ExecutionContext) -> ExecutionResult {
        let start = Instant::now();

        for attempt in 0..ACCOUNT_RETRY_LIMIT {
            let Some(account) = self.pool.checkout().await else {
                return ExecutionResult::failed(
                    "all copilot accounts rate limited or none configured: capacity",
                    start.elapsed().as_millis() as u64,
                );
            };

            let bearer = if account.needs_refresh(REFRESH_BUFFER) {
                match self.mint_bearer(&account.id, &account.oauth_token).await {
                    Ok(bearer) => bearer,
                    Err(e) => {
                        return ExecutionResult::failed(
                            format!("token refresh failed for {}: {}", account.id, e),
                            start.elapsed().as_millis() as u64,
                        );
                    }
                }
            } else {
                account.bearer_token.clone().unwrap_or_default()
            };

            let body = serde_json::json!({
                "model": ctx.model,
                "messages": [
                    { "role": "system", "content": ctx.system_prompt },
                    { "role": "user", "content": ctx.prompt },
                ],
                "max_tokens": ctx.max_output_tokens.unwrap_or(4096),
            });

            let response = self
                .http
                .post(&self.chat_url)
                .bearer_auth(&bearer)
                .header("user-agent", "foreman")
                .timeout(ctx.timeout.min(Duration::from_secs(600)))
                .json(&body)
                .send()
                .await;

            let duration_ms = start.elapsed().as_millis() as u64;
            let response = match response {
                Ok(r) => r,
                Err(e) => return ExecutionResult::failed(format!("fetch failed: {}", e), duration_ms),
            };

            let status = response.status().as_u16();
            if status == 429 {
                warn!(account = %account.id, attempt, "Copilot rate limited, rotating account");
                self.pool.mark_rate_limited(&account.id).await;
                continue;
            }
            if status >= 400 {
                let text = response.text().await.unwrap_or_default();
                return ExecutionResult::failed(format!("HTTP {}: {}", status, text), duration_ms);
            }

            let api: ChatResponse = match response.json().await {
                Ok(r) => r,
                Err(e) => return ExecutionResult::failed(format!("invalid response body: {}", e), duration_ms),
            };

            let output = api
                .choices
                .first()
                .map(|c| c.message.content.clone())
                .unwrap_or_default();
            let usage = api.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            });

            if let Some(log) = &ctx.log {
                for line in output.lines().filter(|l| !l.trim().is_empty()) {
                    log.append(line);
                }
            }

            return ExecutionResult::ok(output, start.elapsed().as_millis() as u64, usage);
        }

        ExecutionResult::failed(
            "HTTP 429 from all copilot accounts",
            start.elapsed().as_millis() as u64,
        )
    }
}

// API response types

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    /// Unix seconds
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::super::accounts::OAuthAccount;
    use super::*;
    use chrono::Utc;

    fn account(id: &str, bearer: Option<&str>) -> OAuthAccount {
        OAuthAccount {
            id: id.to_string(),
            oauth_token: format!("oauth-{}", id),
            bearer_token: bearer.map(str::to_string),
            expires_at: Utc::now().timestamp_millis() + 3_600_000,
        }
    }

    #[tokio::test]
    async fn test_detect_requires_accounts() {
        let adapter = CopilotAdapter::new(AccountPool::empty());
        assert!(!adapter.detect().await.available);

        let adapter = CopilotAdapter::new(AccountPool::new(
            vec![account("a", Some("bearer"))],
            RATE_LIMIT_COOLDOWN,
        ));
        assert!(adapter.detect().await.available);
    }

    #[tokio::test]
    async fn test_execute_with_exhausted_pool() {
        let pool = AccountPool::new(vec![account("a", Some("bearer"))], RATE_LIMIT_COOLDOWN);
        pool.mark_rate_limited("a").await;

        let adapter = CopilotAdapter::new(pool);
        let ctx = ExecutionContext::prompt_only("hi", "", "gpt-4o");
        let result = adapter.execute(&ctx).await;

        assert!(!result.success);
        // "capacity" keeps the pool-exhausted case in the transient table
        assert!(result.is_transient());
    }

    #[test]
    fn test_chat_response_parse() {
        let json = r#"{
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hello");
        assert_eq!(parsed.usage.unwrap().prompt_tokens, 12);
    }

    #[test]
    fn test_token_response_parse() {
        let parsed: TokenResponse =
            serde_json::from_str(r#"{"token": "b", "expires_at": 1700000000}"#).unwrap();
        assert_eq!(parsed.token, "b");
    }
}
