//! OAuth account pool
//!
//! Some prompt-only backends are subscription services authenticated by
//! short-lived bearer tokens exchanged from a long-lived OAuth grant. The
//! pool rotates accounts least-recently-used first, tracks bearer expiry so
//! callers can refresh inside a buffer, and parks rate-limited accounts on a
//! temporary cooldown.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use eyre::{Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

/// One configured account
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthAccount {
    pub id: String,

    /// Long-lived OAuth grant used to mint bearer tokens
    #[serde(rename = "oauth-token")]
    pub oauth_token: String,

    /// Current short-lived bearer token, if any
    #[serde(rename = "bearer-token", default)]
    pub bearer_token: Option<String>,

    /// Bearer expiry, Unix milliseconds
    #[serde(rename = "expires-at", default)]
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct AccountsFile {
    accounts: Vec<OAuthAccount>,
}

#[derive(Debug)]
struct AccountState {
    account: OAuthAccount,
    last_used: i64,
    cooldown_until: i64,
}

/// A checked-out account snapshot
#[derive(Debug, Clone)]
pub struct Checkout {
    pub id: String,
    pub oauth_token: String,
    pub bearer_token: Option<String>,
    pub expires_at: i64,
}

impl Checkout {
    /// Whether the bearer must be (re)minted before use
    pub fn needs_refresh(&self, buffer: Duration) -> bool {
        match &self.bearer_token {
            None => true,
            Some(_) => self.expires_at - Utc::now().timestamp_millis() < buffer.as_millis() as i64,
        }
    }
}

/// Round-robin account pool with rate-limit cooldowns
pub struct AccountPool {
    states: Mutex<Vec<AccountState>>,
    cooldown: Duration,
}

impl AccountPool {
    pub fn new(accounts: Vec<OAuthAccount>, cooldown: Duration) -> Self {
        let states = accounts
            .into_iter()
            .map(|account| AccountState {
                account,
                last_used: 0,
                cooldown_until: 0,
            })
            .collect();
        Self {
            states: Mutex::new(states),
            cooldown,
        }
    }

    /// Load accounts from a JSON file (`{"accounts": [...]}`)
    pub fn load(path: &Path, cooldown: Duration) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read accounts file {}", path.display()))?;
        let file: AccountsFile = serde_json::from_str(&content).context("Failed to parse accounts file")?;
        Ok(Self::new(file.accounts, cooldown))
    }

    /// An empty pool
    pub fn empty() -> Self {
        Self::new(Vec::new(), Duration::from_secs(60))
    }

    pub async fn len(&self) -> usize {
        self.states.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.lock().await.is_empty()
    }

    /// Check out the least-recently-used account that is not cooling down
    pub async fn checkout(&self) -> Option<Checkout> {
        let now = Utc::now().timestamp_millis();
        let mut states = self.states.lock().await;

        let candidate = states
            .iter_mut()
            .filter(|s| s.cooldown_until <= now)
            .min_by_key(|s| s.last_used)?;

        candidate.last_used = now;
        debug!(account = %candidate.account.id, "Checked out account");
        Some(Checkout {
            id: candidate.account.id.clone(),
            oauth_token: candidate.account.oauth_token.clone(),
            bearer_token: candidate.account.bearer_token.clone(),
            expires_at: candidate.account.expires_at,
        })
    }

    /// Store a freshly minted bearer token for an account
    pub async fn store_bearer(&self, id: &str, bearer: String, expires_at: i64) {
        let mut states = self.states.lock().await;
        if let Some(state) = states.iter_mut().find(|s| s.account.id == id) {
            state.account.bearer_token = Some(bearer);
            state.account.expires_at = expires_at;
        }
    }

    /// Park an account after a 429 until the cooldown elapses
    pub async fn mark_rate_limited(&self, id: &str) {
        let until = Utc::now().timestamp_millis() + self.cooldown.as_millis() as i64;
        let mut states = self.states.lock().await;
        if let Some(state) = states.iter_mut().find(|s| s.account.id == id) {
            debug!(account = %id, "Account rate limited, cooling down");
            state.cooldown_until = until;
        }
    }
}
