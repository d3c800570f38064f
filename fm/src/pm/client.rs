//! PM invocation
//!
//! The PM is just a model call: prompt in, raw reply out. `RegistryPm`
//! targets the best-available adapter/model from the registry; `ScriptedPm`
//! replays canned replies for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use eyre::eyre;
use tracing::debug;

use crate::providers::{ExecutionContext, ProviderRegistry};

use super::prompt::PM_SYSTEM_PROMPT;

/// Obtains one PM reply per decision point
#[async_trait]
pub trait PmClient: Send + Sync {
    async fn decide(&self, prompt: &str) -> eyre::Result<String>;
}

/// The real PM: best-available model from the adapter registry
pub struct RegistryPm {
    registry: &'static ProviderRegistry,
}

impl RegistryPm {
    pub fn new(registry: &'static ProviderRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl PmClient for RegistryPm {
    async fn decide(&self, prompt: &str) -> eyre::Result<String> {
        let (adapter, model) = self
            .registry
            .best_available()
            .await
            .ok_or_else(|| eyre!("no provider available for PM decisions"))?;

        debug!(provider = adapter.id(), model = %model, "Invoking PM");
        let ctx = ExecutionContext::prompt_only(prompt, PM_SYSTEM_PROMPT, model);
        let result = adapter.execute(&ctx).await;

        if result.success {
            Ok(result.output)
        } else {
            Err(eyre!(
                "PM invocation failed: {}",
                result.error.unwrap_or_else(|| "unknown error".to_string())
            ))
        }
    }
}

/// Scripted PM for tests: replays replies in order, then repeats the last
pub struct ScriptedPm {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedPm {
    pub fn new(replies: impl IntoIterator<Item = String>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Number of decisions taken so far
    pub fn decisions(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl PmClient for ScriptedPm {
    async fn decide(&self, prompt: &str) -> eyre::Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());

        let mut replies = self.replies.lock().unwrap();
        if let Some(reply) = replies.pop_front() {
            *self.last.lock().unwrap() = Some(reply.clone());
            Ok(reply)
        } else if let Some(last) = self.last.lock().unwrap().clone() {
            Ok(last)
        } else {
            Err(eyre!("scripted PM has no replies"))
        }
    }
}
