//! Adapter registry
//!
//! A process-wide table of provider adapters keyed by id, with model-to-id
//! resolution and a cached availability scan. Adapters are registered as
//! values; lookups return borrowed references, with no back-pointers from
//! adapter to registry.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{Availability, ProviderAdapter, ProviderInfo};

/// Capability tier per model, used by best-available selection. CLI alias
/// models are priced at zero, so cost-based ranking would be degenerate;
/// the tier is an explicit quality ordering instead.
const MODEL_TIERS: &[(&str, u32)] = &[
    ("claude-opus-4", 100),
    ("claude-sonnet-4", 90),
    ("opus", 100),
    ("sonnet", 90),
    ("haiku", 40),
    ("claude-haiku-4", 40),
    ("gpt-4o", 80),
    ("gpt-4o-mini", 50),
];

fn model_tier(model: &str) -> u32 {
    MODEL_TIERS
        .iter()
        .find(|(m, _)| *m == model)
        .map(|(_, t)| *t)
        .unwrap_or(0)
}

/// The process-wide adapter table
pub struct ProviderRegistry {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    by_id: HashMap<&'static str, usize>,
    by_model: HashMap<&'static str, usize>,
    availability: RwLock<HashMap<&'static str, Availability>>,
}

impl ProviderRegistry {
    /// An empty registry (tests register their own adapters)
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
            by_id: HashMap::new(),
            by_model: HashMap::new(),
            availability: RwLock::new(HashMap::new()),
        }
    }

    /// The standard adapter set, configured from the environment
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::ClaudeCliAdapter::from_env()));
        registry.register(Arc::new(super::AnthropicAdapter::from_env()));
        registry.register(Arc::new(super::CopilotAdapter::from_env()));
        registry
    }

    /// The standard adapter set, honoring the providers config section
    pub fn from_config(config: &crate::config::ProvidersConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::ClaudeCliAdapter::new(config.claude_bin.clone())));
        registry.register(Arc::new(super::AnthropicAdapter::from_env()));
        let copilot = match &config.copilot_accounts {
            Some(path) => super::CopilotAdapter::from_accounts_file(path),
            None => super::CopilotAdapter::from_env(),
        };
        registry.register(Arc::new(copilot));
        registry
    }

    /// Register an adapter. First registration of a model id wins the
    /// model-to-adapter mapping.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        let index = self.adapters.len();
        self.by_id.insert(adapter.id(), index);
        for model in adapter.models() {
            self.by_model.entry(model).or_insert(index);
        }
        debug!(id = adapter.id(), "Registered provider adapter");
        self.adapters.push(adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.by_id.get(id).map(|&i| Arc::clone(&self.adapters[i]))
    }

    /// Resolve a model name to the adapter that serves it
    pub fn for_model(&self, model: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.by_model.get(model).map(|&i| Arc::clone(&self.adapters[i]))
    }

    /// All registered adapters, registration order
    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn ProviderAdapter>> {
        self.adapters.iter()
    }

    /// Availability of one adapter, detecting on first use
    pub async fn availability(&self, id: &'static str, refresh: bool) -> Option<Availability> {
        if !refresh
            && let Some(cached) = self.availability.read().await.get(id)
        {
            return Some(cached.clone());
        }

        let adapter = self.get(id)?;
        let availability = adapter.detect().await;
        self.availability.write().await.insert(adapter.id(), availability.clone());
        Some(availability)
    }

    /// Scan (or re-scan) all adapters and return their info records
    pub async fn available_providers(&self, refresh: bool) -> Vec<ProviderInfo> {
        let mut infos = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let availability = self
                .availability(adapter.id(), refresh)
                .await
                .unwrap_or_else(|| Availability::down("not registered"));
            infos.push(ProviderInfo {
                id: adapter.id().to_string(),
                name: adapter.name().to_string(),
                available: availability.available,
                reason: availability.reason,
                models: adapter.models().iter().map(|m| m.to_string()).collect(),
                capabilities: adapter.capabilities(),
            });
        }
        info!(count = infos.len(), "Scanned provider availability");
        infos
    }

    /// Available adapters only, registration order
    pub async fn available_adapters(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        let mut out = Vec::new();
        for adapter in &self.adapters {
            if let Some(a) = self.availability(adapter.id(), false).await
                && a.available
            {
                out.push(Arc::clone(adapter));
            }
        }
        out
    }

    /// Cheapest available adapter/model by summed per-1M pricing
    pub async fn cheapest_available(&self) -> Option<(Arc<dyn ProviderAdapter>, String)> {
        let mut best: Option<(Arc<dyn ProviderAdapter>, String, f64)> = None;
        for adapter in self.available_adapters().await {
            for model in adapter.models() {
                let pricing = adapter.pricing(model);
                let total = pricing.input_per_1m + pricing.output_per_1m;
                if best.as_ref().map(|(_, _, b)| total < *b).unwrap_or(true) {
                    best = Some((Arc::clone(&adapter), model.to_string(), total));
                }
            }
        }
        best.map(|(a, m, _)| (a, m))
    }

    /// Best available adapter/model by the explicit tier table; ties break
    /// toward the adapter registered first
    pub async fn best_available(&self) -> Option<(Arc<dyn ProviderAdapter>, String)> {
        let mut best: Option<(Arc<dyn ProviderAdapter>, String, u32)> = None;
        for adapter in self.available_adapters().await {
            for model in adapter.models() {
                let tier = model_tier(model);
                if best.as_ref().map(|(_, _, b)| tier > *b).unwrap_or(true) {
                    best = Some((Arc::clone(&adapter), model.to_string(), tier));
                }
            }
        }
        best.map(|(a, m, _)| (a, m))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: OnceLock<ProviderRegistry> = OnceLock::new();

/// The process-wide registry with the standard adapter set
pub fn global_registry() -> &'static ProviderRegistry {
    GLOBAL.get_or_init(ProviderRegistry::standard)
}
