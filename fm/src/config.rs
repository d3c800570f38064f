//! Foreman configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main foreman configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider defaults
    pub providers: ProvidersConfig,

    /// Concurrency limits
    pub concurrency: ConcurrencyConfig,

    /// Timeouts and polling cadences
    pub timeouts: TimeoutsConfig,

    /// Cost budget
    pub budget: BudgetConfig,

    /// Runaway guards
    pub limits: LimitsConfig,

    /// Storage locations
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .foreman.yml
        let local_config = PathBuf::from(".foreman.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/foreman/foreman.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("foreman").join("foreman.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Provider defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider used when no override or hint applies
    pub default: String,

    /// Path to the CLI binary
    #[serde(rename = "claude-bin")]
    pub claude_bin: String,

    /// Copilot accounts file
    #[serde(rename = "copilot-accounts")]
    pub copilot_accounts: Option<PathBuf>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default: "claude-cli".to_string(),
            claude_bin: "claude".to_string(),
            copilot_accounts: None,
        }
    }
}

/// Concurrency limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Maximum agent executions in flight
    #[serde(rename = "max-parallel-tasks")]
    pub max_parallel_tasks: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_parallel_tasks: 3 }
    }
}

/// Timeouts and polling cadences
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Per-task execution deadline in milliseconds
    #[serde(rename = "task-execution-timeout-ms")]
    pub task_execution_timeout_ms: u64,

    /// Health-check interval while awaiting completions
    #[serde(rename = "health-check-interval-ms")]
    pub health_check_interval_ms: u64,

    /// No log activity for this long marks a task stale
    #[serde(rename = "stale-threshold-ms")]
    pub stale_threshold_ms: u64,

    /// How long to wait for plan confirmation
    #[serde(rename = "plan-confirm-timeout-ms")]
    pub plan_confirm_timeout_ms: u64,

    /// How long to wait for a user answer to a PM question
    #[serde(rename = "question-timeout-ms")]
    pub question_timeout_ms: u64,

    /// Gate polling cadence
    #[serde(rename = "gate-poll-ms")]
    pub gate_poll_ms: u64,

    /// Heartbeat cadence
    #[serde(rename = "heartbeat-interval-ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            task_execution_timeout_ms: 1_800_000,
            health_check_interval_ms: 30_000,
            stale_threshold_ms: 300_000,
            plan_confirm_timeout_ms: 900_000,
            question_timeout_ms: 900_000,
            gate_poll_ms: 1_000,
            heartbeat_interval_ms: 15_000,
        }
    }
}

impl TimeoutsConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_execution_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn plan_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.plan_confirm_timeout_ms)
    }

    pub fn question_timeout(&self) -> Duration {
        Duration::from_millis(self.question_timeout_ms)
    }

    pub fn gate_poll(&self) -> Duration {
        Duration::from_millis(self.gate_poll_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Cost budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Run budget ceiling, USD
    #[serde(rename = "limit-usd")]
    pub limit_usd: f64,

    /// Fraction of the limit that arms the budget warning
    #[serde(rename = "warn-fraction")]
    pub warn_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit_usd: 25.0,
            warn_fraction: 0.8,
        }
    }
}

/// Runaway guards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Hard cap on PM decisions per run
    #[serde(rename = "max-decisions")]
    pub max_decisions: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_decisions: 100 }
    }
}

/// Storage locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Repository root for the JSONL store (defaults under the data dir)
    #[serde(rename = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Extra agent definitions
    #[serde(rename = "agents-dir")]
    pub agents_dir: Option<PathBuf>,

    /// Skill markdown files injected for file-access providers
    #[serde(rename = "skills-dir")]
    pub skills_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.concurrency.max_parallel_tasks, 3);
        assert_eq!(config.providers.default, "claude-cli");
        assert_eq!(config.timeouts.task_timeout(), Duration::from_secs(1800));
        assert_eq!(config.timeouts.stale_threshold(), Duration::from_secs(300));
        assert_eq!(config.limits.max_decisions, 100);
        assert!((config.budget.warn_fraction - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_load_yaml() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("foreman.yml");
        std::fs::write(
            &path,
            "concurrency:\n  max-parallel-tasks: 5\nbudget:\n  limit-usd: 100.0\nproviders:\n  default: anthropic\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.concurrency.max_parallel_tasks, 5);
        assert!((config.budget.limit_usd - 100.0).abs() < 1e-9);
        assert_eq!(config.providers.default, "anthropic");
        // Unspecified sections keep defaults
        assert_eq!(config.limits.max_decisions, 100);
    }

    #[test]
    fn test_missing_explicit_path_errors() {
        let path = PathBuf::from("/definitely/not/here.yml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
