//! Configuration file loading and management.
//!
//! Loads configuration from:
//! - Linux: `~/.config/deepq/config.toml`
//! - macOS: `~/Library/Application Support/deepq/config.toml`
//! - Windows: `%APPDATA%/deepq/config.toml`
//!
//! ## Precedence
//!
//! Settings are resolved with the following precedence (highest first):
//! 1. CLI flags
//! 2. Environment variables
//! 3. Config file
//! 4. Built-in defaults
//!
//! ## Environment Variables
//!
//! - `DEEPQ_CONFIG`: Override config file path
//! - `DEEPQ_DB`: Database path
//! - `DEEPQ_WORKERS`: Number of dispatcher workers

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::core::budgets::BudgetLimits;
use crate::core::dispatcher::{PollConfig, RetryConfig};
use crate::core::engine::ReaperConfig;
use crate::core::health::CircuitConfig;
use crate::core::money::Usd;
use crate::core::provider::Provider;
use crate::core::router::RoutingConfig;
use crate::error::{DeepqError, Result};

// =============================================================================
// Environment Variable Names
// =============================================================================

/// Environment variable to override config file path.
pub const ENV_CONFIG: &str = "DEEPQ_CONFIG";
/// Environment variable for the database path.
pub const ENV_DB: &str = "DEEPQ_DB";
/// Environment variable for the worker count.
pub const ENV_WORKERS: &str = "DEEPQ_WORKERS";

const DEFAULT_WORKERS: usize = 4;
const MAX_WORKERS: usize = 256;

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Values given on the command line. `None` defers to env, file and defaults.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub workers: Option<usize>,
}

/// Configuration after merging CLI, env vars, and config file.
///
/// `config.general.database_path` and `config.general.workers` hold the
/// resolved values.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: Config,
    pub config_path: PathBuf,
    /// Source of each setting for debugging.
    pub sources: ConfigSources,
}

/// Tracks the source of each configuration value.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub config_path: ConfigSource,
    pub database_path: ConfigSource,
    pub workers: ConfigSource,
}

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Value from CLI flag.
    Cli,
    /// Value from environment variable.
    Env,
    /// Value from config file.
    ConfigFile,
    /// Built-in default.
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI flag"),
            Self::Env => write!(f, "environment variable"),
            Self::ConfigFile => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

impl ResolvedConfig {
    /// Resolve final configuration from CLI overrides, the process
    /// environment, and the config file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The config file exists but is invalid
    /// - An environment override does not parse
    /// - Any resolved value fails validation
    pub fn resolve(overrides: &Overrides) -> Result<Self> {
        Self::resolve_with(overrides, |key| std::env::var(key).ok())
    }

    /// [`resolve`](Self::resolve) with an injectable environment lookup.
    ///
    /// # Errors
    /// See [`resolve`](Self::resolve).
    pub fn resolve_with(
        overrides: &Overrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut sources = ConfigSources::default();

        let config_path = if let Some(path) = &overrides.config_path {
            sources.config_path = ConfigSource::Cli;
            path.clone()
        } else if let Some(path) = env(ENV_CONFIG) {
            sources.config_path = ConfigSource::Env;
            PathBuf::from(path)
        } else {
            Config::config_path()
        };

        let mut config = Config::load_from(&config_path)?;

        if let Some(path) = &overrides.database_path {
            sources.database_path = ConfigSource::Cli;
            config.general.database_path = Some(path.clone());
        } else if let Some(path) = env(ENV_DB) {
            sources.database_path = ConfigSource::Env;
            config.general.database_path = Some(PathBuf::from(path));
        } else if config.general.database_path.is_some() {
            sources.database_path = ConfigSource::ConfigFile;
        }

        if let Some(workers) = overrides.workers {
            sources.workers = ConfigSource::Cli;
            config.general.workers = workers;
        } else if let Some(raw) = env(ENV_WORKERS) {
            sources.workers = ConfigSource::Env;
            config.general.workers = raw.trim().parse().map_err(|_| DeepqError::ConfigInvalid {
                key: ENV_WORKERS.to_string(),
                value: raw.clone(),
                message: "expected a positive integer".to_string(),
            })?;
        } else if config.general.workers != DEFAULT_WORKERS {
            sources.workers = ConfigSource::ConfigFile;
        }

        config.validate()?;
        tracing::debug!(
            config = %config_path.display(),
            database = %config.database_path().display(),
            workers = config.general.workers,
            "Configuration resolved"
        );

        Ok(Self {
            config,
            config_path,
            sources,
        })
    }
}

// =============================================================================
// Configuration File
// =============================================================================

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub routing: RoutingConfig,
    pub circuit: CircuitConfig,
    pub retry: RetryConfig,
    pub poll: PollConfig,
    pub budget: BudgetLimits,
    pub reaper: ReaperConfig,
    /// Per-provider settings keyed by provider name. Providers without an
    /// entry are enabled with their defaults.
    pub providers: BTreeMap<String, ProviderSettings>,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// SQLite database file. Defaults to the platform data directory.
    pub database_path: Option<PathBuf>,
    pub workers: usize,
    /// Per-call provider timeout; each provider's default when unset.
    pub call_timeout_secs: Option<u64>,
    /// Default log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Age in days after which settled terminal jobs are deleted by `cleanup`.
    pub retention_days: i64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            workers: DEFAULT_WORKERS,
            call_timeout_secs: None,
            log_level: None,
            retention_days: 90,
        }
    }
}

/// Settings for a specific provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub enabled: bool,
    /// Custom API base URL (if different from default).
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub model: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            api_key_env: None,
            model: None,
        }
    }
}

impl ProviderSettings {
    #[must_use]
    pub fn base_url(&self, provider: Provider) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| provider.default_base_url().to_string())
    }

    #[must_use]
    pub fn api_key_env(&self, provider: Provider) -> String {
        self.api_key_env
            .clone()
            .unwrap_or_else(|| provider.default_api_key_env().to_string())
    }

    #[must_use]
    pub fn model(&self, provider: Provider) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string())
    }
}

impl Config {
    /// Load configuration from the default config file path.
    ///
    /// # Errors
    /// Returns an error only if the file exists but is invalid.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific path.
    ///
    /// Returns default config if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error only if the file exists but is invalid.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(?path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        tracing::debug!(?path, "Loading config file");
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| DeepqError::Config(format!("Invalid config file {}: {e}", path.display())))
    }

    /// Save configuration to a specific path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| DeepqError::Config(format!("Failed to serialize config: {e}")))?;

        fs::write(path, content)?;
        tracing::debug!(?path, "Config file saved");
        Ok(())
    }

    /// Get the config file path.
    #[must_use]
    pub fn config_path() -> PathBuf {
        AppPaths::new().config_file()
    }

    /// Resolved database path.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.general
            .database_path
            .clone()
            .unwrap_or_else(|| AppPaths::new().database_file())
    }

    /// Settings for `provider`, defaults when the file has no entry.
    #[must_use]
    pub fn provider(&self, provider: Provider) -> ProviderSettings {
        self.providers
            .get(provider.cli_name())
            .cloned()
            .unwrap_or_default()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let g = &self.general;
        check(g.workers > 0 && g.workers <= MAX_WORKERS, "general.workers", g.workers, "must be between 1 and 256")?;
        check(g.call_timeout_secs != Some(0), "general.call_timeout_secs", 0, "must be positive")?;
        check(g.retention_days > 0, "general.retention_days", g.retention_days, "must be positive")?;

        let r = &self.routing;
        check((0.0..=1.0).contains(&r.exploration), "routing.exploration", r.exploration, "must be within [0, 1]")?;
        check(r.success_weight >= 0.0, "routing.success_weight", r.success_weight, "must not be negative")?;
        check(r.latency_weight >= 0.0, "routing.latency_weight", r.latency_weight, "must not be negative")?;
        check(r.latency_ref_ms > 0, "routing.latency_ref_ms", r.latency_ref_ms, "must be positive")?;

        let c = &self.circuit;
        check(c.failure_threshold > 0, "circuit.failure_threshold", c.failure_threshold, "must be positive")?;
        check(c.failure_rate > 0.0 && c.failure_rate <= 1.0, "circuit.failure_rate", c.failure_rate, "must be within (0, 1]")?;
        check(c.rate_window_secs > 0, "circuit.rate_window_secs", c.rate_window_secs, "must be positive")?;
        check(c.min_samples > 0, "circuit.min_samples", c.min_samples, "must be positive")?;
        check(c.cooldown_ms > 0, "circuit.cooldown_ms", c.cooldown_ms, "must be positive")?;
        check(c.ewma_alpha > 0.0 && c.ewma_alpha <= 1.0, "circuit.ewma_alpha", c.ewma_alpha, "must be within (0, 1]")?;
        check(c.latency_window > 0, "circuit.latency_window", c.latency_window, "must be positive")?;

        let rt = &self.retry;
        check(rt.backoff_base_ms > 0, "retry.backoff_base_ms", rt.backoff_base_ms, "must be positive")?;
        check(rt.backoff_cap_ms >= rt.backoff_base_ms, "retry.backoff_cap_ms", rt.backoff_cap_ms, "must not be below backoff_base_ms")?;
        check(rt.same_provider_attempts > 0, "retry.same_provider_attempts", rt.same_provider_attempts, "must be positive")?;
        check(rt.max_attempts > 0, "retry.max_attempts", rt.max_attempts, "must be positive")?;

        let p = &self.poll;
        check(p.initial_ms > 0, "poll.initial_ms", p.initial_ms, "must be positive")?;
        check(p.max_ms >= p.initial_ms, "poll.max_ms", p.max_ms, "must not be below initial_ms")?;
        check(p.growth >= 1.0, "poll.growth", p.growth, "must be at least 1")?;
        check(p.lease_secs > 0, "poll.lease_secs", p.lease_secs, "must be positive")?;
        check(p.max_poll_errors > 0, "poll.max_poll_errors", p.max_poll_errors, "must be positive")?;
        check(p.idle_ms > 0, "poll.idle_ms", p.idle_ms, "must be positive")?;

        let b = &self.budget;
        for (key, limit) in [
            ("budget.daily", b.daily),
            ("budget.monthly", b.monthly),
            ("budget.per_job", b.per_job),
            ("budget.per_session", b.per_session),
        ] {
            if let Some(limit) = limit {
                check(limit > Usd::ZERO, key, limit, "must be positive")?;
            }
        }
        check(b.warn_percent > 0 && b.warn_percent <= 100, "budget.warn_percent", b.warn_percent, "must be within (0, 100]")?;

        let rp = &self.reaper;
        check(rp.queued_timeout_secs > 0, "reaper.queued_timeout_secs", rp.queued_timeout_secs, "must be positive")?;
        check(rp.processing_timeout_secs > 0, "reaper.processing_timeout_secs", rp.processing_timeout_secs, "must be positive")?;

        let valid_providers = Provider::ALL
            .iter()
            .map(|provider| provider.cli_name())
            .collect::<Vec<_>>()
            .join(", ");
        for name in self.providers.keys() {
            match Provider::from_cli_name(name) {
                Ok(provider) if provider.is_dispatchable() => {}
                _ => {
                    return Err(DeepqError::ConfigInvalid {
                        key: format!("providers.{name}"),
                        value: name.clone(),
                        message: format!("unknown provider; valid providers: {valid_providers}"),
                    });
                }
            }
        }

        Ok(())
    }
}

fn check(ok: bool, key: &str, value: impl std::fmt::Display, message: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(DeepqError::ConfigInvalid {
            key: key.to_string(),
            value: value.to_string(),
            message: message.to_string(),
        })
    }
}
