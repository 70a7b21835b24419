//! Research provider adapters.
//!
//! Each backend implements [`ResearchProvider`]. Asynchronous backends accept
//! a job and are polled to completion; synchronous backends do the whole job
//! inside `submit` and return a terminal outcome straight away.

pub mod chat;
pub mod gemini;
pub mod openai;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::models::{JobId, ResearchDepth};
use crate::core::money::Usd;
use crate::core::pricing::TokenUsage;
pub use crate::core::provider::Provider;
use crate::error::{DeepqError, Result};
use crate::storage::config::Config;

pub use chat::ChatCompletionsProvider;
pub use gemini::GeminiProvider;
pub use openai::ResponsesProvider;

// =============================================================================
// Capability Interface
// =============================================================================

/// What a provider needs to start a research job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub job_id: JobId,
    pub prompt: String,
    pub model: String,
    pub depth: ResearchDepth,
}

impl SubmitRequest {
    /// Output token ceiling for the requested depth.
    #[must_use]
    pub const fn max_output_tokens(&self) -> u64 {
        self.depth.output_tokens()
    }

    /// Tool/search call ceiling for the requested depth.
    #[must_use]
    pub const fn max_tool_calls(&self) -> u64 {
        self.depth.tool_calls()
    }
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The provider accepted the job; poll with this handle.
    Accepted { provider_job_id: String },
    /// The provider finished the job inside the submit call.
    Finished {
        provider_job_id: Option<String>,
        status: ProviderStatus,
    },
}

/// Provider-side job state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Completed {
        output: String,
        usage: TokenUsage,
        /// Dollar cost when the provider reports one.
        cost: Option<Usd>,
    },
    Failed {
        reason: String,
        usage: TokenUsage,
        cost: Option<Usd>,
    },
    Cancelled {
        usage: TokenUsage,
        cost: Option<Usd>,
    },
}

impl ProviderStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Usage and reported cost of a terminal state.
    #[must_use]
    pub const fn charge(&self) -> Option<(TokenUsage, Option<Usd>)> {
        match self {
            Self::Pending => None,
            Self::Completed { usage, cost, .. }
            | Self::Failed { usage, cost, .. }
            | Self::Cancelled { usage, cost } => Some((*usage, *cost)),
        }
    }
}

/// Common interface over every research backend.
#[async_trait]
pub trait ResearchProvider: Send + Sync + std::fmt::Debug {
    fn provider(&self) -> Provider;

    /// Start a job.
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome>;

    /// Current state of a previously accepted job.
    async fn poll(&self, provider_job_id: &str) -> Result<ProviderStatus>;

    /// Ask the provider to stop a job. Best effort.
    async fn cancel(&self, provider_job_id: &str) -> Result<()>;
}

/// Error for polling or cancelling on a backend that finishes inside submit.
pub(crate) fn nothing_to_poll(provider: Provider) -> DeepqError {
    DeepqError::BadRequest {
        provider: provider.to_string(),
        message: "synchronous provider has no pending jobs".to_string(),
    }
}

// =============================================================================
// Provider Set
// =============================================================================

/// Enabled providers, their adapters and default models.
#[derive(Debug, Clone, Default)]
pub struct ProviderSet {
    adapters: BTreeMap<Provider, (Arc<dyn ResearchProvider>, String)>,
}

impl ProviderSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` with `default_model`. Replaces any previous adapter.
    pub fn insert(&mut self, adapter: Arc<dyn ResearchProvider>, default_model: impl Into<String>) {
        let provider = adapter.provider();
        self.adapters.insert(provider, (adapter, default_model.into()));
    }

    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn ResearchProvider>, default_model: impl Into<String>) -> Self {
        self.insert(adapter, default_model);
        self
    }

    /// Adapter for a job's stored provider.
    ///
    /// # Errors
    /// `InvalidProvider` for the unknown sentinel, `ProviderDisabled` when the
    /// provider is not configured.
    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ResearchProvider>> {
        if !provider.is_dispatchable() {
            return Err(DeepqError::InvalidProvider(provider.to_string()));
        }
        self.adapters
            .get(&provider)
            .map(|(adapter, _)| Arc::clone(adapter))
            .ok_or_else(|| DeepqError::ProviderDisabled(provider.to_string()))
    }

    #[must_use]
    pub fn contains(&self, provider: Provider) -> bool {
        self.adapters.contains_key(&provider)
    }

    /// Enabled providers with their default models.
    #[must_use]
    pub fn enabled(&self) -> Vec<(Provider, String)> {
        self.adapters
            .iter()
            .map(|(p, (_, model))| (*p, model.clone()))
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Build HTTP adapters for every enabled provider whose API key is set.
    ///
    /// # Errors
    /// Returns an error if an HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_with(config, |key| std::env::var(key).ok())
    }

    /// [`from_config`](Self::from_config) with an injectable key lookup.
    ///
    /// # Errors
    /// Returns an error if an HTTP client cannot be built.
    pub fn from_config_with(
        config: &Config,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut set = Self::new();
        for &provider in Provider::ALL {
            let settings = config.provider(provider);
            if !settings.enabled {
                tracing::debug!(%provider, "Provider disabled in config");
                continue;
            }
            let key_env = settings.api_key_env(provider);
            let Some(api_key) = env(&key_env).filter(|k| !k.trim().is_empty()) else {
                tracing::warn!(%provider, env = %key_env, "API key not set; provider not enabled");
                continue;
            };
            let base_url = settings.base_url(provider);
            let timeout = config
                .general
                .call_timeout_secs
                .map_or_else(|| provider.default_timeout(), std::time::Duration::from_secs);

            let adapter: Arc<dyn ResearchProvider> = match provider {
                Provider::OpenAi | Provider::Azure => {
                    Arc::new(ResponsesProvider::new(provider, base_url, api_key, timeout)?)
                }
                Provider::Gemini => Arc::new(GeminiProvider::new(base_url, api_key, timeout)?),
                Provider::Grok => Arc::new(ChatCompletionsProvider::new(
                    provider, base_url, api_key, timeout,
                )?),
                Provider::Unknown => continue,
            };
            tracing::debug!(%provider, model = %settings.model(provider), "Provider enabled");
            set.insert(adapter, settings.model(provider));
        }
        Ok(set)
    }
}
