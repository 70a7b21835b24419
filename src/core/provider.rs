//! Provider identifiers.
//!
//! The set of research backends is closed. `Unknown` exists only so that rows
//! written before the provider column existed have an explicit, non-dispatchable
//! value instead of silently inheriting some default backend.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DeepqError, Result};

// =============================================================================
// Provider Enum
// =============================================================================

/// Supported research backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Azure,
    Gemini,
    Grok,
    /// Backfill sentinel for legacy rows. Never routable.
    Unknown,
}

impl Provider {
    /// All dispatchable providers in display order.
    pub const ALL: &'static [Self] = &[Self::OpenAi, Self::Azure, Self::Gemini, Self::Grok];

    /// Name used in config, storage and CLI.
    #[must_use]
    pub const fn cli_name(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Azure => "azure",
            Self::Gemini => "gemini",
            Self::Grok => "grok",
            Self::Unknown => "unknown",
        }
    }

    /// Display name for human output.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Azure => "Azure OpenAI",
            Self::Gemini => "Gemini",
            Self::Grok => "Grok",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a user-supplied provider name. The `unknown` sentinel is rejected.
    ///
    /// # Errors
    /// Returns `InvalidProvider` for unrecognised names.
    pub fn from_cli_name(name: &str) -> Result<Self> {
        let lower = name.trim().to_lowercase();
        Self::ALL
            .iter()
            .find(|p| p.cli_name() == lower)
            .copied()
            .ok_or_else(|| DeepqError::InvalidProvider(name.to_string()))
    }

    /// Parse a stored provider value, accepting the `unknown` sentinel.
    ///
    /// # Errors
    /// Returns `InvalidProvider` for values that are neither a provider nor the sentinel.
    pub fn from_stored(name: &str) -> Result<Self> {
        if name == Self::Unknown.cli_name() {
            return Ok(Self::Unknown);
        }
        Self::from_cli_name(name)
    }

    /// Whether jobs may be dispatched to this provider.
    #[must_use]
    pub const fn is_dispatchable(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Whether the backend runs research asynchronously and must be polled.
    #[must_use]
    pub const fn is_polled(self) -> bool {
        matches!(self, Self::OpenAi | Self::Azure)
    }

    /// Default model when the request does not name one.
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi | Self::Azure => "o4-mini-deep-research",
            Self::Gemini => "gemini-2.5-flash",
            Self::Grok => "grok-4",
            Self::Unknown => "unknown",
        }
    }

    /// Default base URL for the provider API.
    #[must_use]
    pub const fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::Azure => "https://example.openai.azure.com/openai",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Grok => "https://api.x.ai",
            Self::Unknown => "",
        }
    }

    /// Environment variable holding the API key.
    #[must_use]
    pub const fn default_api_key_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Azure => "AZURE_OPENAI_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
            Self::Grok => "XAI_API_KEY",
            Self::Unknown => "",
        }
    }

    /// Default per-call timeout. Synchronous backends do the whole job in one call.
    #[must_use]
    pub const fn default_timeout(self) -> Duration {
        match self {
            Self::OpenAi | Self::Azure => Duration::from_secs(30),
            Self::Gemini | Self::Grok => Duration::from_secs(300),
            Self::Unknown => Duration::from_secs(1),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.cli_name())
    }
}

impl std::str::FromStr for Provider {
    type Err = DeepqError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_cli_name(s)
    }
}
