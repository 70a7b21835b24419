//! Error types for deepq.
//!
//! Uses `thiserror` for structured error types that map to exit codes.
//!
//! ## Error Taxonomy
//!
//! Errors are categorized into six main categories:
//! - **Admission**: Budget shortfall, paused ledger, malformed requests
//! - **Transport**: Timeouts and connection failures talking to a provider
//! - **Provider**: Rate limits, outages, rejected content, bad credentials
//! - **Consistency**: Illegal state transitions and partially applied settlements
//! - **Configuration**: Config file parsing, validation, or unknown names
//! - **Internal**: Storage, I/O and serialization failures
//!
//! Each error has a stable error code (e.g., `DEEPQ-B001`) for programmatic handling.

use std::time::Duration;
use thiserror::Error;

use crate::core::money::Usd;

// =============================================================================
// Error Categories
// =============================================================================

/// High-level error categories for classification and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Rejected before anything was persisted.
    Admission,
    /// Timeouts and connection failures.
    Transport,
    /// Provider-reported failures (rate limits, outages, rejections).
    Provider,
    /// Job store / ledger disagreement or illegal transitions.
    Consistency,
    /// Configuration issues.
    Configuration,
    /// Storage, I/O and serialization failures.
    Internal,
}

impl ErrorCategory {
    /// Returns a human-readable description of the category.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Admission => "Admission error",
            Self::Transport => "Transport error",
            Self::Provider => "Provider error",
            Self::Consistency => "Consistency error",
            Self::Configuration => "Configuration error",
            Self::Internal => "Internal error",
        }
    }

    /// Returns a short code prefix for this category.
    #[must_use]
    pub const fn code_prefix(&self) -> &'static str {
        match self {
            Self::Admission => "B",
            Self::Transport => "T",
            Self::Provider => "P",
            Self::Consistency => "S",
            Self::Configuration => "C",
            Self::Internal => "X",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit codes for the operator binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Success
    Success = 0,
    /// Unexpected failure
    GeneralError = 1,
    /// Admission rejected (budget, pause, malformed request)
    Rejected = 2,
    /// Configuration or parse errors
    ConfigError = 3,
    /// Timeout
    Timeout = 4,
    /// Job or ledger state conflict
    Conflict = 5,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as Self
    }
}

/// Main error type for deepq operations.
///
/// Each variant has:
/// - A stable error code (e.g., `DEEPQ-B001`)
/// - A category for classification
/// - A retryable flag for the dispatch retry policy
#[derive(Error, Debug)]
pub enum DeepqError {
    // ==========================================================================
    // Admission errors (Category: Admission)
    // ==========================================================================
    /// A budget scope cannot absorb the estimated cost.
    #[error("budget exceeded for {scope} scope '{key}': limit {limit}, shortfall {shortfall}")]
    BudgetExceeded {
        scope: String,
        key: String,
        limit: Usd,
        shortfall: Usd,
    },

    /// The ledger is paused and admits nothing new.
    #[error("ledger paused: {reason}")]
    LedgerPaused { reason: String },

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // ==========================================================================
    // Transport errors (Category: Transport)
    // ==========================================================================
    /// Provider call exceeded the per-call timeout.
    #[error("request timeout after {seconds}s for {provider}")]
    Timeout { provider: String, seconds: u64 },

    /// Connection could not be established or was dropped.
    #[error("connection to {provider} failed: {message}")]
    ConnectionFailed { provider: String, message: String },

    // ==========================================================================
    // Provider errors (Category: Provider)
    // ==========================================================================
    /// Rate limited by provider.
    #[error("rate limited by {provider}: {message}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
        message: String,
    },

    /// Provider returned a 5xx or reported an outage.
    #[error("provider {provider} unavailable: {message}")]
    ProviderUnavailable {
        provider: String,
        status_code: Option<u16>,
        message: String,
    },

    /// Provider rejected the request as malformed.
    #[error("provider {provider} rejected request: {message}")]
    BadRequest { provider: String, message: String },

    /// Credentials missing or refused.
    #[error("authentication failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    /// Provider refused the content of the request.
    #[error("content rejected by {provider}: {message}")]
    ContentRejected { provider: String, message: String },

    /// Model is not served by the provider.
    #[error("invalid model '{model}' for {provider}")]
    InvalidModel { provider: String, model: String },

    /// Provider response could not be parsed.
    #[error("failed to parse {provider} response: {message}")]
    ParseResponse { provider: String, message: String },

    /// Every candidate provider is excluded, open, or over budget.
    #[error("no eligible provider: {reason}")]
    NoEligibleProvider { reason: String },

    // ==========================================================================
    // Consistency errors (Category: Consistency)
    // ==========================================================================
    /// Requested transition is not legal from the current state.
    #[error("job {job_id}: illegal transition {from} -> {to}")]
    StateConflict {
        job_id: String,
        from: String,
        to: String,
    },

    /// Job does not exist.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Reservation does not exist.
    #[error("reservation not found: {0}")]
    ReservationNotFound(String),

    /// One half of a settlement was applied and the other was not.
    #[error("settlement incomplete for job {job_id} at {stage}: {message}")]
    SettlementIncomplete {
        job_id: String,
        stage: String,
        message: String,
    },

    /// Stored provider is the `unknown` sentinel.
    #[error("job {job_id} has no known provider")]
    UnknownProvider { job_id: String },

    // ==========================================================================
    // Configuration errors (Category: Configuration)
    // ==========================================================================
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid value in configuration.
    #[error("invalid config value for '{key}': {message}")]
    ConfigInvalid {
        key: String,
        value: String,
        message: String,
    },

    /// Unrecognised provider name.
    #[error("invalid provider: {0}")]
    InvalidProvider(String),

    /// Provider is known but not configured/enabled.
    #[error("provider {0} is not enabled")]
    ProviderDisabled(String),

    // ==========================================================================
    // Internal errors (Category: Internal)
    // ==========================================================================
    /// Database operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for other errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeepqError {
    /// Map error to an operator exit code.
    #[must_use]
    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::BudgetExceeded { .. } | Self::LedgerPaused { .. } | Self::InvalidRequest(_) => {
                ExitCode::Rejected
            }

            Self::Config(_)
            | Self::ConfigInvalid { .. }
            | Self::InvalidProvider(_)
            | Self::ProviderDisabled(_) => ExitCode::ConfigError,

            Self::Timeout { .. } => ExitCode::Timeout,

            Self::StateConflict { .. }
            | Self::JobNotFound(_)
            | Self::ReservationNotFound(_)
            | Self::SettlementIncomplete { .. }
            | Self::UnknownProvider { .. } => ExitCode::Conflict,

            Self::ConnectionFailed { .. }
            | Self::RateLimited { .. }
            | Self::ProviderUnavailable { .. }
            | Self::BadRequest { .. }
            | Self::AuthFailed { .. }
            | Self::ContentRejected { .. }
            | Self::InvalidModel { .. }
            | Self::ParseResponse { .. }
            | Self::NoEligibleProvider { .. }
            | Self::Storage(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Other(_) => ExitCode::GeneralError,
        }
    }

    /// Returns the error category for classification and routing.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::BudgetExceeded { .. } | Self::LedgerPaused { .. } | Self::InvalidRequest(_) => {
                ErrorCategory::Admission
            }

            Self::Timeout { .. } | Self::ConnectionFailed { .. } => ErrorCategory::Transport,

            Self::RateLimited { .. }
            | Self::ProviderUnavailable { .. }
            | Self::BadRequest { .. }
            | Self::AuthFailed { .. }
            | Self::ContentRejected { .. }
            | Self::InvalidModel { .. }
            | Self::ParseResponse { .. }
            | Self::NoEligibleProvider { .. } => ErrorCategory::Provider,

            Self::StateConflict { .. }
            | Self::JobNotFound(_)
            | Self::ReservationNotFound(_)
            | Self::SettlementIncomplete { .. }
            | Self::UnknownProvider { .. } => ErrorCategory::Consistency,

            Self::Config(_)
            | Self::ConfigInvalid { .. }
            | Self::InvalidProvider(_)
            | Self::ProviderDisabled(_) => ErrorCategory::Configuration,

            Self::Storage(_) | Self::Io(_) | Self::Json(_) | Self::Other(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Returns a stable error code for programmatic handling.
    ///
    /// Format: `DEEPQ-{category}{number}`.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => "DEEPQ-B001",
            Self::LedgerPaused { .. } => "DEEPQ-B002",
            Self::InvalidRequest(_) => "DEEPQ-B003",

            Self::Timeout { .. } => "DEEPQ-T001",
            Self::ConnectionFailed { .. } => "DEEPQ-T002",

            Self::RateLimited { .. } => "DEEPQ-P001",
            Self::ProviderUnavailable { .. } => "DEEPQ-P002",
            Self::BadRequest { .. } => "DEEPQ-P003",
            Self::AuthFailed { .. } => "DEEPQ-P004",
            Self::ContentRejected { .. } => "DEEPQ-P005",
            Self::InvalidModel { .. } => "DEEPQ-P006",
            Self::ParseResponse { .. } => "DEEPQ-P020",
            Self::NoEligibleProvider { .. } => "DEEPQ-P030",

            Self::StateConflict { .. } => "DEEPQ-S001",
            Self::JobNotFound(_) => "DEEPQ-S002",
            Self::ReservationNotFound(_) => "DEEPQ-S003",
            Self::SettlementIncomplete { .. } => "DEEPQ-S004",
            Self::UnknownProvider { .. } => "DEEPQ-S005",

            Self::Config(_) => "DEEPQ-C001",
            Self::ConfigInvalid { .. } => "DEEPQ-C002",
            Self::InvalidProvider(_) => "DEEPQ-C010",
            Self::ProviderDisabled(_) => "DEEPQ-C011",

            Self::Storage(_) => "DEEPQ-X001",
            Self::Io(_) => "DEEPQ-X002",
            Self::Json(_) => "DEEPQ-X003",
            Self::Other(_) => "DEEPQ-X099",
        }
    }

    /// Returns whether a dispatch attempt that failed with this error may be retried.
    ///
    /// Retryable errors include:
    /// - Timeouts and connection failures
    /// - Rate limits (with backoff)
    /// - 5xx / temporary provider unavailability
    /// - No eligible provider right now (circuits may close later)
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ConnectionFailed { .. }
                | Self::RateLimited { .. }
                | Self::ProviderUnavailable { .. }
                | Self::NoEligibleProvider { .. }
        )
    }

    /// Whether this error says something about the provider's health.
    ///
    /// Request-specific rejections (bad request, content, model) do not.
    #[must_use]
    pub const fn counts_against_provider(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ConnectionFailed { .. }
                | Self::RateLimited { .. }
                | Self::ProviderUnavailable { .. }
                | Self::AuthFailed { .. }
                | Self::ParseResponse { .. }
        )
    }

    /// Returns the retry-after duration if available.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns the provider name if this error is provider-specific.
    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Timeout { provider, .. }
            | Self::ConnectionFailed { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::ProviderUnavailable { provider, .. }
            | Self::BadRequest { provider, .. }
            | Self::AuthFailed { provider, .. }
            | Self::ContentRejected { provider, .. }
            | Self::InvalidModel { provider, .. }
            | Self::ParseResponse { provider, .. } => Some(provider),
            Self::ProviderDisabled(provider) => Some(provider),
            _ => None,
        }
    }

    /// Structured reason string persisted on failed jobs.
    #[must_use]
    pub fn job_reason(&self) -> String {
        format!("{}: {self}", self.error_code())
    }

    /// Wrap a storage failure with context.
    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{context}: {err}"))
    }
}

/// Result type alias for deepq operations.
pub type Result<T> = std::result::Result<T, DeepqError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_err_samples() -> Vec<DeepqError> {
        vec![
            DeepqError::RateLimited {
                provider: "openai".into(),
                retry_after: Some(Duration::from_secs(3)),
                message: "slow down".into(),
            },
            DeepqError::ProviderUnavailable {
                provider: "openai".into(),
                status_code: Some(503),
                message: "down".into(),
            },
            DeepqError::ContentRejected {
                provider: "gemini".into(),
                message: "policy".into(),
            },
        ]
    }

    #[test]
    fn error_category_code_prefix() {
        assert_eq!(ErrorCategory::Admission.code_prefix(), "B");
        assert_eq!(ErrorCategory::Consistency.code_prefix(), "S");
        assert_eq!(ErrorCategory::Internal.to_string(), "Internal error");
    }

    #[test]
    fn error_codes_match_category_prefix() {
        let errors = vec![
            DeepqError::BudgetExceeded {
                scope: "daily".into(),
                key: "2026-01-01".into(),
                limit: Usd::from_cents(100),
                shortfall: Usd::from_cents(20),
            },
            DeepqError::Timeout {
                provider: "grok".into(),
                seconds: 30,
            },
            DeepqError::StateConflict {
                job_id: "j".into(),
                from: "completed".into(),
                to: "queued".into(),
            },
            DeepqError::Config("x".into()),
            DeepqError::Storage("x".into()),
        ];
        for err in errors {
            let code = err.error_code();
            let expected = format!("DEEPQ-{}", err.category().code_prefix());
            assert!(code.starts_with(&expected), "{code} vs {expected}");
        }
    }

    #[test]
    fn retryable_classification() {
        let samples = provider_err_samples();
        assert!(samples[0].is_retryable());
        assert!(samples[1].is_retryable());
        assert!(!samples[2].is_retryable());
        assert!(!samples[2].counts_against_provider());
        assert!(
            !DeepqError::AuthFailed {
                provider: "azure".into(),
                message: "401".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn retry_after_and_provider_extraction() {
        let samples = provider_err_samples();
        assert_eq!(samples[0].retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(samples[1].retry_after(), None);
        assert_eq!(samples[2].provider(), Some("gemini"));
        assert_eq!(DeepqError::JobNotFound("x".into()).provider(), None);
    }

    #[test]
    fn budget_exceeded_names_scope_and_shortfall() {
        let err = DeepqError::BudgetExceeded {
            scope: "daily".into(),
            key: "2026-10-19".into(),
            limit: Usd::from_cents(1000),
            shortfall: Usd::from_cents(20),
        };
        let text = err.to_string();
        assert!(text.contains("daily"));
        assert!(text.contains("$0.20"));
        assert_eq!(err.exit_code(), ExitCode::Rejected);
    }
}
