//! Core data models for jobs and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::money::Usd;
use super::provider::Provider;
use crate::error::{DeepqError, Result};

/// Upper bound on prompt size accepted at submission.
pub const MAX_PROMPT_CHARS: usize = 200_000;

// =============================================================================
// Job Id
// =============================================================================

/// Opaque, immutable job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Job Status
// =============================================================================

/// Lifecycle state of a job. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: &'static [Self] = &[
        Self::Queued,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a stored or user-supplied status.
    ///
    /// # Errors
    /// Returns `InvalidRequest` for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| DeepqError::InvalidRequest(format!("unknown job status '{s}'")))
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal transitions through `JobStore::update`.
    ///
    /// `queued -> processing` is absent on purpose: only `dequeue_next` may do it.
    /// `processing -> queued` is a retry reschedule and additionally requires
    /// that no provider has accepted the job yet.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Cancelled)
                | (Self::Processing, Self::Queued)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Request shape
// =============================================================================

/// How much research the caller wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchDepth {
    Quick,
    #[default]
    Standard,
    Deep,
}

impl ResearchDepth {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Deep => "deep",
        }
    }

    /// # Errors
    /// Returns `InvalidRequest` for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "standard" => Ok(Self::Standard),
            "deep" => Ok(Self::Deep),
            other => Err(DeepqError::InvalidRequest(format!(
                "unknown research depth '{other}'"
            ))),
        }
    }

    /// Expected output (including reasoning) tokens.
    #[must_use]
    pub const fn output_tokens(self) -> u64 {
        match self {
            Self::Quick => 8_000,
            Self::Standard => 30_000,
            Self::Deep => 100_000,
        }
    }

    /// Expected web-search/tool calls billed per call.
    #[must_use]
    pub const fn tool_calls(self) -> u64 {
        match self {
            Self::Quick => 5,
            Self::Standard => 20,
            Self::Deep => 60,
        }
    }
}

/// What the collaborator asks to have researched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub prompt: String,
    #[serde(default)]
    pub depth: ResearchDepth,
    /// Pin to a provider; otherwise the router chooses.
    #[serde(default)]
    pub provider: Option<Provider>,
    #[serde(default)]
    pub model: Option<String>,
}

impl JobSpec {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            depth: ResearchDepth::default(),
            provider: None,
            model: None,
        }
    }

    #[must_use]
    pub const fn with_depth(mut self, depth: ResearchDepth) -> Self {
        self.depth = depth;
        self
    }

    #[must_use]
    pub const fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Reject malformed requests before anything is reserved or persisted.
    ///
    /// # Errors
    /// Returns `InvalidRequest` for empty or oversized prompts and the `unknown` provider.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(DeepqError::InvalidRequest("prompt is empty".to_string()));
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(DeepqError::InvalidRequest(format!(
                "prompt exceeds {MAX_PROMPT_CHARS} characters"
            )));
        }
        if self.provider == Some(Provider::Unknown) {
            return Err(DeepqError::InvalidRequest(
                "provider 'unknown' cannot be requested".to_string(),
            ));
        }
        if self.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(DeepqError::InvalidRequest("model is empty".to_string()));
        }
        Ok(())
    }
}

/// Caller-supplied spending constraints. These only ever tighten configured limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConstraints {
    /// Per-job cap.
    #[serde(default)]
    pub max_cost: Option<Usd>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Session cap; requires `session_id`.
    #[serde(default)]
    pub session_limit: Option<Usd>,
}

// =============================================================================
// Retry and settlement bookkeeping
// =============================================================================

/// Persisted retry state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Failed dispatch attempts across all providers.
    pub retry_count: u32,
    /// Consecutive failed attempts against the current provider.
    pub provider_attempts: u32,
    /// Providers abandoned for this job after repeated failures.
    pub excluded_providers: Vec<Provider>,
    /// Earliest time the job may be dequeued again.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Progress of the two-write settlement commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementState {
    /// Job has not reached settlement.
    #[default]
    None,
    /// Outcome recorded; ledger and/or final job write still outstanding.
    Pending,
    /// Ledger and job store agree.
    Done,
}

impl SettlementState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Done => "done",
        }
    }

    /// # Errors
    /// Returns `Storage` for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            other => Err(DeepqError::Storage(format!(
                "unknown settlement state '{other}'"
            ))),
        }
    }
}

/// Outcome recorded before the ledger is touched, so reconciliation can finish it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSettlement {
    /// Terminal status the job settles into.
    pub status: JobStatus,
    /// `None` means nothing was charged: release instead of settle.
    pub actual_cost: Option<Usd>,
    pub reason: Option<String>,
    pub result: Option<String>,
}

// =============================================================================
// Job
// =============================================================================

/// A unit of requested research work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub priority: i64,
    /// Enqueue order; FIFO tiebreak within a priority.
    pub seq: i64,
    pub prompt: String,
    pub depth: ResearchDepth,
    /// Backend bound to this job. Every downstream read uses this value.
    pub provider: Provider,
    pub model: String,
    pub provider_job_id: Option<String>,
    pub cost_estimate: Usd,
    pub actual_cost: Option<Usd>,
    pub retry: RetryState,
    pub last_error: Option<String>,
    pub result: Option<String>,
    pub reservation_id: Option<String>,
    pub session_id: Option<String>,
    pub settlement: SettlementState,
    pub pending: Option<PendingSettlement>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Rebuild the request this job was created from.
    #[must_use]
    pub fn spec(&self) -> JobSpec {
        JobSpec {
            prompt: self.prompt.clone(),
            depth: self.depth,
            provider: Some(self.provider),
            model: Some(self.model.clone()),
        }
    }

    /// Whether a provider has accepted the job.
    #[must_use]
    pub const fn is_submitted(&self) -> bool {
        self.provider_job_id.is_some()
    }

    /// Whether a worker holds an unexpired lease at `now`.
    #[must_use]
    pub fn holds_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_expires_at.is_some_and(|at| at > now)
    }

    /// Cancelled before any provider accepted it, with nothing settled yet.
    /// The worker that holds it decides the final outcome.
    #[must_use]
    pub fn awaits_cancel_settlement(&self) -> bool {
        self.status == JobStatus::Cancelled
            && self.settlement == SettlementState::None
            && self.provider_job_id.is_none()
    }

    /// Cost charged so far: settled actual, else pending actual, else zero.
    #[must_use]
    pub fn cost_so_far(&self) -> Usd {
        self.actual_cost
            .or_else(|| self.pending.as_ref().and_then(|p| p.actual_cost))
            .unwrap_or(Usd::ZERO)
    }
}

/// Everything needed to insert a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub spec: JobSpec,
    pub priority: i64,
    pub provider: Provider,
    pub model: String,
    pub cost_estimate: Usd,
    pub reservation_id: Option<String>,
    pub session_id: Option<String>,
}

/// A validated partial update. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub provider_job_id: Option<String>,
    pub actual_cost: Option<Usd>,
    pub last_error: Option<String>,
    pub result: Option<String>,
    pub retry: Option<RetryState>,
    pub clear_lease: bool,
    /// Free-form note recorded on the status-change event.
    pub note: Option<String>,
}

impl JobPatch {
    #[must_use]
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Query filter for `JobStore::list`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub provider: Option<Provider>,
    pub min_priority: Option<i64>,
    pub max_priority: Option<i64>,
    pub submitted_after: Option<DateTime<Utc>>,
    pub submitted_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    #[must_use]
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }
}

// =============================================================================
// Collaborator-facing views
// =============================================================================

/// Answer to `get_status`. `provider` always comes from the stored job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub provider: Provider,
    pub model: String,
    pub cost_estimate: Usd,
    pub cost_so_far: Usd,
    pub error: Option<String>,
    pub retry_count: u32,
    pub provider_job_id: Option<String>,
    pub settlement: SettlementState,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            status: job.status,
            provider: job.provider,
            model: job.model.clone(),
            cost_estimate: job.cost_estimate,
            cost_so_far: job.cost_so_far(),
            error: job.last_error.clone(),
            retry_count: job.retry.retry_count,
            provider_job_id: job.provider_job_id.clone(),
            settlement: job.settlement,
        }
    }
}

/// Answer to `get_result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobResult {
    Ready { artifact: String, cost: Usd },
    NotReady { status: JobStatus },
    Failed { reason: String },
    Cancelled { reason: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_immutable() {
        for from in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(*to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn queued_only_leaves_via_dequeue_or_cancel() {
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn spec_validation() {
        assert!(JobSpec::new("  ").validate().is_err());
        assert!(JobSpec::new("x".repeat(MAX_PROMPT_CHARS + 1)).validate().is_err());
        assert!(
            JobSpec::new("ok")
                .with_provider(Provider::Unknown)
                .validate()
                .is_err()
        );
        assert!(JobSpec::new("what changed in rust 1.88?").validate().is_ok());
    }

    #[test]
    fn status_parse_roundtrip() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), *status);
        }
        assert!(JobStatus::parse("running").is_err());
    }
}
