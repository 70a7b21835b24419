//! Dispatcher and poller workers.
//!
//! Each worker loops: adopt an orphaned in-flight job, else dequeue the next
//! queued job, else sleep. A worker owns its job end to end: routing,
//! submission, polling and settlement. Retry state lives on the job row, so a
//! restart picks up exactly where the last attempt left off.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::engine::Engine;
use super::health::AttemptOutcome;
use super::models::{Job, JobPatch, JobStatus, PendingSettlement};
use super::money::Usd;
use super::pricing::TokenUsage;
use super::settlement::{settle_job, uncharged};
use crate::error::{DeepqError, Result};
use crate::providers::{ProviderStatus, ResearchProvider, SubmitOutcome, SubmitRequest};

// =============================================================================
// Configuration
// =============================================================================

/// Backoff and fallback policy for failed submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Failed attempts against one provider before it is excluded for the job.
    pub same_provider_attempts: u32,
    /// Failed attempts in total before the job fails.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            same_provider_attempts: 3,
            max_attempts: 8,
        }
    }
}

impl RetryConfig {
    /// `min(base * 2^retries, cap)`, or the provider's hint when longer.
    #[must_use]
    pub fn backoff(&self, retries: u32, hint: Option<Duration>) -> Duration {
        let factor = 1u64.checked_shl(retries.min(32)).unwrap_or(u64::MAX);
        let computed = Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_cap_ms),
        );
        hint.map_or(computed, |h| h.max(computed))
    }
}

/// Polling cadence and lease handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    /// Interval multiplier after each pending observation.
    pub growth: f64,
    pub lease_secs: u64,
    /// Consecutive poll errors before the lease is handed back.
    pub max_poll_errors: u32,
    /// Sleep when there is no work.
    pub idle_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_ms: 2_000,
            max_ms: 60_000,
            growth: 1.5,
            lease_secs: 300,
            max_poll_errors: 5,
            idle_ms: 1_000,
        }
    }
}

impl PollConfig {
    #[must_use]
    pub const fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    #[must_use]
    pub const fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    #[must_use]
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lease_secs).unwrap_or(i64::MAX / 1_000))
    }

    /// Interval after another pending observation.
    #[must_use]
    pub fn next_interval(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.growth.max(1.0))
            .min(Duration::from_millis(self.max_ms))
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Running workers and their shutdown switch.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(engine: &Engine, count: usize) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let prefix = format!("worker-{}", std::process::id());
        let handles = (0..count.max(1))
            .map(|i| {
                let worker = Worker::new(engine.clone(), format!("{prefix}-{i}"), rx.clone());
                tokio::spawn(worker.run())
            })
            .collect();
        tracing::info!(workers = count.max(1), "Workers started");
        Self { shutdown, handles }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal shutdown and wait for every worker. In-flight polls hand their
    /// lease back so the next start adopts them immediately.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Workers stopped");
    }
}

// =============================================================================
// Worker
// =============================================================================

/// One dispatcher/poller loop.
#[derive(Debug)]
pub struct Worker {
    engine: Engine,
    name: String,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    #[must_use]
    pub fn new(engine: Engine, name: impl Into<String>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            engine,
            name: name.into(),
            shutdown,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(mut self) {
        match self.engine.reconcile() {
            Ok(report) if report.settled > 0 => {
                tracing::info!(worker = %self.name, settled = report.settled, "Reconciled pending settlements");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(worker = %self.name, error = %e, "Reconciliation failed"),
        }

        let idle = self.engine.settings().poll.idle();
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let busy = match self.tick().await {
                Ok(busy) => busy,
                Err(e) => {
                    tracing::error!(worker = %self.name, error = %e, "Worker tick failed");
                    false
                }
            };
            if !busy {
                tokio::select! {
                    () = tokio::time::sleep(idle) => {}
                    changed = self.shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!(worker = %self.name, "Worker exiting");
    }

    /// Do one unit of work. Returns `false` when there was nothing to do.
    ///
    /// # Errors
    /// Returns storage errors; provider errors are handled by the retry policy.
    pub async fn tick(&self) -> Result<bool> {
        let lease = self.engine.settings().poll.lease();
        if let Some(job) = self.engine.store().adopt_orphan(&self.name, lease)? {
            self.resume(job).await?;
            return Ok(true);
        }
        if let Some(job) = self.engine.store().dequeue_next(&self.name, lease)? {
            self.dispatch(job).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn dispatch(&self, job: Job) -> Result<()> {
        let reserved = self.reserved_amount(&job)?;
        let selection = match self.engine.router().select_for_dispatch(&job, reserved) {
            Ok(selection) => selection,
            Err(e) if e.is_retryable() => return self.reschedule(&job, &e, false),
            Err(e) => return self.fail(&job, &e),
        };

        let job = if selection.provider == job.provider && selection.model == job.model {
            job
        } else {
            let patch = JobPatch {
                provider: Some(selection.provider),
                model: Some(selection.model.clone()),
                ..JobPatch::default()
            };
            match self.engine.store().update(&job.id, patch) {
                Ok(updated) => {
                    tracing::info!(
                        job_id = %job.id,
                        from = %job.provider,
                        to = %updated.provider,
                        reason = ?selection.reason,
                        "Job rerouted"
                    );
                    updated
                }
                Err(e) => {
                    if selection.probe {
                        self.engine.health_registry().release_probe(selection.provider)?;
                    }
                    return match e {
                        DeepqError::StateConflict { .. } => self.settle_if_cancelled(&job),
                        other => Err(other),
                    };
                }
            }
        };

        let adapter = match self.engine.providers().get(job.provider) {
            Ok(adapter) => adapter,
            Err(e) => {
                if selection.probe {
                    self.engine.health_registry().release_probe(job.provider)?;
                }
                return self.fail(&job, &e);
            }
        };

        let request = SubmitRequest {
            job_id: job.id.clone(),
            prompt: job.prompt.clone(),
            model: job.model.clone(),
            depth: job.depth,
        };
        tracing::info!(
            job_id = %job.id,
            provider = %job.provider,
            model = %job.model,
            attempt = job.retry.retry_count + 1,
            reason = ?selection.reason,
            "Submitting job"
        );

        let started = Instant::now();
        let result = self
            .with_timeout(job.provider, adapter.submit(&request))
            .await;
        let latency = started.elapsed();

        match result {
            Ok(outcome) => {
                self.engine
                    .health_registry()
                    .record(job.provider, AttemptOutcome::Success, latency)?;
                self.accepted(job, adapter, outcome).await
            }
            Err(e) => {
                self.engine
                    .health_registry()
                    .record(job.provider, AttemptOutcome::from_error(&e), latency)?;
                if e.is_retryable() {
                    self.reschedule(&job, &e, true)
                } else {
                    self.fail(&job, &e)
                }
            }
        }
    }

    async fn accepted(
        &self,
        job: Job,
        adapter: Arc<dyn ResearchProvider>,
        outcome: SubmitOutcome,
    ) -> Result<()> {
        let (handle, finished) = match outcome {
            SubmitOutcome::Accepted { provider_job_id } => (provider_job_id, None),
            SubmitOutcome::Finished {
                provider_job_id,
                status,
            } => (
                provider_job_id.unwrap_or_else(|| format!("{}-{}", job.provider, job.id)),
                Some(status),
            ),
        };

        let mut retry = job.retry.clone();
        retry.provider_attempts = 0;
        retry.next_attempt_at = None;
        let patch = JobPatch {
            provider_job_id: Some(handle.clone()),
            retry: Some(retry),
            ..JobPatch::default()
        };

        match self.engine.store().update(&job.id, patch) {
            Ok(job) => {
                tracing::info!(job_id = %job.id, provider_job_id = %handle, "Provider accepted job");
                match finished {
                    Some(status) => self.finish(&job, status),
                    None => self.poll_until_terminal(job, adapter, handle, true).await,
                }
            }
            Err(DeepqError::StateConflict { .. }) => {
                // Settled without us while the submission was in flight.
                tracing::warn!(job_id = %job.id, provider_job_id = %handle, "Job settled during submission");
                match finished {
                    Some(status) => self.finish(&job, status),
                    None => self.poll_until_terminal(job, adapter, handle, false).await,
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Continue an adopted in-flight job.
    async fn resume(&self, job: Job) -> Result<()> {
        let Some(handle) = job.provider_job_id.clone() else {
            if job.awaits_cancel_settlement() {
                return self.settle_cancelled(&job);
            }
            // The previous owner died before the provider confirmed anything.
            let patch = JobPatch::status(JobStatus::Queued).note("resubmitting after lost submission");
            return self.requeue(&job, patch);
        };
        match self.engine.providers().get(job.provider) {
            Ok(adapter) => self.poll_until_terminal(job, adapter, handle, true).await,
            Err(e) => {
                tracing::error!(job_id = %job.id, provider = %job.provider, error = %e, "Cannot poll adopted job");
                self.engine.store().release_lease(&job.id, &self.name)
            }
        }
    }

    /// Poll `handle` until the provider reports a terminal state, then settle.
    ///
    /// With `leased`, the worker renews its lease each round, asks the
    /// provider to stop once the job is marked cancelled, and hands the lease
    /// back on shutdown or repeated poll errors. Without it the job was
    /// already settled elsewhere: the provider is told to stop up front and
    /// any final charge is recorded late.
    async fn poll_until_terminal(
        &self,
        job: Job,
        adapter: Arc<dyn ResearchProvider>,
        handle: String,
        leased: bool,
    ) -> Result<()> {
        let poll = &self.engine.settings().poll;
        let mut interval = poll.initial();
        let mut errors = 0u32;
        let mut cancel_sent = false;
        let mut shutdown = self.shutdown.clone();

        if !leased {
            cancel_sent = true;
            self.cancel_remote(&job, adapter.as_ref(), &handle).await;
        }

        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    return self.give_up(&job, &handle, leased, "Shutting down");
                }
            }

            if leased && !self.engine.store().renew_lease(&job.id, &self.name, poll.lease())? {
                tracing::warn!(job_id = %job.id, worker = %self.name, "Lease lost; stopping poll");
                return Ok(());
            }
            let current = self.engine.store().get(&job.id)?;
            if current.status == JobStatus::Cancelled && !cancel_sent {
                cancel_sent = true;
                self.cancel_remote(&current, adapter.as_ref(), &handle).await;
            }

            let started = Instant::now();
            let result = self.with_timeout(current.provider, adapter.poll(&handle)).await;
            match result {
                Ok(ProviderStatus::Pending) => {
                    errors = 0;
                    interval = poll.next_interval(interval);
                    tracing::debug!(
                        job_id = %job.id,
                        next_poll_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                        "Still running"
                    );
                }
                Ok(status) => {
                    if matches!(status, ProviderStatus::Failed { .. }) {
                        self.engine.health_registry().record(
                            current.provider,
                            AttemptOutcome::Failure,
                            started.elapsed(),
                        )?;
                    }
                    return self.finish(&current, status);
                }
                Err(e) if e.is_retryable() => {
                    self.engine.health_registry().record(
                        current.provider,
                        AttemptOutcome::from_error(&e),
                        started.elapsed(),
                    )?;
                    errors += 1;
                    tracing::warn!(job_id = %job.id, attempt = errors, error = %e, "Poll failed");
                    if errors >= poll.max_poll_errors {
                        return self.give_up(&job, &handle, leased, "Too many poll errors");
                    }
                }
                Err(e) => {
                    self.engine.health_registry().record(
                        current.provider,
                        AttemptOutcome::from_error(&e),
                        started.elapsed(),
                    )?;
                    return self.fail(&current, &e);
                }
            }
        }
    }

    /// Stop polling. A held lease goes back so another worker adopts the job.
    fn give_up(&self, job: &Job, handle: &str, leased: bool, why: &str) -> Result<()> {
        if leased {
            tracing::warn!(job_id = %job.id, "{why}; handing back lease");
            return self.engine.store().release_lease(&job.id, &self.name);
        }
        tracing::warn!(
            job_id = %job.id,
            provider_job_id = handle,
            "{why}; provider job left unconfirmed"
        );
        Ok(())
    }

    async fn cancel_remote(&self, job: &Job, adapter: &dyn ResearchProvider, handle: &str) {
        tracing::info!(job_id = %job.id, provider_job_id = handle, "Cancelling provider job");
        if let Err(e) = self.with_timeout(job.provider, adapter.cancel(handle)).await {
            tracing::warn!(job_id = %job.id, error = %e, "Provider cancel failed");
        }
    }

    /// Settle a terminal provider state.
    fn finish(&self, job: &Job, status: ProviderStatus) -> Result<()> {
        let Some((usage, reported)) = status.charge() else {
            return Ok(());
        };
        let cost = self.actual_cost(job, &usage, reported);
        let outcome = match status {
            ProviderStatus::Pending => return Ok(()),
            ProviderStatus::Completed { output, .. } => PendingSettlement {
                status: JobStatus::Completed,
                actual_cost: Some(cost),
                reason: None,
                result: Some(output),
            },
            ProviderStatus::Failed { reason, .. } => PendingSettlement {
                status: JobStatus::Failed,
                actual_cost: charged(cost),
                reason: Some(format!("provider failure: {reason}")),
                result: None,
            },
            ProviderStatus::Cancelled { .. } => PendingSettlement {
                status: JobStatus::Cancelled,
                actual_cost: charged(cost),
                reason: Some("cancelled by provider".to_string()),
                result: None,
            },
        };
        settle_job(
            self.engine.store(),
            self.engine.ledger(),
            &job.id,
            outcome,
        )
        .map(|_| ())
        .or_else(tolerate_conflict)
    }

    /// Put the job back in the queue with backoff, or fail it when the retry
    /// budget is spent. `against_provider` counts the attempt toward excluding
    /// the current provider.
    fn reschedule(&self, job: &Job, err: &DeepqError, against_provider: bool) -> Result<()> {
        let policy = &self.engine.settings().retry;
        let mut retry = job.retry.clone();
        retry.retry_count += 1;
        if retry.retry_count >= policy.max_attempts {
            tracing::warn!(job_id = %job.id, attempts = retry.retry_count, "Retry budget exhausted");
            return self.fail(job, err);
        }
        if against_provider {
            retry.provider_attempts += 1;
            if retry.provider_attempts >= policy.same_provider_attempts
                && !retry.excluded_providers.contains(&job.provider)
            {
                tracing::info!(job_id = %job.id, provider = %job.provider, "Excluding provider for job");
                retry.excluded_providers.push(job.provider);
                retry.provider_attempts = 0;
            }
        }
        let delay = policy.backoff(retry.retry_count - 1, err.retry_after());
        retry.next_attempt_at = Some(
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1)),
        );

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            job_id = %job.id,
            provider = %job.provider,
            attempt = retry.retry_count,
            delay_ms,
            error = %err,
            "Retrying job"
        );
        let patch = JobPatch {
            status: Some(JobStatus::Queued),
            last_error: Some(err.job_reason()),
            retry: Some(retry),
            note: Some(format!("retry in {delay_ms}ms")),
            ..JobPatch::default()
        };
        self.requeue(job, patch)
    }

    /// Apply a patch that hands the job back to the queue. A job cancelled
    /// under us is settled instead so its reservation is released.
    fn requeue(&self, job: &Job, patch: JobPatch) -> Result<()> {
        match self.engine.store().update(&job.id, patch) {
            Ok(_) => Ok(()),
            Err(DeepqError::StateConflict { .. }) => self.settle_if_cancelled(job),
            Err(e) => Err(e),
        }
    }

    fn settle_if_cancelled(&self, job: &Job) -> Result<()> {
        let current = self.engine.store().get(&job.id)?;
        if current.awaits_cancel_settlement() {
            return self.settle_cancelled(&current);
        }
        Ok(())
    }

    /// Release the reservation of a job cancelled before any provider took it.
    fn settle_cancelled(&self, job: &Job) -> Result<()> {
        let reason = job
            .last_error
            .clone()
            .unwrap_or_else(|| "cancelled".to_string());
        tracing::info!(job_id = %job.id, "Settling job cancelled before submission");
        settle_job(
            self.engine.store(),
            self.engine.ledger(),
            &job.id,
            uncharged(JobStatus::Cancelled, reason),
        )
        .map(|_| ())
        .or_else(tolerate_conflict)
    }

    fn fail(&self, job: &Job, err: &DeepqError) -> Result<()> {
        tracing::warn!(job_id = %job.id, provider = %job.provider, error = %err, "Job failed");
        settle_job(
            self.engine.store(),
            self.engine.ledger(),
            &job.id,
            uncharged(JobStatus::Failed, err.job_reason()),
        )
        .map(|_| ())
        .or_else(tolerate_conflict)
    }

    fn reserved_amount(&self, job: &Job) -> Result<Usd> {
        match &job.reservation_id {
            Some(id) => Ok(self.engine.ledger().reservation(id)?.amount),
            None => Ok(job.cost_estimate),
        }
    }

    fn actual_cost(&self, job: &Job, usage: &TokenUsage, reported: Option<Usd>) -> Usd {
        reported.unwrap_or_else(|| {
            self.engine
                .router()
                .estimator()
                .cost_of(job.provider, &job.model, usage)
        })
    }

    async fn with_timeout<T>(
        &self,
        provider: crate::core::provider::Provider,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = self.engine.call_timeout(provider);
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| {
                Err(DeepqError::Timeout {
                    provider: provider.to_string(),
                    seconds: limit.as_secs(),
                })
            })
    }
}

fn charged(cost: Usd) -> Option<Usd> {
    (!cost.is_zero()).then_some(cost)
}

/// A state conflict here means someone else (cancel, reaper) moved the job.
fn tolerate_conflict(err: DeepqError) -> Result<()> {
    match err {
        DeepqError::StateConflict { job_id, from, to } => {
            tracing::debug!(job_id = %job_id, from = %from, to = %to, "Job changed concurrently; dropping work");
            Ok(())
        }
        other => Err(other),
    }
}
