//! The engine facade.
//!
//! Wires the job store, budget ledger, health registry, router, provider set
//! and event bus together and exposes the collaborator-facing operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::budgets::{BudgetLedger, BudgetLimits, BudgetWarning, LedgerStatus};
use super::dispatcher::{PollConfig, RetryConfig, WorkerPool};
use super::events::{EngineEvent, EventBus, JobEvent};
use super::health::{CircuitConfig, HealthRegistry, HealthSnapshot};
use super::models::{
    BudgetConstraints, Job, JobFilter, JobId, JobPatch, JobResult, JobSpec, JobStatus,
    JobStatusView, NewJob,
};
use super::pricing::{CostEstimate, CostEstimator, PricingTable};
use super::provider::Provider;
use super::router::{RouteExplanation, Router, RoutingConfig, SelectionReason};
use super::settlement::{complete_pending, settle_job, uncharged};
use crate::error::{DeepqError, Result};
use crate::providers::ProviderSet;
use crate::storage::config::Config;
use crate::storage::jobs::JobStore;
use crate::storage::schema::Database;

/// Staleness limits for `reap_stale`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub queued_timeout_secs: u64,
    pub processing_timeout_secs: u64,
    /// How often `run` reaps. Zero disables the periodic reaper.
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            queued_timeout_secs: 24 * 3600,
            processing_timeout_secs: 6 * 3600,
            interval_secs: 300,
        }
    }
}

impl ReaperConfig {
    #[must_use]
    pub fn queued_timeout(&self) -> chrono::Duration {
        secs(self.queued_timeout_secs)
    }

    #[must_use]
    pub fn processing_timeout(&self) -> chrono::Duration {
        secs(self.processing_timeout_secs)
    }
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

/// Worker-side tuning.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub retry: RetryConfig,
    pub poll: PollConfig,
    pub reaper: ReaperConfig,
    /// Overrides every provider's default per-call timeout.
    pub call_timeout: Option<Duration>,
}

/// A collaborator's submission.
#[derive(Debug, Clone)]
pub struct SubmitJob {
    pub spec: JobSpec,
    pub priority: i64,
    pub constraints: BudgetConstraints,
}

impl SubmitJob {
    #[must_use]
    pub fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            priority: 0,
            constraints: BudgetConstraints::default(),
        }
    }

    #[must_use]
    pub const fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn constraints(mut self, constraints: BudgetConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Accepted submission.
#[derive(Debug, Clone, Serialize)]
pub struct Submitted {
    pub job_id: JobId,
    pub provider: Provider,
    pub model: String,
    pub reason: SelectionReason,
    pub estimate: CostEstimate,
    pub warnings: Vec<BudgetWarning>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapReport {
    pub cancelled: Vec<JobId>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Pending settlements completed.
    pub settled: usize,
    /// Settlements that failed again, with the error.
    pub failed: Vec<(JobId, String)>,
    /// Live jobs bound to the `unknown` provider; they need operator action.
    pub unknown_provider: Vec<JobId>,
}

struct Inner {
    store: JobStore,
    ledger: BudgetLedger,
    health: Arc<HealthRegistry>,
    router: Router,
    providers: ProviderSet,
    events: EventBus,
    settings: EngineSettings,
}

/// Shared engine handle. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("providers", &self.inner.providers)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

/// Step-by-step engine construction.
#[derive(Debug)]
pub struct EngineBuilder {
    db: Database,
    providers: ProviderSet,
    budget: BudgetLimits,
    circuit: CircuitConfig,
    routing: RoutingConfig,
    pricing: PricingTable,
    settings: EngineSettings,
    event_capacity: usize,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            providers: ProviderSet::new(),
            budget: BudgetLimits::default(),
            circuit: CircuitConfig::default(),
            routing: RoutingConfig::default(),
            pricing: PricingTable::current(),
            settings: EngineSettings::default(),
            event_capacity: 1024,
        }
    }

    #[must_use]
    pub fn providers(mut self, providers: ProviderSet) -> Self {
        self.providers = providers;
        self
    }

    #[must_use]
    pub fn budget(mut self, budget: BudgetLimits) -> Self {
        self.budget = budget;
        self
    }

    #[must_use]
    pub fn circuit(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = circuit;
        self
    }

    #[must_use]
    pub fn routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    #[must_use]
    pub fn pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub const fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// # Errors
    /// Returns an error if persisted health state cannot be restored.
    pub fn build(self) -> Result<Engine> {
        let events = EventBus::new(self.event_capacity);
        let health = Arc::new(HealthRegistry::new(
            self.db.clone(),
            self.circuit,
            events.clone(),
        )?);
        let router = Router::new(
            Arc::clone(&health),
            CostEstimator::new(self.pricing),
            self.routing,
            self.providers.enabled(),
        );
        if self.providers.is_empty() {
            tracing::warn!("No providers enabled; jobs cannot be submitted");
        }
        Ok(Engine {
            inner: Arc::new(Inner {
                store: JobStore::new(self.db.clone(), events.clone()),
                ledger: BudgetLedger::new(self.db, self.budget, events.clone()),
                health,
                router,
                providers: self.providers,
                events,
                settings: self.settings,
            }),
        })
    }
}

impl Engine {
    #[must_use]
    pub fn builder(db: Database) -> EngineBuilder {
        EngineBuilder::new(db)
    }

    /// Build an engine from a loaded configuration.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or a provider client
    /// cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let db = Database::open(&config.database_path())?;
        let providers = ProviderSet::from_config(config)?;
        Self::builder(db)
            .providers(providers)
            .budget(config.budget.clone())
            .circuit(config.circuit.clone())
            .routing(config.routing.clone())
            .settings(EngineSettings {
                retry: config.retry.clone(),
                poll: config.poll.clone(),
                reaper: config.reaper.clone(),
                call_timeout: config.general.call_timeout_secs.map(Duration::from_secs),
            })
            .build()
    }

    // -------------------------------------------------------------------------
    // Component access
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    #[must_use]
    pub fn ledger(&self) -> &BudgetLedger {
        &self.inner.ledger
    }

    #[must_use]
    pub fn health_registry(&self) -> &HealthRegistry {
        &self.inner.health
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    #[must_use]
    pub fn providers(&self) -> &ProviderSet {
        &self.inner.providers
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Per-call I/O limit for `provider`.
    #[must_use]
    pub fn call_timeout(&self, provider: Provider) -> Duration {
        self.inner
            .settings
            .call_timeout
            .unwrap_or_else(|| provider.default_timeout())
    }

    // -------------------------------------------------------------------------
    // Collaborator operations
    // -------------------------------------------------------------------------

    /// Admit and enqueue a job.
    ///
    /// The provider is bound here and stored with the job. Rejections name
    /// the exhausted scope and shortfall; nothing is persisted on rejection.
    ///
    /// # Errors
    /// Returns `InvalidRequest`, `ProviderDisabled`, `NoEligibleProvider`,
    /// `BudgetExceeded`, `LedgerPaused` or a storage error.
    pub fn submit(&self, request: SubmitJob) -> Result<Submitted> {
        request.spec.validate()?;
        let selection = self.inner.router.select_initial(&request.spec)?;
        let estimate =
            self.inner
                .router
                .estimator()
                .estimate(&request.spec, selection.provider, &selection.model);

        let id = JobId::generate();
        let admission = self
            .inner
            .ledger
            .admit(&id, estimate.expected, &request.constraints)?;

        let new = NewJob {
            id: id.clone(),
            spec: request.spec,
            priority: request.priority,
            provider: selection.provider,
            model: selection.model.clone(),
            cost_estimate: estimate.expected,
            reservation_id: Some(admission.reservation.id.clone()),
            session_id: request.constraints.session_id.clone(),
        };
        if let Err(e) = self.inner.store.enqueue(new) {
            if let Err(release) = self.inner.ledger.release(&admission.reservation.id) {
                tracing::error!(job_id = %id, error = %release, "Failed to release reservation after enqueue failure");
            }
            return Err(e);
        }

        Ok(Submitted {
            job_id: id,
            provider: selection.provider,
            model: selection.model,
            reason: selection.reason,
            estimate,
            warnings: admission.warnings,
        })
    }

    /// Status from the stored job; the provider is never defaulted.
    ///
    /// # Errors
    /// Returns `JobNotFound` or a storage error.
    pub fn get_status(&self, id: &JobId) -> Result<JobStatusView> {
        Ok(JobStatusView::from(&self.inner.store.get(id)?))
    }

    /// # Errors
    /// Returns `JobNotFound` or a storage error.
    pub fn get_result(&self, id: &JobId) -> Result<JobResult> {
        let job = self.inner.store.get(id)?;
        Ok(match job.status {
            JobStatus::Completed => JobResult::Ready {
                artifact: job.result.clone().unwrap_or_default(),
                cost: job.cost_so_far(),
            },
            JobStatus::Failed => JobResult::Failed {
                reason: job
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            },
            JobStatus::Cancelled => JobResult::Cancelled {
                reason: job.last_error.clone(),
            },
            status => JobResult::NotReady { status },
        })
    }

    /// Cancel a job.
    ///
    /// Queued jobs, and jobs whose worker lease has lapsed before the provider
    /// accepted them, are cancelled and their reservation released at once.
    /// Jobs a worker still holds, or that a provider has accepted, are only
    /// marked cancelled; the worker stops the remote job and settles whatever
    /// it charged.
    ///
    /// # Errors
    /// Returns `StateConflict` for terminal jobs, `JobNotFound`, or a
    /// settlement error.
    pub fn cancel(&self, id: &JobId, reason: &str) -> Result<JobStatusView> {
        let job = self.inner.store.get(id)?;
        if job.status.is_terminal() {
            return Err(DeepqError::StateConflict {
                job_id: id.to_string(),
                from: job.status.to_string(),
                to: JobStatus::Cancelled.to_string(),
            });
        }

        let (updated, deferred) = self.stop(&job, format!("cancelled: {reason}"))?;
        tracing::info!(job_id = %id, in_flight = deferred, "Job cancelled");
        Ok(JobStatusView::from(&updated))
    }

    /// Move a live job to `cancelled`. Returns the stored job and whether
    /// settlement was left to the worker that holds it.
    fn stop(&self, job: &Job, reason: String) -> Result<(Job, bool)> {
        let held = job.status == JobStatus::Processing && job.holds_live_lease(Utc::now());
        if job.is_submitted() || held {
            let updated = self.inner.store.update(
                &job.id,
                JobPatch {
                    status: Some(JobStatus::Cancelled),
                    last_error: Some(reason.clone()),
                    note: Some(reason),
                    ..JobPatch::default()
                },
            )?;
            return Ok((updated, true));
        }

        let settled = settle_job(
            &self.inner.store,
            &self.inner.ledger,
            &job.id,
            uncharged(JobStatus::Cancelled, reason),
        )?;
        let updated = match settled {
            Some(job) => job,
            None => self.inner.store.get(&job.id)?,
        };
        Ok((updated, false))
    }

    /// # Errors
    /// Returns a storage error.
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.inner.store.list(filter)
    }

    /// Status-change history for one job.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn events(&self, id: &JobId) -> Result<Vec<JobEvent>> {
        self.inner.store.events(id)
    }

    /// Cancel jobs stuck beyond the configured timeouts.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn reap_stale(&self) -> Result<ReapReport> {
        let reaper = &self.inner.settings.reaper;
        self.reap_stale_with(reaper.queued_timeout(), reaper.processing_timeout())
    }

    /// Cancel queued jobs older than `queued_timeout` and processing jobs
    /// started before `processing_timeout`. Each job is reaped at most once.
    ///
    /// Queued jobs and abandoned unsubmitted ones release their reservation
    /// here. A job with a provider handle, or one a worker still holds, stays
    /// pollable: its worker (or whoever adopts it) stops the remote job and
    /// settles what the provider charged.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn reap_stale_with(
        &self,
        queued_timeout: chrono::Duration,
        processing_timeout: chrono::Duration,
    ) -> Result<ReapReport> {
        let mut report = ReapReport::default();
        for job in self.inner.store.stale_jobs(queued_timeout, processing_timeout)? {
            let reason = format!("reaped: {} beyond timeout", job.status);
            match self.stop(&job, reason) {
                Ok((_, deferred)) => {
                    tracing::info!(
                        job_id = %job.id,
                        was = %job.status,
                        deferred,
                        "Reaped stale job"
                    );
                    report.cancelled.push(job.id);
                }
                Err(DeepqError::StateConflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Finish interrupted settlements and report jobs no worker can run.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for job in self.inner.store.pending_settlements()? {
            match complete_pending(&self.inner.store, &self.inner.ledger, &job) {
                Ok(_) => report.settled += 1,
                Err(e) => report.failed.push((job.id.clone(), e.to_string())),
            }
        }

        let stranded = JobFilter {
            statuses: vec![JobStatus::Queued, JobStatus::Processing],
            provider: Some(Provider::Unknown),
            ..JobFilter::default()
        };
        for job in self.inner.store.list(&stranded)? {
            tracing::warn!(job_id = %job.id, "Job bound to unknown provider needs operator action");
            report.unknown_provider.push(job.id);
        }
        if report.settled > 0 || !report.failed.is_empty() {
            tracing::info!(
                settled = report.settled,
                failed = report.failed.len(),
                "Reconciliation finished"
            );
        }
        Ok(report)
    }

    /// Why each provider would or would not take `spec` right now.
    ///
    /// # Errors
    /// Returns an error if health state cannot be read.
    pub fn explain_routing(&self, spec: &JobSpec) -> Result<Vec<RouteExplanation>> {
        self.inner.router.explain(spec, &[], None)
    }

    /// Estimate for `spec` on the provider routing would bind now.
    ///
    /// # Errors
    /// Returns routing errors.
    pub fn estimate(&self, spec: &JobSpec) -> Result<CostEstimate> {
        spec.validate()?;
        let provider = match spec.provider {
            Some(p) => p,
            None => self
                .inner
                .router
                .rank(spec, &[])?
                .first()
                .map(|r| r.provider)
                .ok_or_else(|| DeepqError::NoEligibleProvider {
                    reason: "no provider is currently routable".to_string(),
                })?,
        };
        let model = self.inner.router.model_for(spec, provider);
        Ok(self.inner.router.estimator().estimate(spec, provider, &model))
    }

    /// # Errors
    /// Returns a storage error.
    pub fn health(&self) -> Result<Vec<HealthSnapshot>> {
        self.inner.health.snapshots()
    }

    /// # Errors
    /// Returns a storage error.
    pub fn budget(&self) -> Result<LedgerStatus> {
        self.inner.ledger.status()
    }

    /// # Errors
    /// Returns a storage error.
    pub fn pause(&self, reason: &str) -> Result<()> {
        self.inner.ledger.pause(reason)
    }

    /// # Errors
    /// Returns a storage error.
    pub fn resume(&self) -> Result<()> {
        self.inner.ledger.resume()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Start `count` dispatcher/poller workers on the current runtime.
    #[must_use]
    pub fn spawn_workers(&self, count: usize) -> WorkerPool {
        WorkerPool::spawn(self, count)
    }

    /// Delete settled terminal jobs older than `retention_days`.
    ///
    /// # Errors
    /// Returns `Config` for a non-positive window or a storage error.
    pub fn cleanup(&self, retention_days: i64) -> Result<usize> {
        self.inner.store.cleanup(retention_days)
    }
}
