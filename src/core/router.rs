//! Provider routing.
//!
//! Scores every enabled provider from its health snapshot:
//!
//! ```text
//! score = success_weight * success_rate
//!       + latency_weight * 1 / (1 + p95 / latency_ref)
//! ```
//!
//! Open circuits are never candidates. Half-open providers score at half
//! weight and can only be dispatched to by whoever holds the probe slot.
//! At submission the router binds a provider, exploring a lower-ranked
//! provider with probability `exploration`. At dispatch the bound provider is
//! used if it is available, otherwise the fallback chain applies.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::health::{CircuitState, HealthRegistry, HealthSnapshot};
use super::models::{Job, JobSpec};
use super::money::Usd;
use super::pricing::CostEstimator;
use super::provider::Provider;
use crate::error::{DeepqError, Result};

const HALF_OPEN_PENALTY: f64 = 0.5;

/// Routing weights and exploration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Probability of binding a job to a provider other than the top scorer.
    pub exploration: f64,
    pub success_weight: f64,
    pub latency_weight: f64,
    /// p95 latency (ms) at which the latency term is worth half its weight.
    pub latency_ref_ms: u64,
    /// Fixed RNG seed for reproducible exploration.
    pub seed: Option<u64>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            exploration: 0.1,
            success_weight: 0.7,
            latency_weight: 0.3,
            latency_ref_ms: 30_000,
            seed: None,
        }
    }
}

/// Why a provider was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    /// The caller pinned the provider, or the job's bound provider is available.
    Requested,
    TopScore,
    Exploration,
    /// Bound provider is half-open and this dispatch holds its probe slot.
    Probe,
    /// Next-best provider by score.
    Fallback,
    /// Cheapest provider still eligible.
    Cheapest,
}

/// A routing decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub provider: Provider,
    pub model: String,
    pub score: f64,
    pub reason: SelectionReason,
    /// Expected cost on this provider.
    pub estimate: Usd,
    /// Whether this selection holds the half-open probe slot.
    pub probe: bool,
}

/// Why a provider is not a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum Exclusion {
    Disabled,
    CircuitOpen,
    ProbeInFlight,
    OverBudget { estimate: Usd, reserved: Usd },
    ExcludedAfterFailures,
}

impl std::fmt::Display for Exclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::CircuitOpen => f.write_str("circuit_open"),
            Self::ProbeInFlight => f.write_str("probe_in_flight"),
            Self::OverBudget { estimate, reserved } => {
                write!(f, "over_budget ({estimate} > {reserved})")
            }
            Self::ExcludedAfterFailures => f.write_str("excluded_after_failures"),
        }
    }
}

/// One row of `explain` output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteExplanation {
    pub provider: Provider,
    pub model: String,
    pub score: f64,
    pub circuit_state: Option<CircuitState>,
    pub estimate: Usd,
    pub excluded: Option<Exclusion>,
}

/// A scored candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedProvider {
    pub provider: Provider,
    pub model: String,
    pub score: f64,
    pub circuit_state: CircuitState,
    pub estimate: Usd,
}

/// Chooses providers for jobs.
#[derive(Debug)]
pub struct Router {
    health: Arc<HealthRegistry>,
    estimator: CostEstimator,
    config: RoutingConfig,
    /// Enabled providers and their default models.
    enabled: BTreeMap<Provider, String>,
    rng: Mutex<StdRng>,
}

impl Router {
    #[must_use]
    pub fn new(
        health: Arc<HealthRegistry>,
        estimator: CostEstimator,
        config: RoutingConfig,
        enabled: impl IntoIterator<Item = (Provider, String)>,
    ) -> Self {
        let rng = config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            health,
            estimator,
            config,
            enabled: enabled
                .into_iter()
                .filter(|(p, _)| p.is_dispatchable())
                .collect(),
            rng: Mutex::new(rng),
        }
    }

    #[must_use]
    pub fn is_enabled(&self, provider: Provider) -> bool {
        self.enabled.contains_key(&provider)
    }

    #[must_use]
    pub const fn estimator(&self) -> &CostEstimator {
        &self.estimator
    }

    /// Model to use for `spec` on `provider`.
    #[must_use]
    pub fn model_for(&self, spec: &JobSpec, provider: Provider) -> String {
        match (&spec.model, spec.provider) {
            (Some(model), Some(p)) if p == provider => model.clone(),
            (Some(model), None) => model.clone(),
            _ => self
                .enabled
                .get(&provider)
                .cloned()
                .unwrap_or_else(|| provider.default_model().to_string()),
        }
    }

    /// Expected cost of `spec` on `provider`.
    #[must_use]
    pub fn estimate_on(&self, spec: &JobSpec, provider: Provider) -> Usd {
        let model = self.model_for(spec, provider);
        self.estimator.estimate(spec, provider, &model).expected
    }

    fn score(&self, snap: &HealthSnapshot) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let latency_term = if self.config.latency_ref_ms == 0 {
            1.0
        } else {
            1.0 / (1.0 + snap.latency_p95_ms as f64 / self.config.latency_ref_ms as f64)
        };
        let raw = self
            .config
            .success_weight
            .mul_add(snap.success_rate, self.config.latency_weight * latency_term);
        if snap.circuit_state == CircuitState::HalfOpen {
            raw * HALF_OPEN_PENALTY
        } else {
            raw
        }
    }

    /// Non-open enabled providers ordered by score, best first. Pure: takes no
    /// probe slots.
    ///
    /// # Errors
    /// Returns an error if health state cannot be read.
    pub fn rank(&self, spec: &JobSpec, excluded: &[Provider]) -> Result<Vec<RankedProvider>> {
        let mut ranked = Vec::new();
        for provider in self.enabled.keys() {
            if excluded.contains(provider) {
                continue;
            }
            let snap = self.health.snapshot(*provider)?;
            if snap.circuit_state == CircuitState::Open {
                continue;
            }
            let model = self.model_for(spec, *provider);
            ranked.push(RankedProvider {
                provider: *provider,
                estimate: self.estimator.estimate(spec, *provider, &model).expected,
                model,
                score: self.score(&snap),
                circuit_state: snap.circuit_state,
            });
        }
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.provider.cmp(&b.provider))
        });
        Ok(ranked)
    }

    /// Bind a provider for a new job.
    ///
    /// A pinned provider must be enabled. Otherwise the top scorer is used,
    /// or with probability `exploration` a random lower-ranked candidate. When
    /// every circuit is open the cheapest enabled provider is bound and the
    /// job waits for dispatch-time fallback.
    ///
    /// # Errors
    /// Returns `ProviderDisabled` or `NoEligibleProvider`.
    pub fn select_initial(&self, spec: &JobSpec) -> Result<Selection> {
        if let Some(provider) = spec.provider {
            if !self.is_enabled(provider) {
                return Err(DeepqError::ProviderDisabled(provider.to_string()));
            }
            let snap = self.health.snapshot(provider)?;
            let model = self.model_for(spec, provider);
            return Ok(Selection {
                provider,
                estimate: self.estimator.estimate(spec, provider, &model).expected,
                model,
                score: self.score(&snap),
                reason: SelectionReason::Requested,
                probe: false,
            });
        }

        let ranked = self.rank(spec, &[])?;
        if ranked.is_empty() {
            return self.cheapest_enabled(spec);
        }

        let explore = ranked.len() > 1 && {
            let mut rng = self.rng()?;
            rng.r#gen::<f64>() < self.config.exploration
        };
        let (pick, reason) = if explore {
            let index = self.rng()?.gen_range(1..ranked.len());
            (&ranked[index], SelectionReason::Exploration)
        } else {
            (&ranked[0], SelectionReason::TopScore)
        };
        if reason == SelectionReason::Exploration {
            tracing::debug!(provider = %pick.provider, "Exploring lower-ranked provider");
        }
        Ok(Selection {
            provider: pick.provider,
            model: pick.model.clone(),
            score: pick.score,
            reason,
            estimate: pick.estimate,
            probe: false,
        })
    }

    /// Choose where to send `job` now.
    ///
    /// Fallback chain: the job's bound provider, then the next-best closed
    /// provider by score, then the cheapest remaining non-open provider.
    /// Fallback candidates must cost no more than `reserved`. A half-open
    /// candidate is usable only if its probe slot can be taken; the returned
    /// selection then holds it.
    ///
    /// # Errors
    /// Returns `UnknownProvider` for jobs bound to the sentinel and
    /// `NoEligibleProvider` when the chain is exhausted.
    pub fn select_for_dispatch(&self, job: &Job, reserved: Usd) -> Result<Selection> {
        if !job.provider.is_dispatchable() {
            return Err(DeepqError::UnknownProvider {
                job_id: job.id.to_string(),
            });
        }
        let spec = job.spec();
        let excluded = &job.retry.excluded_providers;

        if self.is_enabled(job.provider) && !excluded.contains(&job.provider) {
            let snap = self.health.snapshot(job.provider)?;
            let bound = Selection {
                provider: job.provider,
                model: job.model.clone(),
                score: self.score(&snap),
                reason: SelectionReason::Requested,
                estimate: self.estimate_on(&spec, job.provider),
                probe: false,
            };
            match snap.circuit_state {
                CircuitState::Closed => return Ok(bound),
                CircuitState::HalfOpen if self.health.try_acquire_probe(job.provider)? => {
                    return Ok(Selection {
                        reason: SelectionReason::Probe,
                        probe: true,
                        ..bound
                    });
                }
                _ => {}
            }
        }

        let mut skip = excluded.clone();
        skip.push(job.provider);
        let candidates: Vec<RankedProvider> = self
            .rank(&spec, &skip)?
            .into_iter()
            .filter(|c| c.estimate <= reserved)
            .collect();

        if let Some(best) = candidates
            .iter()
            .find(|c| c.circuit_state == CircuitState::Closed)
        {
            tracing::info!(
                job_id = %job.id,
                from = %job.provider,
                to = %best.provider,
                "Falling back to next-best provider"
            );
            return Ok(Self::selection(best, SelectionReason::Fallback, false));
        }

        let mut by_cost: Vec<&RankedProvider> = candidates.iter().collect();
        by_cost.sort_by_key(|c| (c.estimate, c.provider));
        for candidate in by_cost {
            if self.health.try_acquire_probe(candidate.provider)? {
                return Ok(Self::selection(candidate, SelectionReason::Cheapest, true));
            }
        }

        let reasons: Vec<String> = self
            .explain(&spec, excluded, Some(reserved))?
            .into_iter()
            .filter_map(|e| e.excluded.map(|x| format!("{}: {x}", e.provider)))
            .collect();
        Err(DeepqError::NoEligibleProvider {
            reason: if reasons.is_empty() {
                "no providers enabled".to_string()
            } else {
                reasons.join(", ")
            },
        })
    }

    /// Per-provider score, circuit state and exclusion reason.
    ///
    /// # Errors
    /// Returns an error if health state cannot be read.
    pub fn explain(
        &self,
        spec: &JobSpec,
        excluded: &[Provider],
        reserved: Option<Usd>,
    ) -> Result<Vec<RouteExplanation>> {
        let mut rows = Vec::with_capacity(Provider::ALL.len());
        for provider in Provider::ALL {
            let model = self.model_for(spec, *provider);
            let estimate = self.estimator.estimate(spec, *provider, &model).expected;
            if !self.is_enabled(*provider) {
                rows.push(RouteExplanation {
                    provider: *provider,
                    model,
                    score: 0.0,
                    circuit_state: None,
                    estimate,
                    excluded: Some(Exclusion::Disabled),
                });
                continue;
            }
            let snap = self.health.snapshot(*provider)?;
            let exclusion = if excluded.contains(provider) {
                Some(Exclusion::ExcludedAfterFailures)
            } else if snap.circuit_state == CircuitState::Open {
                Some(Exclusion::CircuitOpen)
            } else if snap.circuit_state == CircuitState::HalfOpen && snap.probe_in_flight {
                Some(Exclusion::ProbeInFlight)
            } else {
                reserved
                    .filter(|r| estimate > *r)
                    .map(|r| Exclusion::OverBudget {
                        estimate,
                        reserved: r,
                    })
            };
            rows.push(RouteExplanation {
                provider: *provider,
                model,
                score: self.score(&snap),
                circuit_state: Some(snap.circuit_state),
                estimate,
                excluded: exclusion,
            });
        }
        Ok(rows)
    }

    /// Cheapest enabled provider regardless of circuit state.
    fn cheapest_enabled(&self, spec: &JobSpec) -> Result<Selection> {
        self.enabled
            .keys()
            .map(|p| (self.estimate_on(spec, *p), *p))
            .min()
            .map(|(estimate, provider)| Selection {
                provider,
                model: self.model_for(spec, provider),
                score: 0.0,
                reason: SelectionReason::Cheapest,
                estimate,
                probe: false,
            })
            .ok_or_else(|| DeepqError::NoEligibleProvider {
                reason: "no providers enabled".to_string(),
            })
    }

    fn selection(candidate: &RankedProvider, reason: SelectionReason, probe: bool) -> Selection {
        Selection {
            provider: candidate.provider,
            model: candidate.model.clone(),
            score: candidate.score,
            reason,
            estimate: candidate.estimate,
            probe,
        }
    }

    fn rng(&self) -> Result<std::sync::MutexGuard<'_, StdRng>> {
        self.rng
            .lock()
            .map_err(|_| DeepqError::Storage("router rng lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::EventBus;
    use crate::core::health::{AttemptOutcome, CircuitConfig};
    use crate::core::models::{JobId, JobStatus, ResearchDepth, RetryState, SettlementState};
    use crate::storage::schema::Database;
    use chrono::Utc;
    use std::time::Duration;

    fn router_with(config: RoutingConfig, circuit: CircuitConfig) -> Router {
        let health = Arc::new(
            HealthRegistry::new(Database::open_in_memory().unwrap(), circuit, EventBus::default())
                .unwrap(),
        );
        Router::new(
            health,
            CostEstimator::default(),
            config,
            Provider::ALL
                .iter()
                .map(|p| (*p, p.default_model().to_string())),
        )
    }

    fn no_explore() -> RoutingConfig {
        RoutingConfig {
            exploration: 0.0,
            seed: Some(7),
            ..RoutingConfig::default()
        }
    }

    fn job_on(provider: Provider) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::generate(),
            status: JobStatus::Processing,
            priority: 0,
            seq: 1,
            prompt: "compare vector databases".into(),
            depth: ResearchDepth::Standard,
            provider,
            model: provider.default_model().into(),
            provider_job_id: None,
            cost_estimate: Usd::from_dollars(5.0),
            actual_cost: None,
            retry: RetryState::default(),
            last_error: None,
            result: None,
            reservation_id: None,
            session_id: None,
            settlement: SettlementState::None,
            pending: None,
            lease_owner: None,
            lease_expires_at: None,
            submitted_at: now,
            started_at: Some(now),
            completed_at: None,
            updated_at: now,
        }
    }

    fn open_circuit(router: &Router, provider: Provider) {
        for _ in 0..5 {
            router
                .health
                .record(provider, AttemptOutcome::Failure, Duration::from_millis(5))
                .unwrap();
        }
    }

    #[test]
    fn rank_excludes_open_circuits() {
        let router = router_with(no_explore(), CircuitConfig::default());
        open_circuit(&router, Provider::OpenAi);
        let ranked = router.rank(&JobSpec::new("x"), &[]).unwrap();
        assert!(ranked.iter().all(|r| r.provider != Provider::OpenAi));
        assert_eq!(ranked.len(), 3);
    }

    #[test]
    fn healthier_provider_ranks_higher() {
        let router = router_with(no_explore(), CircuitConfig::default());
        router
            .health
            .record(Provider::OpenAi, AttemptOutcome::Failure, Duration::from_millis(5))
            .unwrap();
        let ranked = router.rank(&JobSpec::new("x"), &[]).unwrap();
        assert_eq!(ranked.last().unwrap().provider, Provider::OpenAi);
    }

    #[test]
    fn bound_provider_is_used_when_closed() {
        let router = router_with(no_explore(), CircuitConfig::default());
        let job = job_on(Provider::Grok);
        let selection = router.select_for_dispatch(&job, job.cost_estimate).unwrap();
        assert_eq!(selection.provider, Provider::Grok);
        assert_eq!(selection.reason, SelectionReason::Requested);
    }

    #[test]
    fn open_bound_provider_falls_back() {
        let router = router_with(no_explore(), CircuitConfig::default());
        open_circuit(&router, Provider::OpenAi);
        let job = job_on(Provider::OpenAi);
        let selection = router.select_for_dispatch(&job, job.cost_estimate).unwrap();
        assert_ne!(selection.provider, Provider::OpenAi);
        assert_eq!(selection.reason, SelectionReason::Fallback);
    }

    #[test]
    fn fallback_must_fit_reservation() {
        let router = router_with(no_explore(), CircuitConfig::default());
        open_circuit(&router, Provider::OpenAi);
        let job = job_on(Provider::OpenAi);
        let err = router.select_for_dispatch(&job, Usd::from_micros(1)).unwrap_err();
        assert!(matches!(err, DeepqError::NoEligibleProvider { .. }));
        assert!(err.to_string().contains("over_budget"));
        assert!(err.is_retryable());
    }

    #[test]
    fn half_open_bound_provider_takes_single_probe() {
        let router = router_with(
            no_explore(),
            CircuitConfig {
                cooldown_ms: 1,
                ..CircuitConfig::default()
            },
        );
        open_circuit(&router, Provider::Azure);
        std::thread::sleep(Duration::from_millis(5));
        let job = job_on(Provider::Azure);
        let first = router.select_for_dispatch(&job, job.cost_estimate).unwrap();
        assert_eq!(first.reason, SelectionReason::Probe);
        assert!(first.probe);
        let second = router.select_for_dispatch(&job, job.cost_estimate).unwrap();
        assert_ne!(second.provider, Provider::Azure);
    }

    #[test]
    fn exploration_always_picks_lower_ranked() {
        let router = router_with(
            RoutingConfig {
                exploration: 1.0,
                seed: Some(42),
                ..RoutingConfig::default()
            },
            CircuitConfig::default(),
        );
        let spec = JobSpec::new("x");
        let top = router.rank(&spec, &[]).unwrap()[0].provider;
        for _ in 0..20 {
            let s = router.select_initial(&spec).unwrap();
            assert_eq!(s.reason, SelectionReason::Exploration);
            assert_ne!(s.provider, top);
        }
    }

    #[test]
    fn pinned_provider_must_be_enabled() {
        let health = Arc::new(
            HealthRegistry::new(
                Database::open_in_memory().unwrap(),
                CircuitConfig::default(),
                EventBus::default(),
            )
            .unwrap(),
        );
        let router = Router::new(
            health,
            CostEstimator::default(),
            no_explore(),
            [(Provider::Gemini, "gemini-2.5-flash".to_string())],
        );
        let spec = JobSpec::new("x").with_provider(Provider::OpenAi);
        assert!(matches!(
            router.select_initial(&spec),
            Err(DeepqError::ProviderDisabled(_))
        ));
        let explained = router.explain(&spec, &[], None).unwrap();
        let openai = explained
            .iter()
            .find(|e| e.provider == Provider::OpenAi)
            .unwrap();
        assert_eq!(openai.excluded, Some(Exclusion::Disabled));
    }

    #[test]
    fn explain_reports_excluded_after_failures() {
        let router = router_with(no_explore(), CircuitConfig::default());
        let rows = router
            .explain(&JobSpec::new("x"), &[Provider::Grok], None)
            .unwrap();
        let grok = rows.iter().find(|r| r.provider == Provider::Grok).unwrap();
        assert_eq!(grok.excluded, Some(Exclusion::ExcludedAfterFailures));
    }
}
