//! Provider health registry and circuit breaker.
//!
//! Each provider has its own mutex, so recording an outcome for one backend
//! never blocks another. Statistics change only when a dispatch attempt
//! completes; selection reads them and may take the single half-open probe
//! slot, nothing else.
//!
//! ## Circuit states
//!
//! - `closed -> open` after `failure_threshold` consecutive failures, or when
//!   the failure rate over `rate_window_secs` exceeds `failure_rate` with at
//!   least `min_samples` outcomes.
//! - `open -> half_open` once `cooldown_ms` has elapsed (checked lazily).
//! - `half_open -> closed` on a success, `half_open -> open` on a failure.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::events::{EventBus, HealthEvent};
use super::provider::Provider;
use crate::error::{DeepqError, Result};
use crate::storage::schema::Database;
use crate::util::time::{parse_opt_timestamp, to_db_timestamp};

// =============================================================================
// Configuration
// =============================================================================

/// Circuit breaker and statistics tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Failure fraction over the rate window that opens the circuit.
    pub failure_rate: f64,
    pub rate_window_secs: u64,
    /// Outcomes required in the window before the rate rule applies.
    pub min_samples: usize,
    pub cooldown_ms: u64,
    /// Weight of the newest outcome in the success-rate average.
    pub ewma_alpha: f64,
    /// Latency samples kept for percentiles.
    pub latency_window: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate: 0.5,
            rate_window_secs: 3600,
            min_samples: 10,
            cooldown_ms: 60_000,
            ewma_alpha: 0.2,
            latency_window: 100,
        }
    }
}

impl CircuitConfig {
    fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.cooldown_ms).unwrap_or(i64::MAX))
    }

    fn rate_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.rate_window_secs).unwrap_or(i64::MAX))
    }
}

// =============================================================================
// Public types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            other => Err(DeepqError::Storage(format!("unknown circuit state '{other}'"))),
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one dispatch attempt as far as provider health is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Transport, availability, rate limit or credential failure.
    Failure,
    /// The provider answered but rejected this particular request.
    Neutral,
}

impl AttemptOutcome {
    #[must_use]
    pub const fn from_error(err: &DeepqError) -> Self {
        if err.counts_against_provider() {
            Self::Failure
        } else {
            Self::Neutral
        }
    }
}

/// Point-in-time view of a provider's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub provider: Provider,
    pub success_rate: f64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub consecutive_failures: u32,
    pub circuit_state: CircuitState,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub probe_in_flight: bool,
    pub window_samples: usize,
    pub window_failure_rate: f64,
    pub total_successes: u64,
    pub total_failures: u64,
}

// =============================================================================
// Per-provider state
// =============================================================================

#[derive(Debug)]
struct ProviderHealth {
    success_rate: f64,
    latencies: VecDeque<u64>,
    /// Percentiles restored from storage, used until fresh samples arrive.
    restored_latency: Option<(u64, u64, u64)>,
    outcomes: VecDeque<(DateTime<Utc>, bool)>,
    consecutive_failures: u32,
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            latencies: VecDeque::new(),
            restored_latency: None,
            outcomes: VecDeque::new(),
            consecutive_failures: 0,
            state: CircuitState::Closed,
            opened_at: None,
            cooldown_until: None,
            probe_in_flight: false,
            total_successes: 0,
            total_failures: 0,
        }
    }
}

impl ProviderHealth {
    fn percentiles(&self) -> (u64, u64, u64) {
        if self.latencies.is_empty() {
            return self.restored_latency.unwrap_or((0, 0, 0));
        }
        let mut sorted: Vec<u64> = self.latencies.iter().copied().collect();
        sorted.sort_unstable();
        (
            percentile(&sorted, 0.50),
            percentile(&sorted, 0.95),
            percentile(&sorted, 0.99),
        )
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|(_, ok)| !ok).count();
        #[allow(clippy::cast_precision_loss)]
        let rate = failures as f64 / self.outcomes.len() as f64;
        rate
    }

    fn prune(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while self
            .outcomes
            .front()
            .is_some_and(|(at, _)| *at < now - window)
        {
            self.outcomes.pop_front();
        }
    }

    fn open(&mut self, now: DateTime<Utc>, config: &CircuitConfig) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.cooldown_until = Some(now + config.cooldown());
        self.probe_in_flight = false;
    }

    /// Lazy `open -> half_open` once the cooldown has passed.
    fn refresh(&mut self, now: DateTime<Utc>) -> Option<(CircuitState, CircuitState)> {
        if self.state == CircuitState::Open && self.cooldown_until.is_none_or(|until| now >= until) {
            self.state = CircuitState::HalfOpen;
            self.probe_in_flight = false;
            return Some((CircuitState::Open, CircuitState::HalfOpen));
        }
        None
    }

    fn snapshot(&self, provider: Provider) -> HealthSnapshot {
        let (p50, p95, p99) = self.percentiles();
        HealthSnapshot {
            provider,
            success_rate: self.success_rate,
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            consecutive_failures: self.consecutive_failures,
            circuit_state: self.state,
            opened_at: self.opened_at,
            cooldown_until: self.cooldown_until,
            probe_in_flight: self.probe_in_flight,
            window_samples: self.outcomes.len(),
            window_failure_rate: self.failure_rate(),
            total_successes: self.total_successes,
            total_failures: self.total_failures,
        }
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

// =============================================================================
// Registry
// =============================================================================

/// Owner of all provider health state.
#[derive(Debug)]
pub struct HealthRegistry {
    db: Database,
    config: CircuitConfig,
    events: EventBus,
    entries: HashMap<Provider, Mutex<ProviderHealth>>,
}

impl HealthRegistry {
    /// Build the registry, restoring persisted state for every provider.
    ///
    /// # Errors
    /// Returns a storage error if persisted rows cannot be read.
    pub fn new(db: Database, config: CircuitConfig, events: EventBus) -> Result<Self> {
        let mut entries: HashMap<Provider, ProviderHealth> = Provider::ALL
            .iter()
            .map(|p| (*p, ProviderHealth::default()))
            .collect();

        {
            let conn = db.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT provider, success_rate, latency_p50_ms, latency_p95_ms, latency_p99_ms, \
                     consecutive_failures, circuit_state, opened_at, cooldown_until, \
                     total_successes, total_failures FROM provider_health",
                )
                .map_err(|e| DeepqError::storage("prepare health restore", e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        (row.get::<_, i64>(2)?, row.get::<_, i64>(3)?, row.get::<_, i64>(4)?),
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        (row.get::<_, i64>(9)?, row.get::<_, i64>(10)?),
                    ))
                })
                .map_err(|e| DeepqError::storage("query health restore", e))?;
            for row in rows {
                let (name, rate, (p50, p95, p99), consecutive, state, opened, until, (ok, fail)) =
                    row.map_err(|e| DeepqError::storage("read health row", e))?;
                let Ok(provider) = Provider::from_cli_name(&name) else {
                    tracing::warn!(provider = %name, "Ignoring health row for unknown provider");
                    continue;
                };
                let Some(entry) = entries.get_mut(&provider) else {
                    continue;
                };
                entry.success_rate = rate;
                entry.restored_latency = Some((to_u64(p50), to_u64(p95), to_u64(p99)));
                entry.consecutive_failures = u32::try_from(consecutive).unwrap_or(0);
                entry.state = CircuitState::parse(&state)?;
                entry.opened_at = parse_opt_timestamp(opened)?;
                entry.cooldown_until = parse_opt_timestamp(until)?;
                entry.total_successes = to_u64(ok);
                entry.total_failures = to_u64(fail);
            }
        }

        Ok(Self {
            db,
            config,
            events,
            entries: entries.into_iter().map(|(p, h)| (p, Mutex::new(h))).collect(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn entry(&self, provider: Provider) -> Result<MutexGuard<'_, ProviderHealth>> {
        self.entries
            .get(&provider)
            .ok_or_else(|| DeepqError::InvalidProvider(provider.to_string()))?
            .lock()
            .map_err(|_| DeepqError::Storage(format!("health lock poisoned for {provider}")))
    }

    /// Current snapshot, applying any due `open -> half_open` transition.
    ///
    /// # Errors
    /// Returns `InvalidProvider` for the `unknown` sentinel.
    pub fn snapshot(&self, provider: Provider) -> Result<HealthSnapshot> {
        let now = Utc::now();
        let mut entry = self.entry(provider)?;
        if let Some((from, to)) = entry.refresh(now) {
            self.persist(provider, &entry, now)?;
            self.emit(provider, from, to, now);
        }
        Ok(entry.snapshot(provider))
    }

    /// Snapshots for every provider.
    ///
    /// # Errors
    /// Returns a storage error if a lazy transition cannot be persisted.
    pub fn snapshots(&self) -> Result<Vec<HealthSnapshot>> {
        Provider::ALL.iter().map(|p| self.snapshot(*p)).collect()
    }

    /// Take the half-open probe slot. Returns `false` if the circuit is not
    /// half-open or a probe is already in flight.
    ///
    /// # Errors
    /// Returns `InvalidProvider` for the `unknown` sentinel.
    pub fn try_acquire_probe(&self, provider: Provider) -> Result<bool> {
        let now = Utc::now();
        let mut entry = self.entry(provider)?;
        if let Some((from, to)) = entry.refresh(now) {
            self.persist(provider, &entry, now)?;
            self.emit(provider, from, to, now);
        }
        if entry.state == CircuitState::HalfOpen && !entry.probe_in_flight {
            entry.probe_in_flight = true;
            tracing::info!(provider = %provider, "Probe slot acquired");
            return Ok(true);
        }
        Ok(false)
    }

    /// Give back a probe slot that was taken but never used.
    ///
    /// # Errors
    /// Returns `InvalidProvider` for the `unknown` sentinel.
    pub fn release_probe(&self, provider: Provider) -> Result<()> {
        self.entry(provider)?.probe_in_flight = false;
        Ok(())
    }

    /// Record the outcome of a completed attempt.
    ///
    /// # Errors
    /// Returns a storage error if the new state cannot be persisted.
    pub fn record(&self, provider: Provider, outcome: AttemptOutcome, latency: Duration) -> Result<()> {
        let now = Utc::now();
        let config = &self.config;
        let mut entry = self.entry(provider)?;
        let mut transitions = Vec::new();
        if let Some(t) = entry.refresh(now) {
            transitions.push(t);
        }

        entry
            .latencies
            .push_back(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
        while entry.latencies.len() > config.latency_window.max(1) {
            entry.latencies.pop_front();
        }

        let before = entry.state;
        match outcome {
            AttemptOutcome::Success => {
                entry.success_rate =
                    config.ewma_alpha.mul_add(1.0, (1.0 - config.ewma_alpha) * entry.success_rate);
                entry.consecutive_failures = 0;
                entry.total_successes += 1;
                entry.outcomes.push_back((now, true));
                if entry.state == CircuitState::HalfOpen {
                    entry.state = CircuitState::Closed;
                    entry.opened_at = None;
                    entry.cooldown_until = None;
                    entry.probe_in_flight = false;
                }
            }
            AttemptOutcome::Failure => {
                entry.success_rate *= 1.0 - config.ewma_alpha;
                entry.consecutive_failures += 1;
                entry.total_failures += 1;
                entry.outcomes.push_back((now, false));
                entry.prune(now, config.rate_window());
                match entry.state {
                    CircuitState::HalfOpen => entry.open(now, config),
                    CircuitState::Closed => {
                        let rate_tripped = entry.outcomes.len() >= config.min_samples
                            && entry.failure_rate() > config.failure_rate;
                        if entry.consecutive_failures >= config.failure_threshold || rate_tripped {
                            entry.open(now, config);
                        }
                    }
                    CircuitState::Open => {}
                }
            }
            AttemptOutcome::Neutral => {
                entry.probe_in_flight = false;
            }
        }
        entry.prune(now, config.rate_window());

        if entry.state != before {
            transitions.push((before, entry.state));
        }
        self.persist(provider, &entry, now)?;
        drop(entry);

        for (from, to) in transitions {
            if to == CircuitState::Open {
                tracing::warn!(provider = %provider, "Circuit opened");
            }
            self.emit(provider, from, to, now);
        }
        Ok(())
    }

    fn persist(&self, provider: Provider, entry: &ProviderHealth, now: DateTime<Utc>) -> Result<()> {
        let (p50, p95, p99) = entry.percentiles();
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO provider_health (provider, success_rate, latency_p50_ms, latency_p95_ms, \
               latency_p99_ms, consecutive_failures, circuit_state, opened_at, cooldown_until, \
               total_successes, total_failures, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
             ON CONFLICT(provider) DO UPDATE SET success_rate = excluded.success_rate, \
               latency_p50_ms = excluded.latency_p50_ms, latency_p95_ms = excluded.latency_p95_ms, \
               latency_p99_ms = excluded.latency_p99_ms, \
               consecutive_failures = excluded.consecutive_failures, \
               circuit_state = excluded.circuit_state, opened_at = excluded.opened_at, \
               cooldown_until = excluded.cooldown_until, \
               total_successes = excluded.total_successes, \
               total_failures = excluded.total_failures, updated_at = excluded.updated_at",
            params![
                provider.cli_name(),
                entry.success_rate,
                to_i64(p50),
                to_i64(p95),
                to_i64(p99),
                i64::from(entry.consecutive_failures),
                entry.state.as_str(),
                entry.opened_at.map(to_db_timestamp),
                entry.cooldown_until.map(to_db_timestamp),
                to_i64(entry.total_successes),
                to_i64(entry.total_failures),
                to_db_timestamp(now),
            ],
        )
        .map_err(|e| DeepqError::storage("persist provider health", e))?;
        Ok(())
    }

    fn emit(&self, provider: Provider, from: CircuitState, to: CircuitState, at: DateTime<Utc>) {
        self.events.health(HealthEvent {
            provider,
            from,
            to,
            timestamp: at,
        });
    }
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
