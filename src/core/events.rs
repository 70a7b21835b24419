//! Engine event surface.
//!
//! Every job status change, circuit transition and budget warning is published
//! on a broadcast channel. Subscribers that fall behind lose the oldest events;
//! the durable record for jobs is the `job_events` table.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::budgets::ScopeKind;
use super::health::CircuitState;
use super::models::{JobId, JobStatus};
use super::money::Usd;
use super::provider::Provider;

const DEFAULT_CAPACITY: usize = 1024;

/// A job changed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    /// `None` for the initial enqueue.
    pub old_status: Option<JobStatus>,
    pub new_status: JobStatus,
    pub provider: Provider,
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A provider circuit changed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthEvent {
    pub provider: Provider,
    pub from: CircuitState,
    pub to: CircuitState,
    pub timestamp: DateTime<Utc>,
}

/// Budget notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BudgetEvent {
    /// A scope crossed the warning threshold.
    Warning {
        scope: ScopeKind,
        key: String,
        utilization: f64,
        limit: Usd,
    },
    Paused {
        reason: String,
    },
    Resumed,
}

/// Everything published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Job(JobEvent),
    Health(HealthEvent),
    Budget(BudgetEvent),
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn job(&self, event: JobEvent) {
        tracing::debug!(
            job_id = %event.job_id,
            provider = %event.provider,
            old = ?event.old_status,
            new = %event.new_status,
            "Job status changed"
        );
        self.emit(EngineEvent::Job(event));
    }

    pub fn health(&self, event: HealthEvent) {
        tracing::info!(
            provider = %event.provider,
            from = %event.from,
            to = %event.to,
            "Circuit state changed"
        );
        self.emit(EngineEvent::Health(event));
    }

    pub fn budget(&self, event: BudgetEvent) {
        self.emit(EngineEvent::Budget(event));
    }
}
