//! Scheduling, routing, budget and health machinery.

pub mod budgets;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod health;
pub mod http;
pub mod logging;
pub mod models;
pub mod money;
pub mod pricing;
pub mod provider;
pub mod router;
pub mod settlement;

pub use budgets::{
    Admission, BudgetLedger, BudgetLimits, BudgetWarning, LedgerStatus, ScopeBalance, ScopeKind,
    SettleOutcome,
};
pub use dispatcher::{PollConfig, RetryConfig, WorkerPool};
pub use engine::{
    Engine, EngineBuilder, EngineSettings, ReapReport, ReaperConfig, ReconcileReport, SubmitJob,
    Submitted,
};
pub use events::{EngineEvent, EventBus, JobEvent};
pub use health::{AttemptOutcome, CircuitConfig, CircuitState, HealthRegistry, HealthSnapshot};
pub use models::{
    BudgetConstraints, Job, JobFilter, JobId, JobResult, JobSpec, JobStatus, JobStatusView,
    ResearchDepth, SettlementState,
};
pub use money::Usd;
pub use pricing::{CostEstimate, CostEstimator, ModelPricing, PricingTable};
pub use provider::Provider;
pub use router::{RouteExplanation, Router, RoutingConfig, Selection};
