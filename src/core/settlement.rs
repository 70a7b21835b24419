//! The two-write settlement commit between the job store and the ledger.
//!
//! 1. `JobStore::begin_settlement` records the outcome (`pending`).
//! 2. The ledger settles the actual cost, or releases the reservation when
//!    nothing was charged.
//! 3. `JobStore::finish_settlement` marks the job `done`.
//!
//! A failure after step 1 leaves the job `pending`; [`complete_pending`]
//! replays steps 2 and 3 and is safe to run any number of times.

use super::budgets::{BudgetLedger, SettleOutcome};
use super::models::{Job, JobId, JobStatus, PendingSettlement};
use super::money::Usd;
use crate::error::{DeepqError, Result};
use crate::storage::jobs::JobStore;

/// Settle `id` with `outcome`.
///
/// Returns the settled job, or `None` if someone else owns or already
/// finished the settlement.
///
/// # Errors
/// Returns `StateConflict` when the outcome is unreachable, or
/// `SettlementIncomplete` when the ledger or final write failed; the job is
/// then left pending for reconciliation.
pub fn settle_job(
    store: &JobStore,
    ledger: &BudgetLedger,
    id: &JobId,
    outcome: PendingSettlement,
) -> Result<Option<Job>> {
    let Some(job) = store.begin_settlement(id, outcome)? else {
        tracing::debug!(job_id = %id, "Settlement already owned or finished");
        return Ok(None);
    };
    complete_pending(store, ledger, &job).map(Some)
}

/// Finish a settlement whose outcome is already recorded.
///
/// # Errors
/// Returns `SettlementIncomplete` if either write fails.
pub fn complete_pending(store: &JobStore, ledger: &BudgetLedger, job: &Job) -> Result<Job> {
    let cost = job.pending.as_ref().and_then(|p| p.actual_cost);
    if let Some(reservation_id) = &job.reservation_id {
        let ledger_step = match cost {
            Some(actual) => ledger.settle(reservation_id, actual).map(|outcome| {
                if outcome == SettleOutcome::LateCharge {
                    tracing::warn!(
                        job_id = %job.id,
                        cost = %actual,
                        "Late provider charge recorded against released reservation"
                    );
                }
            }),
            None => ledger.release(reservation_id).map(|_| ()),
        };
        ledger_step.map_err(|e| incomplete(job, "ledger", &e))?;
    }

    let settled = store
        .finish_settlement(&job.id)
        .map_err(|e| incomplete(job, "job store", &e))?;
    tracing::info!(
        job_id = %settled.id,
        status = %settled.status,
        provider = %settled.provider,
        cost = %cost.unwrap_or(Usd::ZERO),
        "Job settled"
    );
    Ok(settled)
}

/// Outcome for a job that ended without any provider charge.
#[must_use]
pub fn uncharged(status: JobStatus, reason: impl Into<String>) -> PendingSettlement {
    PendingSettlement {
        status,
        actual_cost: None,
        reason: Some(reason.into()),
        result: None,
    }
}

fn incomplete(job: &Job, stage: &str, err: &DeepqError) -> DeepqError {
    tracing::error!(
        job_id = %job.id,
        stage,
        error = %err,
        "Settlement incomplete; left pending for reconciliation"
    );
    DeepqError::SettlementIncomplete {
        job_id: job.id.to_string(),
        stage: stage.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budgets::{BudgetLimits, ReservationState, ScopeKind};
    use crate::core::events::EventBus;
    use crate::core::models::{BudgetConstraints, JobSpec, NewJob, SettlementState};
    use crate::core::provider::Provider;
    use crate::storage::schema::Database;
    use crate::util::time::day_key;

    fn setup() -> (JobStore, BudgetLedger) {
        let db = Database::open_in_memory().unwrap();
        let events = EventBus::default();
        let limits = BudgetLimits {
            daily: Some(Usd::from_dollars(10.0)),
            ..BudgetLimits::default()
        };
        (
            JobStore::new(db.clone(), events.clone()),
            BudgetLedger::new(db, limits, events),
        )
    }

    fn admitted_job(store: &JobStore, ledger: &BudgetLedger, estimate: Usd) -> Job {
        let id = JobId::generate();
        let admission = ledger
            .admit(&id, estimate, &BudgetConstraints::default())
            .unwrap();
        store
            .enqueue(NewJob {
                id,
                spec: JobSpec::new("summarise"),
                priority: 0,
                provider: Provider::OpenAi,
                model: "o4-mini-deep-research".into(),
                cost_estimate: estimate,
                reservation_id: Some(admission.reservation.id),
                session_id: None,
            })
            .unwrap()
    }

    #[test]
    fn cancelling_queued_job_releases_reservation() {
        let (store, ledger) = setup();
        let job = admitted_job(&store, &ledger, Usd::from_dollars(0.40));
        let settled = settle_job(
            &store,
            &ledger,
            &job.id,
            uncharged(JobStatus::Cancelled, "operator"),
        )
        .unwrap()
        .unwrap();
        assert_eq!(settled.status, JobStatus::Cancelled);
        assert_eq!(settled.settlement, SettlementState::Done);

        let reservation = ledger
            .reservation(job.reservation_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(reservation.state, ReservationState::Released);
        let daily = ledger
            .scope(ScopeKind::Daily, &day_key(chrono::Utc::now()))
            .unwrap()
            .unwrap();
        assert_eq!(daily.committed, Usd::ZERO);
        assert_eq!(daily.spent, Usd::ZERO);

        // A second settle is a no-op.
        assert!(
            settle_job(&store, &ledger, &job.id, uncharged(JobStatus::Cancelled, "again"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn pending_settlement_replays() {
        let (store, ledger) = setup();
        let job = admitted_job(&store, &ledger, Usd::from_dollars(0.20));
        let claimed = store
            .dequeue_next("w1", chrono::Duration::seconds(60))
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job.id);

        // Crash between the two writes: outcome recorded, ledger untouched.
        let pending = store
            .begin_settlement(
                &job.id,
                PendingSettlement {
                    status: JobStatus::Failed,
                    actual_cost: Some(Usd::from_dollars(0.05)),
                    reason: Some("provider failed".into()),
                    result: None,
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(store.pending_settlements().unwrap().len(), 1);

        let first = complete_pending(&store, &ledger, &pending).unwrap();
        let second = complete_pending(&store, &ledger, &pending).unwrap();
        assert_eq!(first.settlement, SettlementState::Done);
        assert_eq!(second.actual_cost, Some(Usd::from_dollars(0.05)));

        let daily = ledger
            .scope(ScopeKind::Daily, &day_key(chrono::Utc::now()))
            .unwrap()
            .unwrap();
        assert_eq!(daily.spent, Usd::from_dollars(0.05));
        assert_eq!(daily.committed, Usd::ZERO);
        assert!(store.pending_settlements().unwrap().is_empty());
    }
}
