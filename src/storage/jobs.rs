//! Durable job store.
//!
//! Holds every job and its lifecycle. All writes run inside `IMMEDIATE`
//! transactions so that concurrent workers, in this process or another one
//! sharing the file, observe a single order of state changes.
//!
//! ## Settlement
//!
//! Moving a job to a terminal state while money is reserved touches two
//! tables owned by different components. The store records the outcome first
//! (`begin_settlement`, which leaves `settlement_state = 'pending'`), the
//! ledger is settled or released, and then `finish_settlement` marks the job
//! `done`. Anything left `pending` by a crash is found by
//! `pending_settlements` and replayed; both ledger operations are idempotent.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use super::schema::Database;
use crate::core::events::{EventBus, JobEvent};
use crate::core::models::{
    Job, JobFilter, JobId, JobPatch, JobStatus, NewJob, PendingSettlement, ResearchDepth,
    RetryState, SettlementState,
};
use crate::core::money::Usd;
use crate::core::provider::Provider;
use crate::error::{DeepqError, Result};
use crate::util::time::{parse_db_timestamp, parse_opt_timestamp, to_db_timestamp};

const JOB_COLUMNS: &str = "seq, id, status, priority, prompt, depth, provider, model, \
    provider_job_id, cost_estimate_micros, actual_cost_micros, retry_count, provider_attempts, \
    excluded_providers, next_attempt_at, last_error, result, reservation_id, session_id, \
    settlement_state, pending_status, pending_cost_micros, pending_reason, pending_result, \
    lease_owner, lease_expires_at, submitted_at, started_at, completed_at, updated_at";

/// Job persistence and lifecycle enforcement.
#[derive(Debug, Clone)]
pub struct JobStore {
    db: Database,
    events: EventBus,
}

impl JobStore {
    #[must_use]
    pub const fn new(db: Database, events: EventBus) -> Self {
        Self { db, events }
    }

    /// Insert a new `queued` job.
    ///
    /// # Errors
    /// Returns `InvalidRequest` if the provider is the `unknown` sentinel, or a
    /// storage error (including a duplicate id).
    pub fn enqueue(&self, new: NewJob) -> Result<Job> {
        if !new.provider.is_dispatchable() {
            return Err(DeepqError::InvalidRequest(
                "jobs must be bound to a real provider".to_string(),
            ));
        }
        let now = Utc::now();
        let now_s = to_db_timestamp(now);

        let (job, event) = {
            let mut conn = self.db.lock()?;
            let tx = immediate(&mut conn)?;
            tx.execute(
                "INSERT INTO jobs (id, status, priority, prompt, depth, provider, model, \
                 cost_estimate_micros, reservation_id, session_id, submitted_at, updated_at) \
                 VALUES (?1, 'queued', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    new.id.as_str(),
                    new.priority,
                    new.spec.prompt,
                    new.spec.depth.as_str(),
                    new.provider.cli_name(),
                    new.model,
                    new.cost_estimate.micros(),
                    new.reservation_id,
                    new.session_id,
                    now_s,
                ],
            )
            .map_err(|e| DeepqError::storage("insert job", e))?;
            let event = record_event(&tx, &new.id, None, JobStatus::Queued, new.provider, None, now)?;
            let job = load(&tx, &new.id)?.ok_or_else(|| DeepqError::JobNotFound(new.id.to_string()))?;
            tx.commit().map_err(|e| DeepqError::storage("commit enqueue", e))?;
            (job, event)
        };

        tracing::info!(
            job_id = %job.id,
            provider = %job.provider,
            priority = job.priority,
            estimate = %job.cost_estimate,
            "Job enqueued"
        );
        self.events.job(event);
        Ok(job)
    }

    /// Atomically claim the highest-priority eligible queued job.
    ///
    /// Ordering is priority descending, then enqueue order. Jobs whose backoff
    /// has not elapsed, jobs bound to the `unknown` provider and jobs with a
    /// settlement in flight are skipped. At most one caller ever receives a
    /// given job.
    ///
    /// # Errors
    /// Returns a storage error if the claim transaction fails.
    pub fn dequeue_next(&self, worker: &str, lease: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let now_s = to_db_timestamp(now);
        let expires_s = to_db_timestamp(now + lease);

        let claimed = {
            let mut conn = self.db.lock()?;
            loop {
                let tx = immediate(&mut conn)?;
                let candidate: Option<String> = tx
                    .query_row(
                        "SELECT id FROM jobs \
                         WHERE status = 'queued' AND settlement_state = 'none' \
                           AND provider != 'unknown' \
                           AND (next_attempt_at IS NULL OR next_attempt_at <= ?1) \
                         ORDER BY priority DESC, seq ASC LIMIT 1",
                        [&now_s],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| DeepqError::storage("select dequeue candidate", e))?;

                let Some(id) = candidate else {
                    break None;
                };

                let changed = tx
                    .execute(
                        "UPDATE jobs SET status = 'processing', \
                           started_at = COALESCE(started_at, ?2), \
                           lease_owner = ?3, lease_expires_at = ?4, updated_at = ?2 \
                         WHERE id = ?1 AND status = 'queued'",
                        params![id, now_s, worker, expires_s],
                    )
                    .map_err(|e| DeepqError::storage("claim job", e))?;
                if changed == 0 {
                    // Lost the row between select and update; look again.
                    drop(tx);
                    continue;
                }

                let id = JobId::from(id);
                let job = load(&tx, &id)?.ok_or_else(|| DeepqError::JobNotFound(id.to_string()))?;
                let event = record_event(
                    &tx,
                    &id,
                    Some(JobStatus::Queued),
                    JobStatus::Processing,
                    job.provider,
                    Some(format!("claimed by {worker}")),
                    now,
                )?;
                tx.commit().map_err(|e| DeepqError::storage("commit dequeue", e))?;
                break Some((job, event));
            }
        };

        Ok(claimed.map(|(job, event)| {
            tracing::debug!(job_id = %job.id, worker, "Job claimed");
            self.events.job(event);
            job
        }))
    }

    /// Fetch a job by id.
    ///
    /// # Errors
    /// Returns `JobNotFound` if absent.
    pub fn get(&self, id: &JobId) -> Result<Job> {
        self.find(id)?
            .ok_or_else(|| DeepqError::JobNotFound(id.to_string()))
    }

    /// Fetch a job by id if it exists.
    ///
    /// # Errors
    /// Returns a storage error if the query fails.
    pub fn find(&self, id: &JobId) -> Result<Option<Job>> {
        let conn = self.db.lock()?;
        load(&conn, id)
    }

    /// Apply a validated partial update.
    ///
    /// Rejects illegal transitions, any change to a terminal job, any change
    /// while a settlement is in flight, and any provider reassignment after the
    /// provider has accepted the job.
    ///
    /// # Errors
    /// Returns `JobNotFound`, `StateConflict` or `InvalidRequest` as appropriate.
    pub fn update(&self, id: &JobId, patch: JobPatch) -> Result<Job> {
        let now = Utc::now();
        let (job, event) = {
            let mut conn = self.db.lock()?;
            let tx = immediate(&mut conn)?;
            let current = load(&tx, id)?.ok_or_else(|| DeepqError::JobNotFound(id.to_string()))?;
            let next = apply_patch(&current, &patch, now)?;
            write_job(&tx, &current, &next)?;
            let event = if next.status == current.status {
                None
            } else {
                Some(record_event(
                    &tx,
                    id,
                    Some(current.status),
                    next.status,
                    next.provider,
                    patch.note.clone(),
                    now,
                )?)
            };
            tx.commit().map_err(|e| DeepqError::storage("commit update", e))?;
            (next, event)
        };

        if let Some(event) = event {
            self.events.job(event);
        }
        Ok(job)
    }

    /// Record a terminal outcome and mark the job's settlement pending.
    ///
    /// Returns `Some(job)` if the caller now owns the settlement and must
    /// settle or release the ledger and then call `finish_settlement`.
    /// Returns `None` if another actor already settled the job or is settling it.
    ///
    /// A job that was cancelled while in flight keeps its `cancelled` status;
    /// only the cost is recorded. A job that was already settled without a
    /// charge (for example reaped) accepts one late charge.
    ///
    /// # Errors
    /// Returns `StateConflict` if the outcome is not reachable from the current
    /// state, or `JobNotFound`.
    pub fn begin_settlement(&self, id: &JobId, outcome: PendingSettlement) -> Result<Option<Job>> {
        let now = Utc::now();
        let (job, event) = {
            let mut conn = self.db.lock()?;
            let tx = immediate(&mut conn)?;
            let current = load(&tx, id)?.ok_or_else(|| DeepqError::JobNotFound(id.to_string()))?;
            let Some(next) = settlement_target(&current, outcome, now)? else {
                return Ok(None);
            };
            write_job(&tx, &current, &next)?;
            let event = if next.status == current.status {
                None
            } else {
                let note = next.pending.as_ref().and_then(|p| p.reason.clone());
                Some(record_event(
                    &tx,
                    id,
                    Some(current.status),
                    next.status,
                    next.provider,
                    note,
                    now,
                )?)
            };
            tx.commit()
                .map_err(|e| DeepqError::storage("commit begin settlement", e))?;
            (next, event)
        };

        if let Some(event) = event {
            self.events.job(event);
        }
        Ok(Some(job))
    }

    /// Mark a pending settlement done once the ledger agrees. Idempotent.
    ///
    /// # Errors
    /// Returns `JobNotFound` or a storage error.
    pub fn finish_settlement(&self, id: &JobId) -> Result<Job> {
        let now = Utc::now();
        let mut conn = self.db.lock()?;
        let tx = immediate(&mut conn)?;
        let current = load(&tx, id)?.ok_or_else(|| DeepqError::JobNotFound(id.to_string()))?;
        if current.settlement != SettlementState::Pending {
            return Ok(current);
        }
        let mut next = current.clone();
        if let Some(cost) = current.pending.as_ref().and_then(|p| p.actual_cost) {
            next.actual_cost = Some(cost);
        }
        next.pending = None;
        next.settlement = SettlementState::Done;
        next.updated_at = now;
        write_job(&tx, &current, &next)?;
        tx.commit()
            .map_err(|e| DeepqError::storage("commit finish settlement", e))?;
        Ok(next)
    }

    /// Jobs whose settlement was started but not finished.
    ///
    /// # Errors
    /// Returns a storage error if the query fails.
    pub fn pending_settlements(&self) -> Result<Vec<Job>> {
        let conn = self.db.lock()?;
        query_jobs(
            &conn,
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE settlement_state = 'pending' ORDER BY seq"),
            &[],
        )
    }

    /// Jobs stuck beyond their timeout: queued since before `now - queued_timeout`,
    /// or processing since before `now - processing_timeout`. Jobs with a
    /// settlement in flight are skipped.
    ///
    /// # Errors
    /// Returns a storage error if the query fails.
    pub fn stale_jobs(&self, queued_timeout: Duration, processing_timeout: Duration) -> Result<Vec<Job>> {
        let now = Utc::now();
        let queued_cutoff = to_db_timestamp(now - queued_timeout);
        let processing_cutoff = to_db_timestamp(now - processing_timeout);
        let conn = self.db.lock()?;
        query_jobs(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE settlement_state = 'none' AND ( \
                   (status = 'queued' AND submitted_at < ?1) \
                   OR (status = 'processing' AND started_at IS NOT NULL AND started_at < ?2)) \
                 ORDER BY seq"
            ),
            &[&queued_cutoff, &processing_cutoff],
        )
    }

    /// Extend a lease held by `worker`. Returns `false` if the worker lost it.
    ///
    /// # Errors
    /// Returns a storage error if the update fails.
    pub fn renew_lease(&self, id: &JobId, worker: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let conn = self.db.lock()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET lease_expires_at = ?3, updated_at = ?4 \
                 WHERE id = ?1 AND lease_owner = ?2 \
                   AND status IN ('processing', 'cancelled') AND settlement_state = 'none'",
                params![
                    id.as_str(),
                    worker,
                    to_db_timestamp(now + lease),
                    to_db_timestamp(now)
                ],
            )
            .map_err(|e| DeepqError::storage("renew lease", e))?;
        Ok(changed == 1)
    }

    /// Give up a lease so another worker may adopt the job immediately.
    ///
    /// # Errors
    /// Returns a storage error if the update fails.
    pub fn release_lease(&self, id: &JobId, worker: &str) -> Result<()> {
        let now_s = to_db_timestamp(Utc::now());
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE jobs SET lease_expires_at = ?3, updated_at = ?3 \
             WHERE id = ?1 AND lease_owner = ?2",
            params![id.as_str(), worker, now_s],
        )
        .map_err(|e| DeepqError::storage("release lease", e))?;
        Ok(())
    }

    /// Take over an in-flight job whose lease expired.
    ///
    /// Candidates are processing jobs and jobs cancelled while a worker held
    /// them that still await settlement.
    ///
    /// # Errors
    /// Returns a storage error if the claim fails.
    pub fn adopt_orphan(&self, worker: &str, lease: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let now_s = to_db_timestamp(now);
        let expires_s = to_db_timestamp(now + lease);

        let mut conn = self.db.lock()?;
        let tx = immediate(&mut conn)?;
        let candidate: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT id, lease_owner FROM jobs \
                 WHERE settlement_state = 'none' \
                   AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?1 \
                   AND status IN ('processing', 'cancelled') \
                 ORDER BY priority DESC, seq ASC LIMIT 1",
                [&now_s],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| DeepqError::storage("select orphan", e))?;

        let Some((id, previous_owner)) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET lease_owner = ?2, lease_expires_at = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, worker, expires_s, now_s],
        )
        .map_err(|e| DeepqError::storage("adopt orphan", e))?;
        let id = JobId::from(id);
        let job = load(&tx, &id)?.ok_or_else(|| DeepqError::JobNotFound(id.to_string()))?;
        tx.commit().map_err(|e| DeepqError::storage("commit adopt", e))?;

        tracing::warn!(
            job_id = %job.id,
            worker,
            previous_owner = previous_owner.as_deref().unwrap_or("-"),
            "Adopted orphaned job"
        );
        Ok(Some(job))
    }

    /// List jobs matching `filter`, oldest first.
    ///
    /// # Errors
    /// Returns a storage error if the query fails.
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if !filter.statuses.is_empty() {
            let mut marks = Vec::with_capacity(filter.statuses.len());
            for status in &filter.statuses {
                values.push(status.as_str().to_string().into());
                marks.push(format!("?{}", values.len()));
            }
            clauses.push(format!("status IN ({})", marks.join(", ")));
        }
        if let Some(provider) = filter.provider {
            values.push(provider.cli_name().to_string().into());
            clauses.push(format!("provider = ?{}", values.len()));
        }
        if let Some(min) = filter.min_priority {
            values.push(min.into());
            clauses.push(format!("priority >= ?{}", values.len()));
        }
        if let Some(max) = filter.max_priority {
            values.push(max.into());
            clauses.push(format!("priority <= ?{}", values.len()));
        }
        if let Some(after) = filter.submitted_after {
            values.push(to_db_timestamp(after).into());
            clauses.push(format!("submitted_at >= ?{}", values.len()));
        }
        if let Some(before) = filter.submitted_before {
            values.push(to_db_timestamp(before).into());
            clauses.push(format!("submitted_at < ?{}", values.len()));
        }

        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY seq ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| DeepqError::storage("prepare list", e))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), JobRow::from_row)
            .map_err(|e| DeepqError::storage("list jobs", e))?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.map_err(|e| DeepqError::storage("read job row", e))?.into_job()?);
        }
        Ok(jobs)
    }

    /// Number of jobs per status.
    ///
    /// # Errors
    /// Returns a storage error if the query fails.
    pub fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")
            .map_err(|e| DeepqError::storage("prepare count", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| DeepqError::storage("count jobs", e))?;
        let mut counts = Vec::new();
        for row in rows {
            let (status, count) = row.map_err(|e| DeepqError::storage("read count", e))?;
            counts.push((JobStatus::parse(&status)?, u64::try_from(count).unwrap_or(0)));
        }
        Ok(counts)
    }

    /// Status-change history for a job, oldest first.
    ///
    /// # Errors
    /// Returns a storage error if the query fails.
    pub fn events(&self, id: &JobId) -> Result<Vec<JobEvent>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT old_status, new_status, provider, note, created_at \
                 FROM job_events WHERE job_id = ?1 ORDER BY id",
            )
            .map_err(|e| DeepqError::storage("prepare events", e))?;
        let rows = stmt
            .query_map([id.as_str()], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| DeepqError::storage("query events", e))?;

        let mut events = Vec::new();
        for row in rows {
            let (old, new, provider, note, at) =
                row.map_err(|e| DeepqError::storage("read event", e))?;
            events.push(JobEvent {
                job_id: id.clone(),
                old_status: old.as_deref().map(JobStatus::parse).transpose()?,
                new_status: JobStatus::parse(&new)?,
                provider: Provider::from_stored(&provider)?,
                note,
                timestamp: parse_db_timestamp(&at)?,
            });
        }
        Ok(events)
    }

    /// Delete settled terminal jobs (and their events) completed before the
    /// retention window. Returns the number of jobs removed.
    ///
    /// # Errors
    /// Returns `Config` for a non-positive window or a storage error.
    pub fn cleanup(&self, retention_days: i64) -> Result<usize> {
        if retention_days <= 0 {
            return Err(DeepqError::Config(
                "Retention days must be greater than 0".to_string(),
            ));
        }
        let cutoff = to_db_timestamp(Utc::now() - Duration::days(retention_days));
        let mut conn = self.db.lock()?;
        let tx = immediate(&mut conn)?;
        tx.execute(
            "DELETE FROM job_events WHERE job_id IN (\
               SELECT id FROM jobs WHERE status IN ('completed', 'failed', 'cancelled') \
                 AND settlement_state != 'pending' AND completed_at < ?1)",
            [&cutoff],
        )
        .map_err(|e| DeepqError::storage("cleanup events", e))?;
        let deleted = tx
            .execute(
                "DELETE FROM jobs WHERE status IN ('completed', 'failed', 'cancelled') \
                   AND settlement_state != 'pending' AND completed_at < ?1",
                [&cutoff],
            )
            .map_err(|e| DeepqError::storage("cleanup jobs", e))?;
        tx.commit().map_err(|e| DeepqError::storage("commit cleanup", e))?;
        Ok(deleted)
    }
}

// =============================================================================
// Transition rules
// =============================================================================

fn conflict(job: &Job, to: impl Into<String>) -> DeepqError {
    DeepqError::StateConflict {
        job_id: job.id.to_string(),
        from: job.status.to_string(),
        to: to.into(),
    }
}

fn apply_patch(current: &Job, patch: &JobPatch, now: DateTime<Utc>) -> Result<Job> {
    let requested = patch.status.map_or("update", JobStatus::as_str);
    // A job cancelled mid-submission still takes the provider's handle so its
    // worker can stop the remote job and settle what it charged.
    let late_handle = current.awaits_cancel_settlement()
        && patch.provider_job_id.is_some()
        && patch.status.is_none()
        && patch.provider.is_none()
        && patch.model.is_none()
        && patch.actual_cost.is_none()
        && patch.result.is_none();
    if (current.status.is_terminal() && !late_handle) || current.settlement != SettlementState::None {
        return Err(conflict(current, requested));
    }

    let mut next = current.clone();

    if let Some(provider) = patch.provider {
        if provider != current.provider {
            if !provider.is_dispatchable() {
                return Err(DeepqError::InvalidRequest(
                    "cannot assign the unknown provider".to_string(),
                ));
            }
            if current.is_submitted() {
                return Err(DeepqError::StateConflict {
                    job_id: current.id.to_string(),
                    from: format!("provider {}", current.provider),
                    to: format!("provider {provider}"),
                });
            }
            next.provider = provider;
        }
    }
    if let Some(model) = &patch.model {
        if *model != current.model && current.is_submitted() {
            return Err(conflict(current, format!("model {model}")));
        }
        next.model.clone_from(model);
    }
    if let Some(provider_job_id) = &patch.provider_job_id {
        if current.status != JobStatus::Processing && !late_handle {
            return Err(conflict(current, "submitted"));
        }
        match &current.provider_job_id {
            Some(existing) if existing != provider_job_id => {
                return Err(conflict(current, format!("provider job {provider_job_id}")));
            }
            _ => next.provider_job_id = Some(provider_job_id.clone()),
        }
    }
    if let Some(cost) = patch.actual_cost {
        next.actual_cost = Some(cost);
    }
    if let Some(error) = &patch.last_error {
        next.last_error = Some(error.clone());
    }
    if let Some(result) = &patch.result {
        next.result = Some(result.clone());
    }
    if let Some(retry) = &patch.retry {
        next.retry = retry.clone();
    }
    if patch.clear_lease {
        next.lease_owner = None;
        next.lease_expires_at = None;
    }

    if let Some(status) = patch.status {
        if status != current.status {
            if !current.status.can_transition_to(status) {
                return Err(conflict(current, status.as_str()));
            }
            match status {
                JobStatus::Queued if next.is_submitted() => {
                    return Err(conflict(current, "queued (provider already accepted)"));
                }
                JobStatus::Completed
                    if next.actual_cost.is_none() || next.provider_job_id.is_none() =>
                {
                    return Err(conflict(current, "completed (cost or provider job missing)"));
                }
                _ => {}
            }
            if status == JobStatus::Queued {
                next.lease_owner = None;
                next.lease_expires_at = None;
            }
            if status.is_terminal() {
                next.completed_at = Some(now);
            }
            next.status = status;
        }
    }

    next.updated_at = now;
    Ok(next)
}

fn settlement_target(
    current: &Job,
    outcome: PendingSettlement,
    now: DateTime<Utc>,
) -> Result<Option<Job>> {
    if !outcome.status.is_terminal() {
        return Err(conflict(current, outcome.status.as_str()));
    }

    let mut next = current.clone();
    next.updated_at = now;

    match current.settlement {
        SettlementState::Pending => return Ok(None),
        SettlementState::Done => {
            let late = outcome.actual_cost.filter(|c| !c.is_zero());
            if current.actual_cost.is_some() || late.is_none() {
                return Ok(None);
            }
            next.settlement = SettlementState::Pending;
            next.pending = Some(PendingSettlement {
                status: current.status,
                actual_cost: late,
                reason: Some("late provider charge".to_string()),
                result: None,
            });
            return Ok(Some(next));
        }
        SettlementState::None => {}
    }

    let target = if current.status.is_terminal() {
        // Cancelled in flight, or legacy terminal rows: record cost only.
        current.status
    } else if current.status.can_transition_to(outcome.status) {
        outcome.status
    } else {
        return Err(conflict(current, outcome.status.as_str()));
    };

    if target == JobStatus::Completed
        && (outcome.actual_cost.is_none() || current.provider_job_id.is_none())
    {
        return Err(conflict(current, "completed (cost or provider job missing)"));
    }

    if target != current.status {
        next.status = target;
        next.completed_at = Some(now);
        match target {
            JobStatus::Completed => next.result.clone_from(&outcome.result),
            _ => {
                if outcome.reason.is_some() {
                    next.last_error.clone_from(&outcome.reason);
                }
            }
        }
    }
    next.lease_owner = None;
    next.lease_expires_at = None;
    next.settlement = SettlementState::Pending;
    next.pending = Some(PendingSettlement {
        status: target,
        ..outcome
    });
    Ok(Some(next))
}

// =============================================================================
// Row access
// =============================================================================

fn immediate(conn: &mut Connection) -> Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| DeepqError::storage("begin transaction", e))
}

fn load(conn: &Connection, id: &JobId) -> Result<Option<Job>> {
    let mut stmt = conn
        .prepare_cached(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
        .map_err(|e| DeepqError::storage("prepare load", e))?;
    let row = stmt
        .query_row([id.as_str()], JobRow::from_row)
        .optional()
        .map_err(|e| DeepqError::storage("load job", e))?;
    row.map(JobRow::into_job).transpose()
}

fn query_jobs(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Job>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| DeepqError::storage("prepare query", e))?;
    let rows = stmt
        .query_map(args, JobRow::from_row)
        .map_err(|e| DeepqError::storage("query jobs", e))?;
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row.map_err(|e| DeepqError::storage("read job row", e))?.into_job()?);
    }
    Ok(jobs)
}

/// Full-row compare-and-set write of the mutable columns.
fn write_job(tx: &Transaction<'_>, current: &Job, next: &Job) -> Result<()> {
    let excluded = serde_json::to_string(&next.retry.excluded_providers)?;
    let pending = next.pending.as_ref();
    let changed = tx
        .execute(
            "UPDATE jobs SET status = ?3, provider = ?4, model = ?5, provider_job_id = ?6, \
               actual_cost_micros = ?7, retry_count = ?8, provider_attempts = ?9, \
               excluded_providers = ?10, next_attempt_at = ?11, last_error = ?12, result = ?13, \
               settlement_state = ?14, pending_status = ?15, pending_cost_micros = ?16, \
               pending_reason = ?17, pending_result = ?18, lease_owner = ?19, \
               lease_expires_at = ?20, completed_at = ?21, updated_at = ?22 \
             WHERE id = ?1 AND status = ?2 AND settlement_state = ?23",
            params![
                next.id.as_str(),
                current.status.as_str(),
                next.status.as_str(),
                next.provider.cli_name(),
                next.model,
                next.provider_job_id,
                next.actual_cost.map(Usd::micros),
                i64::from(next.retry.retry_count),
                i64::from(next.retry.provider_attempts),
                excluded,
                next.retry.next_attempt_at.map(to_db_timestamp),
                next.last_error,
                next.result,
                next.settlement.as_str(),
                pending.map(|p| p.status.as_str()),
                pending.and_then(|p| p.actual_cost).map(Usd::micros),
                pending.and_then(|p| p.reason.clone()),
                pending.and_then(|p| p.result.clone()),
                next.lease_owner,
                next.lease_expires_at.map(to_db_timestamp),
                next.completed_at.map(to_db_timestamp),
                to_db_timestamp(next.updated_at),
                current.settlement.as_str(),
            ],
        )
        .map_err(|e| DeepqError::storage("write job", e))?;
    if changed == 0 {
        return Err(conflict(current, next.status.as_str()));
    }
    Ok(())
}

fn record_event(
    tx: &Transaction<'_>,
    id: &JobId,
    old: Option<JobStatus>,
    new: JobStatus,
    provider: Provider,
    note: Option<String>,
    at: DateTime<Utc>,
) -> Result<JobEvent> {
    tx.execute(
        "INSERT INTO job_events (job_id, old_status, new_status, provider, note, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.as_str(),
            old.map(JobStatus::as_str),
            new.as_str(),
            provider.cli_name(),
            note,
            to_db_timestamp(at),
        ],
    )
    .map_err(|e| DeepqError::storage("insert job event", e))?;
    Ok(JobEvent {
        job_id: id.clone(),
        old_status: old,
        new_status: new,
        provider,
        note,
        timestamp: at,
    })
}

/// Raw column values, converted to a `Job` outside the rusqlite callback so
/// parse failures surface as `DeepqError`.
struct JobRow {
    seq: i64,
    id: String,
    status: String,
    priority: i64,
    prompt: String,
    depth: String,
    provider: String,
    model: String,
    provider_job_id: Option<String>,
    cost_estimate_micros: i64,
    actual_cost_micros: Option<i64>,
    retry_count: i64,
    provider_attempts: i64,
    excluded_providers: String,
    next_attempt_at: Option<String>,
    last_error: Option<String>,
    result: Option<String>,
    reservation_id: Option<String>,
    session_id: Option<String>,
    settlement_state: String,
    pending_status: Option<String>,
    pending_cost_micros: Option<i64>,
    pending_reason: Option<String>,
    pending_result: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
    submitted_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            status: row.get(2)?,
            priority: row.get(3)?,
            prompt: row.get(4)?,
            depth: row.get(5)?,
            provider: row.get(6)?,
            model: row.get(7)?,
            provider_job_id: row.get(8)?,
            cost_estimate_micros: row.get(9)?,
            actual_cost_micros: row.get(10)?,
            retry_count: row.get(11)?,
            provider_attempts: row.get(12)?,
            excluded_providers: row.get(13)?,
            next_attempt_at: row.get(14)?,
            last_error: row.get(15)?,
            result: row.get(16)?,
            reservation_id: row.get(17)?,
            session_id: row.get(18)?,
            settlement_state: row.get(19)?,
            pending_status: row.get(20)?,
            pending_cost_micros: row.get(21)?,
            pending_reason: row.get(22)?,
            pending_result: row.get(23)?,
            lease_owner: row.get(24)?,
            lease_expires_at: row.get(25)?,
            submitted_at: row.get(26)?,
            started_at: row.get(27)?,
            completed_at: row.get(28)?,
            updated_at: row.get(29)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let provider = Provider::from_stored(&self.provider)?;
        let excluded_providers: Vec<Provider> = serde_json::from_str(&self.excluded_providers)?;
        let pending = match self.pending_status {
            Some(status) => Some(PendingSettlement {
                status: JobStatus::parse(&status)?,
                actual_cost: self.pending_cost_micros.map(Usd::from_micros),
                reason: self.pending_reason,
                result: self.pending_result,
            }),
            None => None,
        };
        let submitted_at = parse_db_timestamp(&self.submitted_at)?;
        let updated_at = parse_opt_timestamp(self.updated_at)?.unwrap_or(submitted_at);

        Ok(Job {
            id: JobId::from(self.id),
            status: JobStatus::parse(&self.status)?,
            priority: self.priority,
            seq: self.seq,
            prompt: self.prompt,
            depth: ResearchDepth::parse(&self.depth)?,
            provider,
            model: self.model,
            provider_job_id: self.provider_job_id,
            cost_estimate: Usd::from_micros(self.cost_estimate_micros),
            actual_cost: self.actual_cost_micros.map(Usd::from_micros),
            retry: RetryState {
                retry_count: u32::try_from(self.retry_count).unwrap_or(0),
                provider_attempts: u32::try_from(self.provider_attempts).unwrap_or(0),
                excluded_providers,
                next_attempt_at: parse_opt_timestamp(self.next_attempt_at)?,
            },
            last_error: self.last_error,
            result: self.result,
            reservation_id: self.reservation_id,
            session_id: self.session_id,
            settlement: SettlementState::parse(&self.settlement_state)?,
            pending,
            lease_owner: self.lease_owner,
            lease_expires_at: parse_opt_timestamp(self.lease_expires_at)?,
            submitted_at,
            started_at: parse_opt_timestamp(self.started_at)?,
            completed_at: parse_opt_timestamp(self.completed_at)?,
            updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::JobSpec;

    fn store() -> JobStore {
        JobStore::new(Database::open_in_memory().unwrap(), EventBus::default())
    }

    fn new_job(prompt: &str, priority: i64) -> NewJob {
        NewJob {
            id: JobId::generate(),
            spec: JobSpec::new(prompt),
            priority,
            provider: Provider::OpenAi,
            model: "o4-mini-deep-research".into(),
            cost_estimate: Usd::from_cents(50),
            reservation_id: None,
            session_id: None,
        }
    }

    fn lease() -> Duration {
        Duration::seconds(60)
    }

    #[test]
    fn dequeue_orders_by_priority_then_fifo() {
        let store = store();
        let low = store.enqueue(new_job("low", 0)).unwrap();
        let high_a = store.enqueue(new_job("high a", 5)).unwrap();
        let high_b = store.enqueue(new_job("high b", 5)).unwrap();

        let order: Vec<JobId> = std::iter::from_fn(|| store.dequeue_next("w", lease()).unwrap())
            .map(|j| j.id)
            .collect();
        assert_eq!(order, vec![high_a.id, high_b.id, low.id]);
    }

    #[test]
    fn dequeue_sets_processing_and_lease() {
        let store = store();
        store.enqueue(new_job("p", 0)).unwrap();
        let job = store.dequeue_next("worker-1", lease()).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.lease_owner.as_deref(), Some("worker-1"));
        assert!(job.started_at.is_some());
        assert!(store.dequeue_next("worker-2", lease()).unwrap().is_none());
    }

    #[test]
    fn dequeue_respects_backoff() {
        let store = store();
        let job = store.enqueue(new_job("p", 0)).unwrap();
        store.dequeue_next("w", lease()).unwrap().unwrap();
        let retry = RetryState {
            retry_count: 1,
            next_attempt_at: Some(Utc::now() + Duration::seconds(30)),
            ..RetryState::default()
        };
        store
            .update(
                &job.id,
                JobPatch {
                    status: Some(JobStatus::Queued),
                    retry: Some(retry),
                    ..JobPatch::default()
                },
            )
            .unwrap();
        assert!(store.dequeue_next("w", lease()).unwrap().is_none());
    }

    #[test]
    fn queued_cannot_be_patched_to_processing() {
        let store = store();
        let job = store.enqueue(new_job("p", 0)).unwrap();
        let err = store
            .update(&job.id, JobPatch::status(JobStatus::Processing))
            .unwrap_err();
        assert!(matches!(err, DeepqError::StateConflict { .. }));
    }

    #[test]
    fn provider_is_frozen_after_submission() {
        let store = store();
        let job = store.enqueue(new_job("p", 0)).unwrap();
        store.dequeue_next("w", lease()).unwrap().unwrap();

        let moved = store
            .update(
                &job.id,
                JobPatch {
                    provider: Some(Provider::Gemini),
                    ..JobPatch::default()
                },
            )
            .unwrap();
        assert_eq!(moved.provider, Provider::Gemini);

        store
            .update(
                &job.id,
                JobPatch {
                    provider_job_id: Some("resp_1".into()),
                    ..JobPatch::default()
                },
            )
            .unwrap();
        let err = store
            .update(
                &job.id,
                JobPatch {
                    provider: Some(Provider::OpenAi),
                    ..JobPatch::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, DeepqError::StateConflict { .. }));
        assert_eq!(store.get(&job.id).unwrap().provider, Provider::Gemini);
    }

    #[test]
    fn submitted_job_cannot_return_to_queue() {
        let store = store();
        let job = store.enqueue(new_job("p", 0)).unwrap();
        store.dequeue_next("w", lease()).unwrap().unwrap();
        store
            .update(
                &job.id,
                JobPatch {
                    provider_job_id: Some("resp_1".into()),
                    ..JobPatch::default()
                },
            )
            .unwrap();
        let err = store
            .update(&job.id, JobPatch::status(JobStatus::Queued))
            .unwrap_err();
        assert!(matches!(err, DeepqError::StateConflict { .. }));
    }

    #[test]
    fn settlement_completes_and_is_idempotent() {
        let store = store();
        let job = store.enqueue(new_job("p", 0)).unwrap();
        store.dequeue_next("w", lease()).unwrap().unwrap();
        store
            .update(
                &job.id,
                JobPatch {
                    provider_job_id: Some("resp_1".into()),
                    ..JobPatch::default()
                },
            )
            .unwrap();

        let outcome = PendingSettlement {
            status: JobStatus::Completed,
            actual_cost: Some(Usd::from_cents(12)),
            reason: None,
            result: Some("report".into()),
        };
        let started = store.begin_settlement(&job.id, outcome.clone()).unwrap().unwrap();
        assert_eq!(started.status, JobStatus::Completed);
        assert_eq!(started.settlement, SettlementState::Pending);
        assert_eq!(store.pending_settlements().unwrap().len(), 1);

        assert!(store.begin_settlement(&job.id, outcome).unwrap().is_none());

        let done = store.finish_settlement(&job.id).unwrap();
        assert_eq!(done.settlement, SettlementState::Done);
        assert_eq!(done.actual_cost, Some(Usd::from_cents(12)));
        assert_eq!(done.result.as_deref(), Some("report"));
        assert_eq!(store.finish_settlement(&job.id).unwrap(), done);
        assert!(store.pending_settlements().unwrap().is_empty());
    }

    #[test]
    fn cancelled_in_flight_records_cost_but_never_completes() {
        let store = store();
        let job = store.enqueue(new_job("p", 0)).unwrap();
        store.dequeue_next("w", lease()).unwrap().unwrap();
        store
            .update(
                &job.id,
                JobPatch {
                    provider_job_id: Some("resp_1".into()),
                    ..JobPatch::default()
                },
            )
            .unwrap();
        store
            .update(&job.id, JobPatch::status(JobStatus::Cancelled))
            .unwrap();

        let settled = store
            .begin_settlement(
                &job.id,
                PendingSettlement {
                    status: JobStatus::Completed,
                    actual_cost: Some(Usd::from_cents(7)),
                    reason: None,
                    result: Some("late report".into()),
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(settled.status, JobStatus::Cancelled);
        let done = store.finish_settlement(&job.id).unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert_eq!(done.actual_cost, Some(Usd::from_cents(7)));
        assert!(done.result.is_none());
    }

    #[test]
    fn cancelled_mid_submission_still_takes_the_handle() {
        let store = store();
        let job = store.enqueue(new_job("p", 0)).unwrap();
        store.dequeue_next("w", lease()).unwrap().unwrap();
        store
            .update(&job.id, JobPatch::status(JobStatus::Cancelled))
            .unwrap();
        assert!(store.get(&job.id).unwrap().awaits_cancel_settlement());

        let handled = store
            .update(
                &job.id,
                JobPatch {
                    provider_job_id: Some("resp_9".into()),
                    ..JobPatch::default()
                },
            )
            .unwrap();
        assert_eq!(handled.status, JobStatus::Cancelled);
        assert_eq!(handled.provider_job_id.as_deref(), Some("resp_9"));
        assert!(store.renew_lease(&job.id, "w", lease()).unwrap());

        let rerouted = JobPatch {
            provider: Some(Provider::Gemini),
            ..JobPatch::default()
        };
        assert!(store.update(&job.id, rerouted).is_err());
        assert!(
            store
                .update(&job.id, JobPatch::status(JobStatus::Queued))
                .is_err()
        );
    }

    #[test]
    fn settled_job_rejects_a_late_handle() {
        let store = store();
        let job = store.enqueue(new_job("p", 0)).unwrap();
        store.dequeue_next("w", lease()).unwrap().unwrap();
        let cancelled = PendingSettlement {
            status: JobStatus::Cancelled,
            actual_cost: None,
            reason: Some("cancelled".into()),
            result: None,
        };
        store.begin_settlement(&job.id, cancelled).unwrap().unwrap();
        store.finish_settlement(&job.id).unwrap();

        let late = JobPatch {
            provider_job_id: Some("resp_2".into()),
            ..JobPatch::default()
        };
        assert!(matches!(
            store.update(&job.id, late),
            Err(DeepqError::StateConflict { .. })
        ));
    }

    #[test]
    fn expired_cancelled_job_is_adopted_for_settlement() {
        let store = store();
        let job = store.enqueue(new_job("p", 0)).unwrap();
        store
            .dequeue_next("w1", Duration::milliseconds(-1))
            .unwrap()
            .unwrap();
        store
            .update(&job.id, JobPatch::status(JobStatus::Cancelled))
            .unwrap();

        let adopted = store.adopt_orphan("w2", lease()).unwrap().unwrap();
        assert_eq!(adopted.id, job.id);
        assert_eq!(adopted.status, JobStatus::Cancelled);
        assert!(adopted.awaits_cancel_settlement());
    }

    #[test]
    fn stored_model_is_read_back_unchanged() {
        let store = store();
        let job = store.enqueue(new_job("p", 0)).unwrap();
        store
            .db
            .lock()
            .unwrap()
            .execute("UPDATE jobs SET model = '' WHERE id = ?1", [job.id.as_str()])
            .unwrap();
        assert_eq!(store.get(&job.id).unwrap().model, "");
    }

    #[test]
    fn reaped_job_accepts_one_late_charge() {
        let store = store();
        let job = store.enqueue(new_job("p", 0)).unwrap();
        store.dequeue_next("w", lease()).unwrap().unwrap();
        let reaped = PendingSettlement {
            status: JobStatus::Failed,
            actual_cost: None,
            reason: Some("reaped".into()),
            result: None,
        };
        store.begin_settlement(&job.id, reaped).unwrap().unwrap();
        store.finish_settlement(&job.id).unwrap();

        let late = PendingSettlement {
            status: JobStatus::Completed,
            actual_cost: Some(Usd::from_cents(9)),
            reason: None,
            result: None,
        };
        let charged = store.begin_settlement(&job.id, late.clone()).unwrap().unwrap();
        assert_eq!(charged.status, JobStatus::Failed);
        store.finish_settlement(&job.id).unwrap();
        assert!(store.begin_settlement(&job.id, late).unwrap().is_none());
        assert_eq!(store.get(&job.id).unwrap().actual_cost, Some(Usd::from_cents(9)));
    }

    #[test]
    fn stale_and_orphan_detection() {
        let store = store();
        let job = store.enqueue(new_job("p", 0)).unwrap();
        store.dequeue_next("w1", Duration::milliseconds(-1)).unwrap().unwrap();

        let (hour, past) = (Duration::hours(1), Duration::seconds(-1));
        assert_eq!(store.stale_jobs(hour, past).unwrap().len(), 1);
        assert!(store.stale_jobs(past, hour).unwrap().is_empty());

        let adopted = store.adopt_orphan("w2", lease()).unwrap().unwrap();
        assert_eq!(adopted.id, job.id);
        assert_eq!(adopted.lease_owner.as_deref(), Some("w2"));
        assert!(store.adopt_orphan("w3", lease()).unwrap().is_none());
        assert!(store.renew_lease(&job.id, "w2", lease()).unwrap());
        assert!(!store.renew_lease(&job.id, "w1", lease()).unwrap());
    }

    #[test]
    fn events_and_listing() {
        let store = store();
        let job = store.enqueue(new_job("p", 3)).unwrap();
        store.enqueue(new_job("q", 0)).unwrap();
        store.update(&job.id, JobPatch::status(JobStatus::Cancelled)).unwrap();

        let events = store.events(&job.id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].old_status, None);
        assert_eq!(events[1].new_status, JobStatus::Cancelled);

        let cancelled = store
            .list(&JobFilter::default().with_status(JobStatus::Cancelled))
            .unwrap();
        assert_eq!(cancelled.len(), 1);
        let high = store
            .list(&JobFilter {
                min_priority: Some(1),
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(high[0].id, job.id);
        assert!(store.update(&job.id, JobPatch::status(JobStatus::Queued)).is_err());
    }

    #[test]
    fn unknown_provider_is_rejected_on_enqueue() {
        let store = store();
        let mut job = new_job("p", 0);
        job.provider = Provider::Unknown;
        assert!(matches!(
            store.enqueue(job),
            Err(DeepqError::InvalidRequest(_))
        ));
    }
}
