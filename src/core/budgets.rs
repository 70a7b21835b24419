//! Budget ledger: scoped spending envelopes, reservations and settlement.
//!
//! Every admitted job holds a reservation against each applicable scope
//! (per-job, per-session, daily, monthly). Admission checks and increments all
//! scopes inside one `IMMEDIATE` transaction, so checks and settlements never
//! interleave.
//!
//! ## TOML Configuration Format
//!
//! ```toml
//! [budget]
//! daily = 10.0
//! monthly = 150.0
//! per_job = 2.0
//! per_session = 5.0
//! warn_percent = 80
//! auto_pause_on_monthly_cap = true
//! ```

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use super::events::{BudgetEvent, EventBus};
use super::models::{BudgetConstraints, JobId};
use super::money::Usd;
use crate::error::{DeepqError, Result};
use crate::storage::schema::Database;
use crate::util::time::{day_key, month_key, parse_opt_timestamp, to_db_timestamp};

/// Default soft-warning threshold.
pub const DEFAULT_WARN_PERCENT: u8 = 80;

// =============================================================================
// Scope Kinds
// =============================================================================

/// Kinds of spending envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Job,
    Session,
    Daily,
    Monthly,
}

impl ScopeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Session => "session",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    /// # Errors
    /// Returns `Storage` for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "job" => Ok(Self::Job),
            "session" => Ok(Self::Session),
            "daily" => Ok(Self::Daily),
            "monthly" => Ok(Self::Monthly),
            other => Err(DeepqError::Storage(format!("unknown scope kind '{other}'"))),
        }
    }
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Budget Limits
// =============================================================================

/// Configured limits. A missing limit means the scope is not enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub daily: Option<Usd>,
    pub monthly: Option<Usd>,
    pub per_job: Option<Usd>,
    pub per_session: Option<Usd>,
    /// Projected utilisation (percent) at which admission warns.
    pub warn_percent: u8,
    /// Pause the ledger once monthly spend reaches the monthly limit.
    pub auto_pause_on_monthly_cap: bool,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            daily: None,
            monthly: None,
            per_job: None,
            per_session: None,
            warn_percent: DEFAULT_WARN_PERCENT,
            auto_pause_on_monthly_cap: true,
        }
    }
}

fn tightest(a: Option<Usd>, b: Option<Usd>) -> Option<Usd> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

// =============================================================================
// Ledger records
// =============================================================================

/// Balance of one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeBalance {
    pub kind: ScopeKind,
    pub key: String,
    pub limit: Usd,
    pub committed: Usd,
    pub spent: Usd,
}

impl ScopeBalance {
    /// Headroom left for new reservations.
    #[must_use]
    pub fn remaining(&self) -> Usd {
        self.limit.saturating_sub(self.committed + self.spent)
    }

    #[must_use]
    pub fn utilization(&self) -> f64 {
        (self.committed + self.spent).ratio_of(self.limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Held,
    Settled,
    Released,
}

impl ReservationState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Settled => "settled",
            Self::Released => "released",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "held" => Ok(Self::Held),
            "settled" => Ok(Self::Settled),
            "released" => Ok(Self::Released),
            other => Err(DeepqError::Storage(format!(
                "unknown reservation state '{other}'"
            ))),
        }
    }
}

/// Budget held for one job across its scopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub id: String,
    pub job_id: JobId,
    pub amount: Usd,
    pub state: ReservationState,
    pub actual_cost: Option<Usd>,
    pub scopes: Vec<(ScopeKind, String)>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// A scope whose projected utilisation is at or above the warning threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetWarning {
    pub scope: ScopeKind,
    pub key: String,
    pub utilization: f64,
    pub limit: Usd,
}

/// Successful admission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub reservation: Reservation,
    pub warnings: Vec<BudgetWarning>,
}

/// What `settle` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Held reservation converted to spend.
    Settled,
    /// Reservation had been released; the charge was added to spend only.
    LateCharge,
    /// Already settled; nothing changed.
    AlreadySettled,
}

/// Ledger pause flag and scope balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStatus {
    pub paused: bool,
    pub reason: Option<String>,
    pub paused_at: Option<DateTime<Utc>>,
    pub scopes: Vec<ScopeBalance>,
}

struct ScopeTarget {
    kind: ScopeKind,
    key: String,
    limit: Usd,
}

// =============================================================================
// Budget Ledger
// =============================================================================

/// Owner of all budget scope balances.
#[derive(Debug, Clone)]
pub struct BudgetLedger {
    db: Database,
    limits: BudgetLimits,
    events: EventBus,
}

impl BudgetLedger {
    #[must_use]
    pub const fn new(db: Database, limits: BudgetLimits, events: EventBus) -> Self {
        Self { db, limits, events }
    }

    #[must_use]
    pub const fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    fn scope_targets(
        &self,
        job_id: &JobId,
        constraints: &BudgetConstraints,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScopeTarget>> {
        if constraints.session_limit.is_some() && constraints.session_id.is_none() {
            return Err(DeepqError::InvalidRequest(
                "session_limit requires session_id".to_string(),
            ));
        }

        let mut targets = Vec::with_capacity(4);
        if let Some(limit) = tightest(self.limits.per_job, constraints.max_cost) {
            targets.push(ScopeTarget {
                kind: ScopeKind::Job,
                key: job_id.to_string(),
                limit,
            });
        }
        if let Some(session) = &constraints.session_id {
            if let Some(limit) = tightest(self.limits.per_session, constraints.session_limit) {
                targets.push(ScopeTarget {
                    kind: ScopeKind::Session,
                    key: session.clone(),
                    limit,
                });
            }
        }
        if let Some(limit) = self.limits.daily {
            targets.push(ScopeTarget {
                kind: ScopeKind::Daily,
                key: day_key(now),
                limit,
            });
        }
        if let Some(limit) = self.limits.monthly {
            targets.push(ScopeTarget {
                kind: ScopeKind::Monthly,
                key: month_key(now),
                limit,
            });
        }
        Ok(targets)
    }

    /// Reserve `amount` for `job_id` in every applicable scope, or reject.
    ///
    /// Rejections name the first scope (job, session, daily, monthly order)
    /// that cannot absorb the amount, with its limit and shortfall. Nothing is
    /// written on rejection.
    ///
    /// # Errors
    /// Returns `LedgerPaused`, `BudgetExceeded`, `InvalidRequest` or a storage error.
    pub fn admit(
        &self,
        job_id: &JobId,
        amount: Usd,
        constraints: &BudgetConstraints,
    ) -> Result<Admission> {
        if amount < Usd::ZERO {
            return Err(DeepqError::InvalidRequest(
                "reservation amount is negative".to_string(),
            ));
        }
        let now = Utc::now();
        let now_s = to_db_timestamp(now);
        let targets = self.scope_targets(job_id, constraints, now)?;
        let threshold = f64::from(self.limits.warn_percent) / 100.0;

        let (reservation, warnings) = {
            let mut conn = self.db.lock()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| DeepqError::storage("begin admission", e))?;

            if paused_flag(&tx)? {
                let reason = read_pause(&tx)?.1.unwrap_or_else(|| "paused".to_string());
                tracing::warn!(job_id = %job_id, reason, "Admission rejected: ledger paused");
                return Err(DeepqError::LedgerPaused { reason });
            }

            let mut warnings = Vec::new();
            for target in &targets {
                let balance = upsert_scope(&tx, target, &now_s)?;
                let projected = balance.committed + balance.spent + amount;
                if projected > balance.limit {
                    let shortfall = amount - balance.remaining();
                    tracing::warn!(
                        job_id = %job_id,
                        scope = %target.kind,
                        key = %target.key,
                        limit = %balance.limit,
                        shortfall = %shortfall,
                        "Admission rejected"
                    );
                    return Err(DeepqError::BudgetExceeded {
                        scope: target.kind.to_string(),
                        key: target.key.clone(),
                        limit: balance.limit,
                        shortfall,
                    });
                }
                let utilization = projected.ratio_of(balance.limit);
                if utilization >= threshold {
                    warnings.push(BudgetWarning {
                        scope: target.kind,
                        key: target.key.clone(),
                        utilization,
                        limit: balance.limit,
                    });
                }
            }

            let reservation_id = uuid::Uuid::new_v4().to_string();
            for target in &targets {
                tx.execute(
                    "UPDATE budget_scopes SET committed_micros = committed_micros + ?3, updated_at = ?4 \
                     WHERE kind = ?1 AND key = ?2",
                    params![target.kind.as_str(), target.key, amount.micros(), now_s],
                )
                .map_err(|e| DeepqError::storage("commit scope", e))?;
                tx.execute(
                    "INSERT INTO reservation_scopes (reservation_id, kind, key) VALUES (?1, ?2, ?3)",
                    params![reservation_id, target.kind.as_str(), target.key],
                )
                .map_err(|e| DeepqError::storage("link reservation scope", e))?;
            }
            tx.execute(
                "INSERT INTO reservations (id, job_id, amount_micros, state, created_at) \
                 VALUES (?1, ?2, ?3, 'held', ?4)",
                params![reservation_id, job_id.as_str(), amount.micros(), now_s],
            )
            .map_err(|e| DeepqError::storage("insert reservation", e))?;
            tx.commit()
                .map_err(|e| DeepqError::storage("commit admission", e))?;

            let reservation = Reservation {
                id: reservation_id,
                job_id: job_id.clone(),
                amount,
                state: ReservationState::Held,
                actual_cost: None,
                scopes: targets.iter().map(|t| (t.kind, t.key.clone())).collect(),
                created_at: now,
                closed_at: None,
            };
            (reservation, warnings)
        };

        for warning in &warnings {
            tracing::warn!(
                scope = %warning.scope,
                key = %warning.key,
                utilization = warning.utilization,
                "Budget utilisation above warning threshold"
            );
            self.events.budget(BudgetEvent::Warning {
                scope: warning.scope,
                key: warning.key.clone(),
                utilization: warning.utilization,
                limit: warning.limit,
            });
        }
        tracing::debug!(job_id = %job_id, amount = %amount, reservation = %reservation.id, "Admitted");
        Ok(Admission {
            reservation,
            warnings,
        })
    }

    /// Convert a reservation into spend.
    ///
    /// Held: `committed -= amount`, `spent += actual` in every scope. Released:
    /// `spent += actual` only. Settled: no-op. Pause does not block settlement.
    ///
    /// # Errors
    /// Returns `ReservationNotFound` or a storage error.
    pub fn settle(&self, reservation_id: &str, actual: Usd) -> Result<SettleOutcome> {
        let now_s = to_db_timestamp(Utc::now());
        let (outcome, reservation) = {
            let mut conn = self.db.lock()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| DeepqError::storage("begin settle", e))?;
            let reservation = load_reservation(&tx, reservation_id)?
                .ok_or_else(|| DeepqError::ReservationNotFound(reservation_id.to_string()))?;

            let (outcome, release) = match reservation.state {
                ReservationState::Settled => return Ok(SettleOutcome::AlreadySettled),
                ReservationState::Held => (SettleOutcome::Settled, reservation.amount),
                ReservationState::Released => (SettleOutcome::LateCharge, Usd::ZERO),
            };
            for (kind, key) in &reservation.scopes {
                tx.execute(
                    "UPDATE budget_scopes SET \
                       committed_micros = MAX(0, committed_micros - ?3), \
                       spent_micros = spent_micros + ?4, updated_at = ?5 \
                     WHERE kind = ?1 AND key = ?2",
                    params![kind.as_str(), key, release.micros(), actual.micros(), now_s],
                )
                .map_err(|e| DeepqError::storage("settle scope", e))?;
            }
            tx.execute(
                "UPDATE reservations SET state = 'settled', actual_cost_micros = ?2, closed_at = ?3 \
                 WHERE id = ?1",
                params![reservation_id, actual.micros(), now_s],
            )
            .map_err(|e| DeepqError::storage("close reservation", e))?;
            tx.commit()
                .map_err(|e| DeepqError::storage("commit settle", e))?;
            (outcome, reservation)
        };

        tracing::info!(
            job_id = %reservation.job_id,
            reservation = reservation_id,
            reserved = %reservation.amount,
            actual = %actual,
            late = outcome == SettleOutcome::LateCharge,
            "Reservation settled"
        );
        self.check_monthly_cap(&reservation)?;
        Ok(outcome)
    }

    /// Return a held reservation without touching spend. Returns whether
    /// anything was released.
    ///
    /// # Errors
    /// Returns `ReservationNotFound` or a storage error.
    pub fn release(&self, reservation_id: &str) -> Result<bool> {
        let now_s = to_db_timestamp(Utc::now());
        let mut conn = self.db.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| DeepqError::storage("begin release", e))?;
        let reservation = load_reservation(&tx, reservation_id)?
            .ok_or_else(|| DeepqError::ReservationNotFound(reservation_id.to_string()))?;
        if reservation.state != ReservationState::Held {
            return Ok(false);
        }
        for (kind, key) in &reservation.scopes {
            tx.execute(
                "UPDATE budget_scopes SET committed_micros = MAX(0, committed_micros - ?3), updated_at = ?4 \
                 WHERE kind = ?1 AND key = ?2",
                params![kind.as_str(), key, reservation.amount.micros(), now_s],
            )
            .map_err(|e| DeepqError::storage("release scope", e))?;
        }
        tx.execute(
            "UPDATE reservations SET state = 'released', closed_at = ?2 WHERE id = ?1",
            params![reservation_id, now_s],
        )
        .map_err(|e| DeepqError::storage("close reservation", e))?;
        tx.commit()
            .map_err(|e| DeepqError::storage("commit release", e))?;
        tracing::info!(
            job_id = %reservation.job_id,
            reservation = reservation_id,
            amount = %reservation.amount,
            "Reservation released"
        );
        Ok(true)
    }

    /// # Errors
    /// Returns `ReservationNotFound` or a storage error.
    pub fn reservation(&self, reservation_id: &str) -> Result<Reservation> {
        let conn = self.db.lock()?;
        load_reservation(&conn, reservation_id)?
            .ok_or_else(|| DeepqError::ReservationNotFound(reservation_id.to_string()))
    }

    /// Balance of one scope, if it has ever been used.
    ///
    /// # Errors
    /// Returns a storage error if the query fails.
    pub fn scope(&self, kind: ScopeKind, key: &str) -> Result<Option<ScopeBalance>> {
        let conn = self.db.lock()?;
        conn.query_row(
            "SELECT kind, key, limit_micros, committed_micros, spent_micros \
             FROM budget_scopes WHERE kind = ?1 AND key = ?2",
            params![kind.as_str(), key],
            scope_row,
        )
        .optional()
        .map_err(|e| DeepqError::storage("read scope", e))?
        .map(into_balance)
        .transpose()
    }

    /// All scopes, most recently touched first.
    ///
    /// # Errors
    /// Returns a storage error if the query fails.
    pub fn snapshot(&self) -> Result<Vec<ScopeBalance>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT kind, key, limit_micros, committed_micros, spent_micros \
                 FROM budget_scopes ORDER BY updated_at DESC, kind, key",
            )
            .map_err(|e| DeepqError::storage("prepare snapshot", e))?;
        let rows = stmt
            .query_map([], scope_row)
            .map_err(|e| DeepqError::storage("query scopes", e))?;
        let mut scopes = Vec::new();
        for row in rows {
            scopes.push(into_balance(
                row.map_err(|e| DeepqError::storage("read scope", e))?,
            )?);
        }
        Ok(scopes)
    }

    /// Pause flag plus balances of the current daily and monthly scopes and
    /// every open session or job scope.
    ///
    /// # Errors
    /// Returns a storage error if the query fails.
    pub fn status(&self) -> Result<LedgerStatus> {
        let (paused, reason, paused_at) = {
            let conn = self.db.lock()?;
            let (paused_at, reason) = read_pause(&conn)?;
            (paused_flag(&conn)?, reason, paused_at)
        };
        Ok(LedgerStatus {
            paused,
            reason,
            paused_at,
            scopes: self.snapshot()?,
        })
    }

    /// Stop admitting new work. In-flight jobs still settle.
    ///
    /// # Errors
    /// Returns a storage error if the update fails.
    pub fn pause(&self, reason: &str) -> Result<()> {
        {
            let conn = self.db.lock()?;
            conn.execute(
                "UPDATE ledger_state SET paused = 1, reason = ?1, paused_at = ?2 WHERE id = 1",
                params![reason, to_db_timestamp(Utc::now())],
            )
            .map_err(|e| DeepqError::storage("pause ledger", e))?;
        }
        tracing::warn!(reason, "Ledger paused");
        self.events.budget(BudgetEvent::Paused {
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// # Errors
    /// Returns a storage error if the update fails.
    pub fn resume(&self) -> Result<()> {
        {
            let conn = self.db.lock()?;
            conn.execute(
                "UPDATE ledger_state SET paused = 0, reason = NULL, paused_at = NULL WHERE id = 1",
                [],
            )
            .map_err(|e| DeepqError::storage("resume ledger", e))?;
        }
        tracing::info!("Ledger resumed");
        self.events.budget(BudgetEvent::Resumed);
        Ok(())
    }

    /// # Errors
    /// Returns a storage error if the query fails.
    pub fn is_paused(&self) -> Result<bool> {
        let conn = self.db.lock()?;
        paused_flag(&conn)
    }

    fn check_monthly_cap(&self, reservation: &Reservation) -> Result<()> {
        if !self.limits.auto_pause_on_monthly_cap {
            return Ok(());
        }
        for (kind, key) in &reservation.scopes {
            if *kind != ScopeKind::Monthly {
                continue;
            }
            if let Some(balance) = self.scope(*kind, key)? {
                if balance.spent >= balance.limit && !self.is_paused()? {
                    self.pause(&format!(
                        "monthly cap reached for {key}: spent {} of {}",
                        balance.spent, balance.limit
                    ))?;
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Row helpers
// =============================================================================

type ScopeRow = (String, String, i64, i64, i64);

fn scope_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScopeRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_balance((kind, key, limit, committed, spent): ScopeRow) -> Result<ScopeBalance> {
    Ok(ScopeBalance {
        kind: ScopeKind::parse(&kind)?,
        key,
        limit: Usd::from_micros(limit),
        committed: Usd::from_micros(committed),
        spent: Usd::from_micros(spent),
    })
}

/// Create the scope if needed and bring its limit in line with the target.
///
/// Calendar scopes follow the configured limit. Job and session limits only
/// ever tighten.
fn upsert_scope(tx: &Transaction<'_>, target: &ScopeTarget, now_s: &str) -> Result<ScopeBalance> {
    tx.execute(
        "INSERT OR IGNORE INTO budget_scopes (kind, key, limit_micros, updated_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![target.kind.as_str(), target.key, target.limit.micros(), now_s],
    )
    .map_err(|e| DeepqError::storage("create scope", e))?;
    let sql = match target.kind {
        ScopeKind::Daily | ScopeKind::Monthly => {
            "UPDATE budget_scopes SET limit_micros = ?3 WHERE kind = ?1 AND key = ?2"
        }
        ScopeKind::Job | ScopeKind::Session => {
            "UPDATE budget_scopes SET limit_micros = MIN(limit_micros, ?3) WHERE kind = ?1 AND key = ?2"
        }
    };
    tx.execute(sql, params![target.kind.as_str(), target.key, target.limit.micros()])
        .map_err(|e| DeepqError::storage("update scope limit", e))?;
    let row = tx
        .query_row(
            "SELECT kind, key, limit_micros, committed_micros, spent_micros \
             FROM budget_scopes WHERE kind = ?1 AND key = ?2",
            params![target.kind.as_str(), target.key],
            scope_row,
        )
        .map_err(|e| DeepqError::storage("read scope", e))?;
    into_balance(row)
}

fn load_reservation(conn: &rusqlite::Connection, id: &str) -> Result<Option<Reservation>> {
    let row: Option<(String, i64, String, Option<i64>, String, Option<String>)> = conn
        .query_row(
            "SELECT job_id, amount_micros, state, actual_cost_micros, created_at, closed_at \
             FROM reservations WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| DeepqError::storage("load reservation", e))?;
    let Some((job_id, amount, state, actual, created_at, closed_at)) = row else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare_cached("SELECT kind, key FROM reservation_scopes WHERE reservation_id = ?1")
        .map_err(|e| DeepqError::storage("prepare reservation scopes", e))?;
    let rows = stmt
        .query_map([id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(|e| DeepqError::storage("query reservation scopes", e))?;
    let mut scopes = Vec::new();
    for row in rows {
        let (kind, key) = row.map_err(|e| DeepqError::storage("read reservation scope", e))?;
        scopes.push((ScopeKind::parse(&kind)?, key));
    }
    scopes.sort();

    Ok(Some(Reservation {
        id: id.to_string(),
        job_id: JobId::from(job_id),
        amount: Usd::from_micros(amount),
        state: ReservationState::parse(&state)?,
        actual_cost: actual.map(Usd::from_micros),
        scopes,
        created_at: crate::util::time::parse_db_timestamp(&created_at)?,
        closed_at: parse_opt_timestamp(closed_at)?,
    }))
}

fn paused_flag(conn: &rusqlite::Connection) -> Result<bool> {
    let paused: i64 = conn
        .query_row("SELECT paused FROM ledger_state WHERE id = 1", [], |row| {
            row.get(0)
        })
        .map_err(|e| DeepqError::storage("read ledger state", e))?;
    Ok(paused != 0)
}

fn read_pause(conn: &rusqlite::Connection) -> Result<(Option<DateTime<Utc>>, Option<String>)> {
    let (paused, reason, at): (i64, Option<String>, Option<String>) = conn
        .query_row(
            "SELECT paused, reason, paused_at FROM ledger_state WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|e| DeepqError::storage("read ledger state", e))?;
    if paused == 0 {
        return Ok((None, None));
    }
    Ok((parse_opt_timestamp(at)?, reason))
}
