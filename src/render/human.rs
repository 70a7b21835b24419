//! Plain-text output for operators.

use std::fmt::Write as _;

use crate::core::budgets::LedgerStatus;
use crate::core::engine::{ReapReport, ReconcileReport, Submitted};
use crate::core::events::JobEvent;
use crate::core::health::HealthSnapshot;
use crate::core::models::{Job, JobResult, JobStatusView};
use crate::core::pricing::CostEstimate;
use crate::core::router::RouteExplanation;
use crate::util::format_relative_time;

/// Text rendering of a command result.
pub trait HumanRender {
    fn render_human(&self) -> String;
}

/// A one-line acknowledgement, e.g. for `pause`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Message {
    pub message: String,
}

impl Message {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl HumanRender for Message {
    fn render_human(&self) -> String {
        format!("{}\n", self.message)
    }
}

impl HumanRender for Submitted {
    fn render_human(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Queued {}", self.job_id);
        let _ = writeln!(out, "  provider: {} ({})", self.provider, self.model);
        let _ = writeln!(
            out,
            "  estimate: {} (range {} - {})",
            self.estimate.expected, self.estimate.low, self.estimate.high
        );
        for w in &self.warnings {
            let _ = writeln!(
                out,
                "  warning: {} budget '{}' at {:.0}% of {}",
                w.scope,
                w.key,
                w.utilization * 100.0,
                w.limit
            );
        }
        out
    }
}

impl HumanRender for JobStatusView {
    fn render_human(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}  {}", self.id, self.status);
        let _ = writeln!(out, "  provider:   {} ({})", self.provider, self.model);
        if let Some(handle) = &self.provider_job_id {
            let _ = writeln!(out, "  handle:     {handle}");
        }
        let _ = writeln!(out, "  estimate:   {}", self.cost_estimate);
        let _ = writeln!(out, "  cost:       {}", self.cost_so_far);
        if self.retry_count > 0 {
            let _ = writeln!(out, "  retries:    {}", self.retry_count);
        }
        if let Some(err) = &self.error {
            let _ = writeln!(out, "  error:      {err}");
        }
        let _ = writeln!(out, "  settlement: {}", self.settlement.as_str());
        out
    }
}

impl HumanRender for JobResult {
    fn render_human(&self) -> String {
        match self {
            Self::Ready { artifact, cost } => format!("{artifact}\n\n(cost {cost})\n"),
            Self::NotReady { status } => format!("Not ready: job is {status}\n"),
            Self::Failed { reason } => format!("Failed: {reason}\n"),
            Self::Cancelled { reason } => match reason {
                Some(reason) => format!("Cancelled: {reason}\n"),
                None => "Cancelled\n".to_string(),
            },
        }
    }
}

impl HumanRender for [Job] {
    fn render_human(&self) -> String {
        if self.is_empty() {
            return "No jobs.\n".to_string();
        }
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<36}  {:<10}  {:>4}  {:<7}  {:>10}  SUBMITTED",
            "ID", "STATUS", "PRI", "PROVIDER", "COST"
        );
        for job in self {
            let _ = writeln!(
                out,
                "{:<36}  {:<10}  {:>4}  {:<7}  {:>10}  {}",
                job.id.as_str(),
                job.status.as_str(),
                job.priority,
                job.provider.cli_name(),
                job.cost_so_far().to_string(),
                format_relative_time(job.submitted_at)
            );
        }
        out
    }
}

impl HumanRender for [JobEvent] {
    fn render_human(&self) -> String {
        let mut out = String::new();
        for event in self {
            let from = event.old_status.map_or("-", |s| s.as_str());
            let _ = write!(
                out,
                "{}  {:>10} -> {:<10}  {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                from,
                event.new_status.as_str(),
                event.provider
            );
            if let Some(note) = &event.note {
                let _ = write!(out, "  {note}");
            }
            out.push('\n');
        }
        out
    }
}

impl HumanRender for [HealthSnapshot] {
    fn render_human(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<8}  {:<9}  {:>7}  {:>8}  {:>8}  {:>5}  PROBE",
            "PROVIDER", "CIRCUIT", "SUCCESS", "P50", "P95", "FAILS"
        );
        for h in self {
            let _ = writeln!(
                out,
                "{:<8}  {:<9}  {:>6.1}%  {:>6}ms  {:>6}ms  {:>5}  {}",
                h.provider.cli_name(),
                h.circuit_state.as_str(),
                h.success_rate * 100.0,
                h.latency_p50_ms,
                h.latency_p95_ms,
                h.consecutive_failures,
                if h.probe_in_flight { "yes" } else { "no" }
            );
        }
        out
    }
}

impl HumanRender for LedgerStatus {
    fn render_human(&self) -> String {
        let mut out = String::new();
        if self.paused {
            let _ = writeln!(
                out,
                "Ledger PAUSED: {}",
                self.reason.as_deref().unwrap_or("no reason given")
            );
        } else {
            let _ = writeln!(out, "Ledger accepting new jobs");
        }
        if self.scopes.is_empty() {
            let _ = writeln!(out, "No budget scopes recorded.");
            return out;
        }
        let _ = writeln!(
            out,
            "{:<8}  {:<24}  {:>10}  {:>10}  {:>10}  {:>10}",
            "SCOPE", "KEY", "LIMIT", "COMMITTED", "SPENT", "REMAINING"
        );
        for s in &self.scopes {
            let _ = writeln!(
                out,
                "{:<8}  {:<24}  {:>10}  {:>10}  {:>10}  {:>10}",
                s.kind.as_str(),
                s.key,
                s.limit.to_string(),
                s.committed.to_string(),
                s.spent.to_string(),
                s.remaining().to_string()
            );
        }
        out
    }
}

impl HumanRender for ReapReport {
    fn render_human(&self) -> String {
        let mut out = format!("Reaped {} stale job(s)\n", self.cancelled.len());
        for id in &self.cancelled {
            let _ = writeln!(out, "  {id}");
        }
        out
    }
}

impl HumanRender for ReconcileReport {
    fn render_human(&self) -> String {
        let mut out = format!("Settled {} pending job(s)\n", self.settled);
        for (id, err) in &self.failed {
            let _ = writeln!(out, "  still pending {id}: {err}");
        }
        for id in &self.unknown_provider {
            let _ = writeln!(out, "  no known provider {id}: needs operator action");
        }
        out
    }
}

impl HumanRender for [RouteExplanation] {
    fn render_human(&self) -> String {
        let mut out = String::new();
        for r in self {
            let state = r.circuit_state.map_or("-", |s| s.as_str());
            let _ = write!(
                out,
                "{:<8}  {:<24}  score {:.3}  {:<9}  est {}",
                r.provider.cli_name(),
                r.model,
                r.score,
                state,
                r.estimate
            );
            if let Some(excluded) = &r.excluded {
                let _ = write!(out, "  excluded: {excluded}");
            }
            out.push('\n');
        }
        out
    }
}

impl HumanRender for CostEstimate {
    fn render_human(&self) -> String {
        format!(
            "{} on {} ({} in / {} out tokens): {} (range {} - {})\n",
            self.model,
            self.provider,
            self.input_tokens,
            self.output_tokens,
            self.expected,
            self.low,
            self.high
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::money::Usd;

    #[test]
    fn result_variants_render() {
        let ready = JobResult::Ready {
            artifact: "Findings".into(),
            cost: Usd::from_cents(42),
        };
        assert!(ready.render_human().contains("(cost $0.42)"));
        let cancelled = JobResult::Cancelled { reason: None };
        assert_eq!(cancelled.render_human(), "Cancelled\n");
    }

    #[test]
    fn empty_job_list() {
        let jobs: Vec<Job> = Vec::new();
        assert_eq!(jobs.render_human(), "No jobs.\n");
    }

    #[test]
    fn reconcile_lists_stranded_jobs() {
        let report = ReconcileReport {
            settled: 2,
            failed: vec![],
            unknown_provider: vec!["legacy-1".into()],
        };
        let text = report.render_human();
        assert!(text.starts_with("Settled 2"));
        assert!(text.contains("legacy-1"));
    }
}
