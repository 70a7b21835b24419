//! Operator commands: reap, reconcile, health, budget, pause, resume, route, cleanup.

use serde::Serialize;

use super::Context;
use super::args::{CleanupArgs, PauseArgs, ReapArgs, RouteArgs};
use super::jobs::spec_from_args;
use crate::core::pricing::CostEstimate;
use crate::core::router::RouteExplanation;
use crate::error::{DeepqError, Result};
use crate::render::{HumanRender, Message};

/// # Errors
/// Returns a storage error.
pub fn reap(ctx: &Context, args: &ReapArgs) -> Result<()> {
    let mut reaper = ctx.engine.settings().reaper.clone();
    if let Some(secs) = args.queued_timeout {
        reaper.queued_timeout_secs = secs;
    }
    if let Some(secs) = args.processing_timeout {
        reaper.processing_timeout_secs = secs;
    }
    let report = ctx
        .engine
        .reap_stale_with(reaper.queued_timeout(), reaper.processing_timeout())?;
    ctx.emit("reap", &report)
}

/// # Errors
/// Returns a storage error.
pub fn reconcile(ctx: &Context) -> Result<()> {
    let report = ctx.engine.reconcile()?;
    ctx.emit("reconcile", &report)
}

/// # Errors
/// Returns a storage error.
pub fn health(ctx: &Context) -> Result<()> {
    let snapshots = ctx.engine.health()?;
    ctx.emit("health", snapshots.as_slice())
}

/// # Errors
/// Returns a storage error.
pub fn budget(ctx: &Context) -> Result<()> {
    let status = ctx.engine.budget()?;
    ctx.emit("budget", &status)
}

/// # Errors
/// Returns a storage error.
pub fn pause(ctx: &Context, args: &PauseArgs) -> Result<()> {
    ctx.engine.pause(&args.reason)?;
    ctx.emit("pause", &Message::new(format!("Ledger paused: {}", args.reason)))
}

/// # Errors
/// Returns a storage error.
pub fn resume(ctx: &Context) -> Result<()> {
    ctx.engine.resume()?;
    ctx.emit("resume", &Message::new("Ledger resumed"))
}

#[derive(Debug, Serialize)]
struct RoutePlan {
    estimate: Option<CostEstimate>,
    candidates: Vec<RouteExplanation>,
}

impl HumanRender for RoutePlan {
    fn render_human(&self) -> String {
        let mut out = self.candidates.render_human();
        match &self.estimate {
            Some(estimate) => {
                out.push_str("\nWould bind: ");
                out.push_str(&estimate.render_human());
            }
            None => out.push_str("\nNo provider is currently routable.\n"),
        }
        out
    }
}

/// # Errors
/// Returns request validation errors.
pub fn route(ctx: &Context, args: &RouteArgs) -> Result<()> {
    let spec = spec_from_args(&args.spec)?;
    let candidates = ctx.engine.explain_routing(&spec)?;
    let estimate = match ctx.engine.estimate(&spec) {
        Ok(estimate) => Some(estimate),
        Err(DeepqError::NoEligibleProvider { .. }) => None,
        Err(e) => return Err(e),
    };
    ctx.emit(
        "route",
        &RoutePlan {
            estimate,
            candidates,
        },
    )
}

/// # Errors
/// Returns a storage error.
pub fn cleanup(ctx: &Context, args: &CleanupArgs) -> Result<()> {
    let days = args
        .older_than_days
        .unwrap_or(ctx.resolved.config.general.retention_days);
    let removed = ctx.engine.cleanup(days)?;
    ctx.emit(
        "cleanup",
        &Message::new(format!("Removed {removed} job(s) older than {days} day(s)")),
    )
}
