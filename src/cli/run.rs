//! Long-running worker mode.

use tokio::time::{Duration, MissedTickBehavior, interval};

use super::Context;
use crate::error::Result;
use crate::render::Message;

/// Finish interrupted settlements, start the worker pool, and reap stale jobs
/// on a fixed interval until Ctrl+C.
///
/// # Errors
/// Returns an error if startup reconciliation fails.
pub async fn execute(ctx: &Context) -> Result<()> {
    let engine = &ctx.engine;
    let workers = ctx.resolved.config.general.workers;

    let recovered = engine.reconcile()?;
    if recovered.settled > 0 || !recovered.failed.is_empty() {
        tracing::info!(
            settled = recovered.settled,
            failed = recovered.failed.len(),
            "Recovered interrupted settlements"
        );
    }
    for id in &recovered.unknown_provider {
        tracing::warn!(job_id = %id, "Job has no routable provider; cancel it or fix its row");
    }

    let pool = engine.spawn_workers(workers);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    let reap_every = engine.settings().reaper.interval_secs;
    let mut ticker = interval(Duration::from_secs(reap_every.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick(), if reap_every > 0 => {
                match engine.reap_stale() {
                    Ok(report) if !report.cancelled.is_empty() => {
                        tracing::info!(count = report.cancelled.len(), "Reaped stale jobs");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Reaper pass failed"),
                }
            }
            _ = &mut shutdown_rx => break,
        }
    }

    tracing::info!("Shutting down");
    let count = pool.len();
    pool.shutdown().await;
    ctx.emit("run", &Message::new(format!("Stopped {count} worker(s)")))
}
