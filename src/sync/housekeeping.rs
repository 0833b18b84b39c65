//! Background housekeeping
//!
//! Periodically prunes sync sessions that have been idle past the retention
//! window, their operation log rows and unused per-device locks.

use std::time::Duration;

use tokio::task::JoinHandle;

use super::engine::SyncEngine;

/// Run housekeeping now and then every `interval`
pub fn spawn(engine: SyncEngine, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            run_once(&engine).await;
        }
    })
}

/// One housekeeping pass; failures are logged and retried on the next tick
pub async fn run_once(engine: &SyncEngine) {
    match engine.housekeeping().await {
        Ok(report) if report.sessions > 0 || report.operations > 0 => {
            tracing::info!(
                "Housekeeping pruned {} sessions, {} operations, {} locks",
                report.sessions,
                report.operations,
                report.locks
            );
        }
        Ok(report) => {
            tracing::debug!("Housekeeping: nothing to prune ({} idle locks dropped)", report.locks);
        }
        Err(e) => {
            tracing::warn!("Housekeeping failed: {}", e);
        }
    }
}
