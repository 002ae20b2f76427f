//! Background maintenance tasks: the periodic sweep and WAL compaction.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::{Engine, now_ms};
use crate::model::Ms;
use crate::observability;
use crate::scheduler::Notifier;

/// One sweep pass: complete finished sessions, repair missing reminders,
/// deliver due notices. Split out from the loop so tests can drive it with
/// an explicit clock.
pub async fn sweep_once(engine: &Engine, notifier: &dyn Notifier, now: Ms) {
    match engine.complete_finished(now).await {
        Ok(done) if !done.is_empty() => {
            debug!(count = done.len(), "completed finished sessions");
        }
        Ok(_) => {}
        Err(err) => warn!(%err, "completion pass failed"),
    }
    if let Err(err) = engine.reconcile_reminders(now).await {
        warn!(%err, "reminder reconcile failed");
    }
    match engine.dispatch_due(now, notifier).await {
        Ok(sent) if sent > 0 => debug!(sent, "delivered due notices"),
        Ok(_) => {}
        Err(err) => warn!(%err, "notice dispatch failed"),
    }
}

/// Periodic sweep task. Runs until the engine is dropped and the channel
/// to the WAL writer closes with it; callers usually `tokio::spawn` this.
pub async fn run_sweeper(engine: Arc<Engine>, notifier: Arc<dyn Notifier>) {
    let mut tick = tokio::time::interval(engine.config.sweep_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let start = std::time::Instant::now();
        sweep_once(&engine, notifier.as_ref(), now_ms()).await;
        metrics::histogram!(observability::SWEEP_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
    }
}

/// Periodic WAL compaction: once enough events have accumulated since the
/// last compaction, rewrite the log down to a snapshot of live state.
pub async fn run_compactor(engine: Arc<Engine>) {
    let mut tick = tokio::time::interval(engine.config.sweep_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let appended = engine.wal_appends_since_compact().await;
        if appended < engine.config.compact_threshold {
            continue;
        }
        debug!(appended, "compacting WAL");
        if let Err(err) = engine.compact_wal().await {
            warn!(%err, "WAL compaction failed");
        }
    }
}
