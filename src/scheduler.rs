// ===============================
// src/scheduler.rs
// ===============================
//
// Fixed-interval tick driver. Each firing spawns one `run_tick` with the
// latest snapshot; the pipeline's in-flight guard decides whether it does
// anything. Missed firings are skipped. On shutdown the timer stops and
// in-flight ticks get `grace` to finish before they are aborted.
//
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::MarketSnapshot;
use crate::pipeline::ExecutionPipeline;

pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop firing; does not wait.
    pub fn cancel(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Stop firing and wait for the drain to finish.
    pub async fn shutdown(self) {
        self.cancel();
        if let Err(e) = self.task.await {
            warn!(?e, "scheduler task ended abnormally");
        }
    }
}

pub fn spawn(
    pipeline: Arc<ExecutionPipeline>,
    snapshots: watch::Receiver<MarketSnapshot>,
    every: Duration,
    grace: Duration,
) -> SchedulerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(pipeline, snapshots, every, grace, stop_rx));
    SchedulerHandle { stop_tx, task }
}

async fn run(
    pipeline: Arc<ExecutionPipeline>,
    snapshots: watch::Receiver<MarketSnapshot>,
    every: Duration,
    grace: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    // first firing one full interval after start
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: JoinSet<()> = JoinSet::new();
    info!(every_secs = every.as_secs_f64(), mode = pipeline.gateway_mode(), "scheduler started");

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let snap = snapshots.borrow().clone();
                let p = pipeline.clone();
                in_flight.spawn(async move {
                    let outcome = p.run_tick(&snap).await;
                    debug!(outcome = outcome.label(), "tick done");
                });
            }
            Some(res) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = res {
                    warn!(?e, "tick task panicked");
                }
            }
        }
    }

    let pending = in_flight.len();
    info!(pending, "scheduler stopping");
    let drained = timeout(grace, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = grace.as_secs_f64(), "in-flight tick did not finish within grace, aborting");
        in_flight.abort_all();
    }
    info!("scheduler stopped");
}
