// ABOUTME: CycleScheduler - fires sync cycles once, on an interval, or on a cron schedule
// ABOUTME: A single worker owns the runner so cycles never overlap; stop() lets the in-flight cycle finish

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::cycle::{CycleRunner, CycleState};
use super::trigger::Trigger;
use crate::error::SchedulerError;

/// What happens to a trigger that fires while a cycle is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Drop the trigger.
    #[default]
    Skip,
    /// Keep one pending trigger; later ones coalesce into it.
    Queue,
}

/// Totals over the scheduler's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub cycles_run: u64,
    pub cycles_aborted: u64,
    pub cycles_failed: u64,
    pub rows_emitted: u64,
    /// Triggers skipped or coalesced because a cycle was active.
    pub triggers_dropped: u64,
}

/// Drives a `CycleRunner` according to a `Trigger`.
#[derive(Debug, Clone)]
pub struct CycleScheduler {
    trigger: Trigger,
    overlap: OverlapPolicy,
    max_consecutive_aborts: Option<u32>,
}

impl CycleScheduler {
    pub fn new(trigger: Trigger, overlap: OverlapPolicy) -> Self {
        Self {
            trigger,
            overlap,
            max_consecutive_aborts: None,
        }
    }

    /// Stop with `SchedulerError::TooManyAborts` after `max` aborted cycles in a row.
    pub fn with_max_consecutive_aborts(mut self, max: Option<u32>) -> Self {
        self.max_consecutive_aborts = max;
        self
    }

    /// Spawn the trigger and worker tasks.
    pub fn start<R: CycleRunner>(self, runner: R) -> SchedulerHandle {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(CycleState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            "Starting scheduler: trigger {}, overlap policy {:?}",
            self.trigger,
            self.overlap
        );

        let trigger = tokio::spawn(run_trigger(
            self.trigger,
            self.overlap,
            trigger_tx,
            state_rx.clone(),
            shutdown_rx.clone(),
        ));
        let worker = tokio::spawn(run_worker(
            runner,
            trigger_rx,
            state_tx,
            shutdown_rx,
            self.max_consecutive_aborts,
        ));

        SchedulerHandle {
            state: state_rx,
            shutdown: Arc::new(shutdown_tx),
            trigger,
            worker,
        }
    }
}

/// Requests a graceful stop from another task (e.g. a signal handler).
#[derive(Debug, Clone)]
pub struct StopSignal(Arc<watch::Sender<bool>>);

impl StopSignal {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Running scheduler.
pub struct SchedulerHandle {
    state: watch::Receiver<CycleState>,
    shutdown: Arc<watch::Sender<bool>>,
    trigger: JoinHandle<u64>,
    worker: JoinHandle<Result<SchedulerReport, SchedulerError>>,
}

impl SchedulerHandle {
    pub fn state(&self) -> CycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CycleState> {
        self.state.clone()
    }

    pub fn stop_signal(&self) -> StopSignal {
        StopSignal(Arc::clone(&self.shutdown))
    }

    /// Stop triggering, discard any queued trigger, and wait for the
    /// in-flight cycle to finish.
    pub async fn stop(self) -> Result<SchedulerReport, SchedulerError> {
        self.shutdown.send_replace(true);
        self.wait().await
    }

    /// Wait until the worker exits on its own (one-shot done, stop requested,
    /// or too many aborts).
    pub async fn wait(self) -> Result<SchedulerReport, SchedulerError> {
        let worker = self.worker.await;
        self.shutdown.send_replace(true);
        let dropped = self
            .trigger
            .await
            .map_err(|e| SchedulerError::Join(e.to_string()))?;

        let mut report = worker.map_err(|e| SchedulerError::Join(e.to_string()))??;
        report.triggers_dropped = dropped;
        tracing::info!(
            "Scheduler stopped: {} cycles ({} aborted, {} failed), {} rows emitted, \
             {} triggers dropped",
            report.cycles_run,
            report.cycles_aborted,
            report.cycles_failed,
            report.rows_emitted,
            report.triggers_dropped
        );
        Ok(report)
    }
}

async fn run_trigger(
    trigger: Trigger,
    overlap: OverlapPolicy,
    tx: mpsc::Sender<()>,
    state: watch::Receiver<CycleState>,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut dropped = 0;

    match trigger {
        Trigger::Once => {
            let _ = tx.send(()).await;
        }
        Trigger::Interval(period) => {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if !offer(&tx, overlap, &state, &mut dropped) {
                            break;
                        }
                    }
                }
            }
        }
        Trigger::Cron(schedule) => {
            // Never before the last fire time, so an early timer wake cannot fire twice.
            let mut last_fire = Utc::now();
            loop {
                let Some(next) = schedule.next_after(last_fire.max(Utc::now())) else {
                    tracing::warn!("Cron schedule {} has no further fire times", schedule);
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tracing::debug!("Next cycle at {} (in {:?})", next, wait);

                tokio::select! {
                    biased;

                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(wait) => {
                        last_fire = next;
                        if !offer(&tx, overlap, &state, &mut dropped) {
                            break;
                        }
                    }
                }
            }
        }
    }

    dropped
}

/// Hand one trigger to the worker. Returns false once the worker is gone.
fn offer(
    tx: &mpsc::Sender<()>,
    overlap: OverlapPolicy,
    state: &watch::Receiver<CycleState>,
    dropped: &mut u64,
) -> bool {
    if overlap == OverlapPolicy::Skip && *state.borrow() != CycleState::Idle {
        *dropped += 1;
        tracing::debug!("Cycle still running, skipping trigger");
        return true;
    }

    match tx.try_send(()) {
        Ok(()) => true,
        Err(TrySendError::Full(())) => {
            *dropped += 1;
            tracing::debug!("A trigger is already pending, coalescing");
            true
        }
        Err(TrySendError::Closed(())) => false,
    }
}

async fn run_worker<R: CycleRunner>(
    mut runner: R,
    mut triggers: mpsc::Receiver<()>,
    state: watch::Sender<CycleState>,
    mut shutdown: watch::Receiver<bool>,
    max_consecutive_aborts: Option<u32>,
) -> Result<SchedulerReport, SchedulerError> {
    let mut report = SchedulerReport::default();
    let mut consecutive_aborts: u32 = 0;

    loop {
        let triggered = tokio::select! {
            biased; // Check shutdown first so a queued trigger is discarded

            _ = shutdown.changed() => None,
            t = triggers.recv() => t,
        };
        if triggered.is_none() {
            break;
        }

        // Published before the runner starts so the trigger task sees a busy worker.
        state.send_replace(CycleState::Resolving);
        report.cycles_run += 1;
        let cycle = report.cycles_run;

        let outcome = runner.run_cycle(cycle, &state).await;
        state.send_replace(CycleState::Idle);
        report.rows_emitted += outcome.rows_emitted;

        match (&outcome.error, outcome.abort_reason()) {
            (None, _) => {
                consecutive_aborts = 0;
                tracing::info!(
                    "Cycle {} complete: watermark {}, {} rows emitted in {}ms",
                    cycle,
                    outcome
                        .watermark
                        .map_or_else(|| "-".to_string(), |w| w.to_string()),
                    outcome.rows_emitted,
                    outcome.duration_ms
                );
            }
            (Some(_), Some(reason)) => {
                report.cycles_aborted += 1;
                consecutive_aborts += 1;
                tracing::warn!(
                    "Cycle {} aborted ({} consecutive): {}",
                    cycle,
                    consecutive_aborts,
                    reason
                );
                if let Some(max) = max_consecutive_aborts {
                    if consecutive_aborts >= max {
                        tracing::error!(
                            "Giving up after {} consecutive aborted cycles",
                            consecutive_aborts
                        );
                        return Err(SchedulerError::TooManyAborts(
                            consecutive_aborts,
                            reason.clone(),
                        ));
                    }
                }
            }
            (Some(e), None) => {
                consecutive_aborts = 0;
                report.cycles_failed += 1;
                tracing::error!(
                    "Cycle {} failed after {} rows: {}",
                    cycle,
                    outcome.rows_emitted,
                    e
                );
            }
        }
    }

    Ok(report)
}
