// ABOUTME: SyncCycle - one pass of resolve watermark, bind statement, stream rows, emit events
// ABOUTME: Publishes its phase on a watch channel and reports a CycleOutcome instead of failing

use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;

use crate::destination::request::watermark_from_json;
use crate::emit::{EventEmitter, EventSink};
use crate::error::{AbortReason, CycleError};
use crate::source::{BoundQuery, QueryBinder, RowSource};
use crate::watermark::{ResolvedWatermark, WatermarkResolver, WatermarkStore};

/// Where a cycle currently is. `Idle` between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleState {
    #[default]
    Idle,
    Resolving,
    Querying,
    Emitting,
}

/// Result of one cycle. Never persisted; used for logs, stats and tests.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub cycle: u64,
    /// Whether the source statement was issued.
    pub attempted: bool,
    /// Watermark bound into the statement, if the cycle got that far.
    pub watermark: Option<i64>,
    pub rows_emitted: u64,
    /// Highest watermark column value among emitted rows, when the rows carry it.
    pub max_emitted_watermark: Option<i64>,
    pub aborted: bool,
    pub error: Option<CycleError>,
    pub duration_ms: u64,
}

impl CycleOutcome {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            ..Self::default()
        }
    }

    /// Check if the cycle completed without errors.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match &self.error {
            Some(CycleError::Aborted(reason)) => Some(reason),
            _ => None,
        }
    }
}

/// Something the scheduler can run once per trigger.
///
/// The scheduler owns the runner exclusively, which is what keeps cycles
/// from overlapping.
#[async_trait]
pub trait CycleRunner: Send + 'static {
    async fn run_cycle(&mut self, cycle: u64, state: &watch::Sender<CycleState>) -> CycleOutcome;
}

/// Resolve → bind → stream → emit, against concrete collaborators.
pub struct SyncCycle<S, R, K> {
    resolver: WatermarkResolver<S>,
    binder: QueryBinder,
    source: R,
    emitter: EventEmitter<K>,
}

impl<S, R, K> SyncCycle<S, R, K>
where
    S: WatermarkStore,
    R: RowSource,
    K: EventSink,
{
    pub fn new(
        resolver: WatermarkResolver<S>,
        binder: QueryBinder,
        source: R,
        emitter: EventEmitter<K>,
    ) -> Self {
        Self {
            resolver,
            binder,
            source,
            emitter,
        }
    }

    pub fn resolver(&self) -> &WatermarkResolver<S> {
        &self.resolver
    }

    pub fn source(&self) -> &R {
        &self.source
    }

    pub fn emitter(&self) -> &EventEmitter<K> {
        &self.emitter
    }

    /// Run one cycle. Failures are recorded in the outcome, never returned.
    pub async fn run(&mut self, cycle: u64, state: &watch::Sender<CycleState>) -> CycleOutcome {
        let start = Instant::now();
        let mut outcome = CycleOutcome::new(cycle);

        state.send_replace(CycleState::Resolving);
        let resolved = self.resolver.resolve().await;

        match &resolved {
            ResolvedWatermark::Abort(reason) => {
                tracing::warn!(
                    "Cycle {} aborted during {}: {}. No source query issued",
                    cycle,
                    reason.phase(),
                    reason
                );
                outcome.aborted = true;
                outcome.error = Some(CycleError::Aborted(reason.clone()));
            }
            ResolvedWatermark::Fresh => {
                tracing::info!("Cycle {}: no prior data in destination, starting fresh", cycle);
            }
            ResolvedWatermark::Value(v) => {
                tracing::info!("Cycle {}: resuming after watermark {}", cycle, v);
            }
        }

        if !outcome.aborted {
            match self.binder.bind(&resolved) {
                Ok(query) => {
                    outcome.watermark = Some(query.watermark());
                    state.send_replace(CycleState::Querying);
                    outcome.attempted = true;
                    if let Err(e) = self.stream_rows(&query, state, &mut outcome).await {
                        tracing::error!(
                            "Cycle {} failed after emitting {} rows: {:#}",
                            cycle,
                            outcome.rows_emitted,
                            e
                        );
                        outcome.error = Some(e);
                    }
                }
                Err(e) => outcome.error = Some(e.into()),
            }
        }

        state.send_replace(CycleState::Idle);
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        outcome
    }

    async fn stream_rows(
        &mut self,
        query: &BoundQuery,
        state: &watch::Sender<CycleState>,
        outcome: &mut CycleOutcome,
    ) -> Result<(), CycleError> {
        let watermark_column = self.resolver.spec().field.as_str().to_lowercase();
        let mut rows = self.source.execute(query).await?;
        state.send_replace(CycleState::Emitting);

        while let Some(row) = rows.next().await {
            let row = row?;
            if let Some(value) = row
                .get(&watermark_column)
                .and_then(|v| watermark_from_json(v).ok())
            {
                outcome.max_emitted_watermark = Some(
                    outcome
                        .max_emitted_watermark
                        .map_or(value, |current| current.max(value)),
                );
            }

            self.emitter.emit(row).await?;
            outcome.rows_emitted += 1;

            if outcome.rows_emitted % 100_000 == 0 {
                tracing::info!(
                    "Progress: cycle {} - {} rows emitted",
                    outcome.cycle,
                    outcome.rows_emitted
                );
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<S, R, K> CycleRunner for SyncCycle<S, R, K>
where
    S: WatermarkStore + 'static,
    R: RowSource + 'static,
    K: EventSink + 'static,
{
    async fn run_cycle(&mut self, cycle: u64, state: &watch::Sender<CycleState>) -> CycleOutcome {
        self.run(cycle, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_outcome_success() {
        let outcome = CycleOutcome {
            cycle: 1,
            attempted: true,
            watermark: Some(10),
            rows_emitted: 5,
            ..CycleOutcome::default()
        };
        assert!(outcome.is_success());
        assert!(outcome.abort_reason().is_none());
    }

    #[test]
    fn test_cycle_outcome_aborted() {
        let outcome = CycleOutcome {
            cycle: 2,
            aborted: true,
            error: Some(CycleError::Aborted(AbortReason::DestinationDegraded(
                "red".to_string(),
            ))),
            ..CycleOutcome::default()
        };
        assert!(!outcome.is_success());
        assert_eq!(
            outcome.abort_reason(),
            Some(&AbortReason::DestinationDegraded("red".to_string()))
        );
    }
}
