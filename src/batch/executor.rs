//! Batch executor.

use super::registry::StatusRegistry;
use super::types::{BatchState, WorkUnit, Worker};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Units removed from the pending queue under one batch id.
#[derive(Debug)]
pub struct SealedBatch {
    pub id: String,
    pub units: Vec<WorkUnit>,
}

impl SealedBatch {
    pub fn new(units: Vec<WorkUnit>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            units,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: String,
    pub state: BatchState,
    pub completed: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }

    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.completed as f64 / self.total() as f64
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Run every unit of `batch` in order, recording each transition in `registry`.
///
/// A unit that errors or panics is marked failed and the rest still run. The
/// batch itself only ends `Failed` when something outside a unit call breaks.
pub async fn execute(batch: SealedBatch, worker: &dyn Worker, registry: &StatusRegistry) -> BatchReport {
    let start = Instant::now();
    let batch_id = batch.id.clone();
    registry.start_batch(&batch_id);
    tracing::info!(batch_id = %batch_id, units = batch.len(), "batch processing started");

    let mut completed = 0usize;
    let mut failed = 0usize;

    let run = AssertUnwindSafe(async {
        for unit in &batch.units {
            registry.start_unit(&unit.id);
            let call = AssertUnwindSafe(worker.process(&unit.id, &unit.payload)).catch_unwind();
            match call.await {
                Ok(Ok(value)) => {
                    registry.complete_unit(&batch_id, &unit.id, value);
                    completed += 1;
                }
                Ok(Err(e)) => {
                    tracing::warn!(batch_id = %batch_id, unit_id = %unit.id, error = %e, "unit failed");
                    registry.fail_unit(&batch_id, &unit.id, e.to_string());
                    failed += 1;
                }
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    tracing::warn!(batch_id = %batch_id, unit_id = %unit.id, error = %msg, "unit panicked");
                    registry.fail_unit(&batch_id, &unit.id, msg);
                    failed += 1;
                }
            }
        }
    })
    .catch_unwind()
    .await;

    let state = match run {
        Ok(()) => BatchState::Completed,
        Err(panic) => {
            tracing::error!(batch_id = %batch_id, error = %panic_message(panic.as_ref()), "batch aborted");
            BatchState::Failed
        }
    };
    registry.finish_batch(&batch_id, state);

    let elapsed = start.elapsed();
    tracing::info!(
        batch_id = %batch_id,
        completed,
        failed,
        elapsed_ms = elapsed.as_millis() as u64,
        "batch processing finished"
    );

    BatchReport {
        batch_id,
        state,
        completed,
        failed,
        elapsed,
    }
}
