//! Batch accumulator: collects submitted units and dispatches sealed batches.
//!
//! A batch is sealed when the pending queue reaches `max_batch_size` (inside
//! `submit`) or when the periodic timer finds leftover units and a free
//! concurrency slot. Sealed batches run as independent tasks, at most
//! `max_concurrent_batches` at a time. `shutdown` stops the timer, drains what is
//! still pending in the calling task and joins every dispatched batch.

use super::executor::{self, BatchReport, SealedBatch};
use super::queue::{BatchConfig, PendingQueue};
use super::registry::{BatchStatus, StatusRegistry, UnitStatus};
use super::types::{WorkPayload, WorkUnit, Worker};
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
pub struct AccumulatorStats {
    pub pending_units: usize,
    pub pending_bytes: u64,
    /// Batches sealed and not yet finished.
    pub processing_batches: usize,
    pub sealed_batches: u64,
    pub memory_limit_bytes: u64,
    pub running: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: PendingQueue,
    in_flight: usize,
    sealed_total: u64,
    dispatched: Vec<JoinHandle<BatchReport>>,
    over_budget: bool,
}

struct Inner {
    config: BatchConfig,
    worker: Arc<dyn Worker>,
    registry: Arc<StatusRegistry>,
    state: Mutex<QueueState>,
    permits: Arc<Semaphore>,
    running: AtomicBool,
    runtime: OnceLock<Handle>,
}

struct TimerTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Decrements the in-flight count when a dispatched batch ends, however it ends.
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut st = self.0.lock_state();
        st.in_flight = st.in_flight.saturating_sub(1);
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_handle(&self) -> Option<Handle> {
        self.runtime
            .get()
            .cloned()
            .or_else(|| Handle::try_current().ok())
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size.max(1)
    }

    /// Slice the oldest pending units into a new sealed batch. Caller holds the state lock.
    fn seal_locked(&self, st: &mut QueueState, trigger: &'static str) -> SealedBatch {
        let batch = SealedBatch::new(st.pending.take_front(self.max_batch_size()));
        self.registry.seal(&batch.id, &batch.units);
        st.in_flight += 1;
        st.sealed_total += 1;
        if st.over_budget && st.pending.bytes() <= self.config.memory_limit_bytes() {
            st.over_budget = false;
        }
        tracing::info!(
            batch_id = %batch.id,
            size = batch.len(),
            trigger,
            remaining = st.pending.len(),
            "batch sealed"
        );
        batch
    }

    fn dispatch(self: &Arc<Self>, handle: &Handle, st: &mut QueueState, batch: SealedBatch) {
        st.dispatched.retain(|h| !h.is_finished());
        let inner = Arc::clone(self);
        st.dispatched.push(handle.spawn(Inner::run_batch(inner, batch)));
    }

    async fn run_batch(self: Arc<Self>, batch: SealedBatch) -> BatchReport {
        let _in_flight = InFlight(Arc::clone(&self));
        // The semaphore is never closed, so acquire only fails if that changes.
        let _permit = Arc::clone(&self.permits).acquire_owned().await.ok();
        executor::execute(batch, self.worker.as_ref(), &self.registry).await
    }

    fn check_budget(&self, st: &mut QueueState) {
        let limit = self.config.memory_limit_bytes();
        let bytes = st.pending.bytes();
        if bytes > limit && !st.over_budget {
            st.over_budget = true;
            tracing::warn!(
                pending_bytes = bytes,
                memory_limit_bytes = limit,
                "pending payloads exceed memory budget; continuing to accept"
            );
        } else if bytes <= limit {
            st.over_budget = false;
        }
    }

    fn on_timeout(self: &Arc<Self>) {
        let Some(handle) = self.spawn_handle() else {
            return;
        };
        let mut st = self.lock_state();
        if st.pending.is_empty() || st.in_flight >= self.config.max_concurrent_batches {
            return;
        }
        let batch = self.seal_locked(&mut st, "timeout");
        self.dispatch(&handle, &mut st, batch);
    }

    async fn run_timer(self: Arc<Self>, token: CancellationToken) {
        let period = self.config.batch_timeout();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            self.on_timeout();
            if let Some(retention) = self.config.retention() {
                let evicted = self.registry.cleanup(retention);
                if evicted > 0 {
                    tracing::debug!(evicted, "expired batches removed from registry");
                }
            }
        }
        tracing::debug!("batch timer stopped");
    }
}

pub struct BatchAccumulator {
    inner: Arc<Inner>,
    timer: Mutex<Option<TimerTask>>,
}

impl BatchAccumulator {
    pub fn new(config: BatchConfig, worker: Arc<dyn Worker>) -> Self {
        Self::with_registry(config, worker, Arc::new(StatusRegistry::new()))
    }

    pub fn with_registry(
        config: BatchConfig,
        worker: Arc<dyn Worker>,
        registry: Arc<StatusRegistry>,
    ) -> Self {
        let slots = config.max_concurrent_batches.clamp(1, Semaphore::MAX_PERMITS);
        let permits = Arc::new(Semaphore::new(slots));
        Self {
            inner: Arc::new(Inner {
                config,
                worker,
                registry,
                state: Mutex::new(QueueState::default()),
                permits,
                running: AtomicBool::new(false),
                runtime: OnceLock::new(),
            }),
            timer: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.inner.registry
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the timeout task on the current Tokio runtime. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let handle = Handle::try_current().map_err(|e| {
            Error::runtime_with_context(
                format!("batch accumulator needs a Tokio runtime: {e}"),
                ErrorContext::new().with_source("batch_accumulator"),
            )
        })?;

        if self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("batch accumulator already running");
            return Ok(());
        }
        let _ = self.inner.runtime.set(handle.clone());

        let token = CancellationToken::new();
        let task = handle.spawn(Inner::run_timer(Arc::clone(&self.inner), token.clone()));
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(TimerTask {
            token,
            handle: task,
        });

        tracing::info!(
            max_batch_size = self.inner.config.max_batch_size,
            batch_timeout_secs = self.inner.config.batch_timeout_secs,
            max_concurrent_batches = self.inner.config.max_concurrent_batches,
            "batch accumulator started"
        );
        Ok(())
    }

    /// Queue one unit and return its id. Never blocks on batch execution.
    pub fn submit(&self, payload: WorkPayload) -> String {
        let unit = WorkUnit::new(payload);
        let unit_id = unit.id.clone();
        let handle = self.inner.spawn_handle();
        let max = self.inner.max_batch_size();

        let mut st = self.inner.lock_state();
        self.inner.registry.insert_pending(&unit);
        let pending = st.pending.push(unit);
        tracing::debug!(unit_id = %unit_id, pending, max_batch_size = max, "unit queued");
        self.inner.check_budget(&mut st);

        if pending >= max {
            match handle {
                Some(handle) => {
                    let batch = self.inner.seal_locked(&mut st, "size");
                    self.inner.dispatch(&handle, &mut st, batch);
                }
                None => tracing::debug!(pending, "no runtime to dispatch on; leaving units queued"),
            }
        }
        unit_id
    }

    pub fn unit_status(&self, unit_id: &str) -> Option<UnitStatus> {
        self.inner.registry.unit(unit_id)
    }

    pub fn batch_status(&self, batch_id: &str) -> Option<BatchStatus> {
        self.inner.registry.batch(batch_id)
    }

    pub fn stats(&self) -> AccumulatorStats {
        let st = self.inner.lock_state();
        AccumulatorStats {
            pending_units: st.pending.len(),
            pending_bytes: st.pending.bytes(),
            processing_batches: st.in_flight,
            sealed_batches: st.sealed_total,
            memory_limit_bytes: self.inner.config.memory_limit_bytes(),
            running: self.is_running(),
        }
    }

    /// Stop the timer, process every still-pending unit, then wait for dispatched batches.
    pub async fn shutdown(&self) -> Vec<BatchReport> {
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.token.cancel();
            if let Err(e) = timer.handle.await {
                tracing::warn!(error = %e, "batch timer ended abnormally");
            }
        }

        let mut reports = Vec::new();
        loop {
            let batch = {
                let mut st = self.inner.lock_state();
                if st.pending.is_empty() {
                    break;
                }
                self.inner.seal_locked(&mut st, "shutdown")
            };
            reports.push(Inner::run_batch(Arc::clone(&self.inner), batch).await);
        }

        let dispatched = std::mem::take(&mut self.inner.lock_state().dispatched);
        for handle in dispatched {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(error = %e, "dispatched batch task failed"),
            }
        }

        if was_running {
            tracing::info!(batches = reports.len(), "batch accumulator stopped");
        }
        reports
    }
}

impl Drop for BatchAccumulator {
    fn drop(&mut self) {
        if let Some(timer) = self
            .timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.token.cancel();
        }
    }
}

impl std::fmt::Debug for BatchAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchAccumulator")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}
