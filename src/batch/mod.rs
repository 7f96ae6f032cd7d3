//! # Work Batching Module
//!
//! Groups individually submitted units of work into batches and runs them with
//! bounded concurrency, tracking every unit and batch by id.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchAccumulator`] | Queues units, seals batches by size or timeout, dispatches them |
//! | [`BatchConfig`] | Batch size, timer interval, concurrency and memory budget |
//! | [`StatusRegistry`] | Lifecycle records queryable by unit id or batch id |
//! | [`Worker`] | The processing function applied to each unit |
//!
//! ## Example
//!
//! ```rust,no_run
//! use admission_core::batch::{worker_fn, BatchAccumulator, BatchConfig, WorkPayload};
//! use std::sync::Arc;
//!
//! # async fn run() -> admission_core::Result<()> {
//! let worker = Arc::new(worker_fn(|p: WorkPayload| async move {
//!     Ok::<_, admission_core::Error>(serde_json::json!({ "bytes": p.data.len() }))
//! }));
//! let acc = BatchAccumulator::new(BatchConfig::new().with_max_batch_size(6), worker);
//! acc.start()?;
//!
//! let id = acc.submit(WorkPayload::new(vec![0u8; 16]));
//! println!("{:?}", acc.unit_status(&id));
//!
//! acc.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle
//!
//! - **Units**: pending, assigned, processing, then completed or failed
//! - **Batches**: sealed, processing, then completed (or failed if the batch loop itself breaks)

mod accumulator;
mod executor;
mod queue;
mod registry;
mod types;

pub use accumulator::{AccumulatorStats, BatchAccumulator};
pub use executor::{execute, BatchReport, SealedBatch};
pub use queue::BatchConfig;
pub use registry::{BatchStatus, StatusRegistry, UnitStatus, UnitSummary};
pub use types::{worker_fn, BatchState, FnWorker, UnitState, WorkPayload, WorkUnit, Worker};
