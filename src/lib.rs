//! # admission-core
//!
//! Admission control and batching for a service that fans work out to a slow
//! downstream and takes requests from many clients.
//!
//! ## Overview
//!
//! - **Outbound pacing**: a token bucket gates every call and a backoff client
//!   retries transient failures with exponential delays
//! - **Inbound limits**: per-client sliding windows over a minute and an hour,
//!   with standard rate-limit headers
//! - **Batching**: submitted units are grouped by size or timeout and run with
//!   bounded concurrency, every unit and batch trackable by id
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use admission_core::batch::{worker_fn, BatchAccumulator, WorkPayload};
//! use admission_core::AdmissionConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> admission_core::Result<()> {
//!     let config = AdmissionConfig::from_file("admission.yaml")?.with_env_overrides()?;
//!     let worker = Arc::new(worker_fn(|p: WorkPayload| async move {
//!         Ok::<_, admission_core::Error>(serde_json::json!({ "bytes": p.data.len() }))
//!     }));
//!
//!     let acc = BatchAccumulator::new(config.batch.clone(), worker);
//!     acc.start()?;
//!     let id = acc.submit(WorkPayload::new("page-001"));
//!     acc.shutdown().await;
//!     println!("{:?}", acc.unit_status(&id));
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Token bucket, backoff client, sliding-window limiter |
//! | [`transport`] | Paced HTTP fetcher built on the backoff client |
//! | [`batch`] | Accumulator, executor and status registry |
//! | [`api`] | Submission and status routes with the inbound gate |
//! | [`config`] | YAML and environment configuration |

pub mod api;
pub mod batch;
pub mod config;
pub mod resilience;
pub mod transport;

pub use api::{ApiRequest, ApiResponse, BatchApi, InboundGate};
pub use batch::{BatchAccumulator, BatchConfig, StatusRegistry, WorkPayload, Worker};
pub use config::{AdmissionConfig, InboundConfig, OutboundConfig};
pub use resilience::backoff::{BackoffClient, CallOutcome};
pub use resilience::sliding_window::SlidingWindowLimiter;
pub use resilience::token_bucket::{Consume, TokenBucket};
pub use transport::HttpFetcher;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
