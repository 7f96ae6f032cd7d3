//! # Resilience Primitives Module
//!
//! Pacing and admission control for traffic in both directions.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`token_bucket`] | Replenishing quota that reports how long to wait before acting |
//! | [`backoff`] | Paced outbound calls with exponential-backoff retry |
//! | [`sliding_window`] | Per-identity inbound limits over a short and a long rolling window |
//!
//! ## Token Bucket
//!
//! ```rust
//! use admission_core::resilience::token_bucket::{Consume, TokenBucket, TokenBucketConfig};
//!
//! let bucket = TokenBucket::new(TokenBucketConfig::from_rps(5.0).unwrap());
//! match bucket.consume(1.0) {
//!     Consume::Ready => { /* proceed */ }
//!     Consume::WaitFor(d) => println!("retry in {:?}", d),
//! }
//! ```
//!
//! ## Sliding Window
//!
//! ```rust
//! use admission_core::resilience::sliding_window::{SlidingWindowConfig, SlidingWindowLimiter};
//!
//! let limiter = SlidingWindowLimiter::new(SlidingWindowConfig::new().with_requests_per_minute(2));
//! assert!(limiter.is_allowed("10.0.0.1").allowed);
//! assert!(limiter.is_allowed("10.0.0.1").allowed);
//! assert!(!limiter.is_allowed("10.0.0.1").allowed);
//! ```

pub mod backoff;
pub mod sliding_window;
pub mod token_bucket;
