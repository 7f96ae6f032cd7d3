//! Token-paced calls with bounded exponential-backoff retry.

use super::token_bucket::TokenBucket;
use reqwest::StatusCode;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How a single attempt's outcome should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// The resource does not exist. Never retried.
    NotFound,
    /// Rate limited or server-side outage. Retried with backoff.
    Transient,
    /// Authorization-class or otherwise unexpected rejection. Never retried.
    Permanent,
}

/// Maps the value produced by an attempt onto a [`Disposition`].
pub trait Classify {
    fn disposition(&self) -> Disposition;

    /// Short label used in retry logs.
    fn label(&self) -> String {
        format!("{:?}", self.disposition())
    }
}

impl Classify for StatusCode {
    fn disposition(&self) -> Disposition {
        match self.as_u16() {
            200 => Disposition::Success,
            404 => Disposition::NotFound,
            429 | 500 | 502 | 503 => Disposition::Transient,
            _ => Disposition::Permanent,
        }
    }

    fn label(&self) -> String {
        format!("HTTP {}", self.as_u16())
    }
}

impl Classify for reqwest::Response {
    fn disposition(&self) -> Disposition {
        self.status().disposition()
    }

    fn label(&self) -> String {
        self.status().label()
    }
}

/// Final result of [`BackoffClient::execute`].
#[derive(Debug)]
pub enum CallOutcome<T> {
    Success(T),
    NotFound,
    /// Returned immediately with the rejecting value.
    PermanentFailure(T),
    RetriesExhausted {
        attempts: u32,
        last_error: Option<String>,
    },
}

impl<T> CallOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success(_))
    }

    pub fn into_success(self) -> Option<T> {
        match self {
            CallOutcome::Success(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff sleep. `None` keeps doubling without limit.
    pub max_backoff: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: None,
        }
    }
}

impl BackoffConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_initial_backoff(mut self, d: Duration) -> Self {
        self.initial_backoff = d;
        self
    }

    pub fn with_max_backoff(mut self, d: Duration) -> Self {
        self.max_backoff = Some(d);
        self
    }
}

/// Wraps outbound calls with token-bucket pacing and retry.
///
/// Every attempt, retries included, first takes one token from the shared bucket.
/// Waiting for tokens does not count against the retry budget.
#[derive(Clone)]
pub struct BackoffClient {
    bucket: Arc<TokenBucket>,
    config: BackoffConfig,
}

impl BackoffClient {
    pub fn new(bucket: Arc<TokenBucket>, config: BackoffConfig) -> Self {
        Self { bucket, config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    /// Sleep before retry number `retry` (0-based): `initial * 2^retry`, optionally capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let delay = self.config.initial_backoff.saturating_mul(factor);
        match self.config.max_backoff {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Run `action` until it yields a non-transient outcome or the retry budget is spent.
    ///
    /// An `Err` from `action` is a connection-level failure and is treated as transient.
    /// At most `max_retries + 1` attempts are made.
    pub async fn execute<T, E, F, Fut>(&self, mut action: F) -> CallOutcome<T>
    where
        T: Classify,
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut retries = 0u32;
        loop {
            self.bucket.acquire().await;

            let reason = match action().await {
                Ok(value) => match value.disposition() {
                    Disposition::Success => return CallOutcome::Success(value),
                    Disposition::NotFound => {
                        debug!(outcome = %value.label(), "resource not found, not retrying");
                        return CallOutcome::NotFound;
                    }
                    Disposition::Permanent => {
                        debug!(outcome = %value.label(), "permanent rejection, not retrying");
                        return CallOutcome::PermanentFailure(value);
                    }
                    Disposition::Transient => value.label(),
                },
                Err(e) => format!("connection error: {}", e),
            };

            if retries >= self.config.max_retries {
                warn!(
                    attempts = retries + 1,
                    last_error = %reason,
                    "giving up after exhausting retries"
                );
                return CallOutcome::RetriesExhausted {
                    attempts: retries + 1,
                    last_error: Some(reason),
                };
            }

            let delay = self.delay_for(retries);
            warn!(
                attempt = retries + 1,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }
}
