use crate::config::saturating_secs;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Result of a single [`TokenBucket::consume`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Consume {
    /// Tokens were taken; the caller may proceed.
    Ready,
    /// Not enough tokens. Nothing was taken; retry after the duration.
    WaitFor(Duration),
}

impl Consume {
    pub fn is_ready(&self) -> bool {
        matches!(self, Consume::Ready)
    }
}

#[derive(Debug, Clone)]
pub struct TokenBucketSnapshot {
    pub rate_per_second: f64,
    pub capacity: f64,
    pub tokens: f64,
    /// Estimated wait until one token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    /// Tokens added per second.
    pub rate_per_second: f64,
    /// Maximum tokens held (burst size).
    pub capacity: f64,
}

impl TokenBucketConfig {
    /// Config for `rps` with the default burst of two seconds' worth of tokens.
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return None;
        }
        Some(Self {
            rate_per_second: rps,
            capacity: (rps * 2.0).max(1.0),
        })
    }

    pub fn new() -> Self {
        Self {
            rate_per_second: 5.0,
            capacity: 10.0,
        }
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate_per_second = rate;
        self
    }
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct State {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket pacing outbound calls.
///
/// `consume` never blocks; it either takes the tokens or reports how long the
/// caller should wait. Every read-modify-write runs under one mutex.
/// Requests for more than `capacity` tokens can never be satisfied.
/// A rate that is not a positive finite number disables pacing.
pub struct TokenBucket {
    cfg: TokenBucketConfig,
    state: Mutex<State>,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(cfg: TokenBucketConfig) -> Self {
        let state = Mutex::new(State {
            tokens: cfg.capacity,
            last_refill: Instant::now(),
        });
        Self { cfg, state }
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.cfg
    }

    pub fn is_pacing(&self) -> bool {
        self.cfg.rate_per_second.is_finite() && self.cfg.rate_per_second > 0.0
    }

    fn wait_for(&self, missing: f64) -> Duration {
        saturating_secs(missing / self.cfg.rate_per_second)
    }

    fn refill_locked(cfg: &TokenBucketConfig, st: &mut State, now: Instant) {
        let elapsed = now.saturating_duration_since(st.last_refill).as_secs_f64();
        st.tokens = (st.tokens + elapsed * cfg.rate_per_second).min(cfg.capacity);
        st.last_refill = now;
    }

    pub fn consume(&self, n: f64) -> Consume {
        if !self.is_pacing() {
            return Consume::Ready;
        }
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Self::refill_locked(&self.cfg, &mut st, Instant::now());

        if st.tokens >= n {
            st.tokens -= n;
            Consume::Ready
        } else {
            let missing = n - st.tokens;
            Consume::WaitFor(self.wait_for(missing))
        }
    }

    /// Take one token, sleeping as long as the bucket asks.
    pub async fn acquire(&self) {
        loop {
            match self.consume(1.0) {
                Consume::Ready => return,
                Consume::WaitFor(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    pub fn snapshot(&self) -> TokenBucketSnapshot {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_pacing() {
            Self::refill_locked(&self.cfg, &mut st, Instant::now());
        }

        let estimated_wait_ms = if self.is_pacing() && st.tokens < 1.0 {
            let wait = self.wait_for(1.0 - st.tokens);
            Some(u64::try_from(wait.as_millis()).unwrap_or(u64::MAX))
        } else {
            None
        };

        TokenBucketSnapshot {
            rate_per_second: self.cfg.rate_per_second,
            capacity: self.cfg.capacity,
            tokens: st.tokens,
            estimated_wait_ms,
        }
    }
}
