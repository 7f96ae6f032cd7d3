//! Per-identity inbound admission over two rolling windows.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const LIMIT_MINUTE_HEADER: &str = "x-ratelimit-limit-minute";
pub const REMAINING_MINUTE_HEADER: &str = "x-ratelimit-remaining-minute";
pub const LIMIT_HOUR_HEADER: &str = "x-ratelimit-limit-hour";
pub const REMAINING_HOUR_HEADER: &str = "x-ratelimit-remaining-hour";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

#[derive(Debug, Clone)]
pub struct SlidingWindowConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// Length of the short window (60s outside tests).
    pub short_window: Duration,
    /// Length of the long window (3600s outside tests).
    pub long_window: Duration,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            short_window: Duration::from_secs(60),
            long_window: Duration::from_secs(3600),
        }
    }
}

impl SlidingWindowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requests_per_minute(mut self, n: u32) -> Self {
        self.requests_per_minute = n;
        self
    }

    pub fn with_requests_per_hour(mut self, n: u32) -> Self {
        self.requests_per_hour = n;
        self
    }

    pub fn with_windows(mut self, short: Duration, long: Duration) -> Self {
        self.short_window = short;
        self.long_window = long;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowQuota {
    pub limit: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingWindow {
    Minute,
    Hour,
}

/// Outcome of [`SlidingWindowLimiter::is_allowed`].
///
/// Quotas describe the windows as they were before this request was counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub minute: WindowQuota,
    pub hour: WindowQuota,
    /// Seconds until the binding window frees a slot. Set only on rejection.
    pub retry_after_secs: Option<u64>,
    /// Epoch seconds at which the binding window's oldest entry expires.
    pub reset_at_epoch_secs: Option<u64>,
    pub binding: Option<BindingWindow>,
}

impl RateLimitDecision {
    /// Response headers for this decision. Quota headers are always present.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut put = |name: &'static str, value: u64| {
            headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
        };
        put(LIMIT_MINUTE_HEADER, self.minute.limit as u64);
        put(REMAINING_MINUTE_HEADER, self.minute.remaining as u64);
        put(LIMIT_HOUR_HEADER, self.hour.limit as u64);
        put(REMAINING_HOUR_HEADER, self.hour.remaining as u64);
        if let Some(reset) = self.reset_at_epoch_secs {
            put(RESET_HEADER, reset);
        }
        if let Some(secs) = self.retry_after_secs {
            headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        headers
    }
}

#[derive(Debug, Default)]
struct WindowEntry {
    short: VecDeque<Instant>,
    long: VecDeque<Instant>,
}

impl WindowEntry {
    fn purge(&mut self, now: Instant, short: Duration, long: Duration) {
        purge_older_than(&mut self.short, now, short);
        purge_older_than(&mut self.long, now, long);
    }

    fn is_empty(&self) -> bool {
        self.short.is_empty() && self.long.is_empty()
    }
}

fn purge_older_than(log: &mut VecDeque<Instant>, now: Instant, max_age: Duration) {
    while let Some(front) = log.front() {
        if now.saturating_duration_since(*front) >= max_age {
            log.pop_front();
        } else {
            break;
        }
    }
}

/// Two-window limiter keyed by client identity (e.g. remote address).
///
/// Purge, count and append happen in one critical section so two concurrent
/// requests cannot both take the last slot.
pub struct SlidingWindowLimiter {
    cfg: SlidingWindowConfig,
    entries: Mutex<HashMap<String, WindowEntry>>,
}

impl SlidingWindowLimiter {
    pub fn new(cfg: SlidingWindowConfig) -> Self {
        Self {
            cfg,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SlidingWindowConfig {
        &self.cfg
    }

    pub fn is_allowed(&self, identity: &str) -> RateLimitDecision {
        let now = Instant::now();
        let cfg = &self.cfg;

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(identity.to_string()).or_default();
        entry.purge(now, cfg.short_window, cfg.long_window);

        let short_count = entry.short.len() as u32;
        let long_count = entry.long.len() as u32;
        let short_ok = short_count < cfg.requests_per_minute;
        let long_ok = long_count < cfg.requests_per_hour;

        let mut decision = RateLimitDecision {
            allowed: short_ok && long_ok,
            minute: WindowQuota {
                limit: cfg.requests_per_minute,
                remaining: cfg.requests_per_minute.saturating_sub(short_count),
            },
            hour: WindowQuota {
                limit: cfg.requests_per_hour,
                remaining: cfg.requests_per_hour.saturating_sub(long_count),
            },
            retry_after_secs: None,
            reset_at_epoch_secs: None,
            binding: None,
        };

        if decision.allowed {
            entry.short.push_back(now);
            entry.long.push_back(now);
            return decision;
        }

        let (binding, oldest, window) = if !short_ok {
            (BindingWindow::Minute, entry.short.front().copied(), cfg.short_window)
        } else {
            (BindingWindow::Hour, entry.long.front().copied(), cfg.long_window)
        };
        // A zero limit leaves the window empty; fall back to a full window.
        let age = oldest
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO);
        let left = window.saturating_sub(age);

        decision.binding = Some(binding);
        decision.retry_after_secs = Some(left.as_secs() + 1);
        decision.reset_at_epoch_secs = Some(epoch_secs_after(left));
        decision
    }

    /// Drop identities whose windows are both empty. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.purge(now, self.cfg.short_window, self.cfg.long_window);
            !entry.is_empty()
        });
        before - entries.len()
    }

    pub fn tracked_identities(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn epoch_secs_after(delay: Duration) -> u64 {
    SystemTime::now()
        .checked_add(delay)
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_exactly_minute_limit() {
        let limiter = SlidingWindowLimiter::new(SlidingWindowConfig::new().with_requests_per_minute(5));
        for i in 0..5 {
            let d = limiter.is_allowed("10.0.0.1");
            assert!(d.allowed, "request {} should be admitted", i);
            assert_eq!(d.minute.remaining, 5 - i);
        }

        let rejected = limiter.is_allowed("10.0.0.1");
        assert!(!rejected.allowed);
        assert_eq!(rejected.binding, Some(BindingWindow::Minute));
        assert_eq!(rejected.minute.remaining, 0);
        let retry = rejected.retry_after_secs.unwrap();
        assert!(retry > 0 && retry <= 61);
        assert!(rejected.reset_at_epoch_secs.is_some());
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = SlidingWindowLimiter::new(SlidingWindowConfig::new().with_requests_per_minute(1));
        assert!(limiter.is_allowed("a").allowed);
        assert!(!limiter.is_allowed("a").allowed);
        assert!(limiter.is_allowed("b").allowed);
        assert_eq!(limiter.tracked_identities(), 2);
    }

    #[test]
    fn test_hour_window_binds_when_minute_has_room() {
        let limiter = SlidingWindowLimiter::new(
            SlidingWindowConfig::new()
                .with_requests_per_minute(10)
                .with_requests_per_hour(2),
        );
        assert!(limiter.is_allowed("c").allowed);
        assert!(limiter.is_allowed("c").allowed);

        let d = limiter.is_allowed("c");
        assert!(!d.allowed);
        assert_eq!(d.binding, Some(BindingWindow::Hour));
        assert_eq!(d.minute.remaining, 8);
        assert_eq!(d.hour.remaining, 0);
        assert!(d.retry_after_secs.unwrap() > 60);
    }

    #[test]
    fn test_rejected_requests_are_not_counted() {
        let limiter = SlidingWindowLimiter::new(
            SlidingWindowConfig::new()
                .with_requests_per_minute(1)
                .with_requests_per_hour(3),
        );
        assert!(limiter.is_allowed("d").allowed);
        for _ in 0..5 {
            assert!(!limiter.is_allowed("d").allowed);
        }
        assert_eq!(limiter.is_allowed("d").hour.remaining, 2);
    }

    #[test]
    fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new(
            SlidingWindowConfig::new()
                .with_requests_per_minute(2)
                .with_windows(Duration::from_millis(60), Duration::from_secs(3600)),
        );
        assert!(limiter.is_allowed("e").allowed);
        assert!(limiter.is_allowed("e").allowed);
        assert!(!limiter.is_allowed("e").allowed);

        std::thread::sleep(Duration::from_millis(80));
        let d = limiter.is_allowed("e");
        assert!(d.allowed);
        assert_eq!(d.minute.remaining, 2);
        assert_eq!(d.hour.remaining, 998);
    }

    #[test]
    fn test_headers_always_carry_quotas() {
        let limiter = SlidingWindowLimiter::new(SlidingWindowConfig::new().with_requests_per_minute(1));
        let allowed = limiter.is_allowed("f").headers();
        assert_eq!(allowed.get(LIMIT_MINUTE_HEADER).unwrap(), "1");
        assert_eq!(allowed.get(REMAINING_MINUTE_HEADER).unwrap(), "1");
        assert_eq!(allowed.get(LIMIT_HOUR_HEADER).unwrap(), "1000");
        assert_eq!(allowed.get(REMAINING_HOUR_HEADER).unwrap(), "1000");
        assert!(allowed.get(RETRY_AFTER).is_none());

        let rejected = limiter.is_allowed("f").headers();
        assert_eq!(rejected.get(REMAINING_MINUTE_HEADER).unwrap(), "0");
        assert!(rejected.get(RETRY_AFTER).is_some());
        assert!(rejected.get(RESET_HEADER).is_some());
    }

    #[test]
    fn test_evict_idle() {
        let limiter = SlidingWindowLimiter::new(
            SlidingWindowConfig::new()
                .with_windows(Duration::from_millis(20), Duration::from_millis(40)),
        );
        limiter.is_allowed("g");
        limiter.is_allowed("h");
        assert_eq!(limiter.evict_idle(), 0);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(limiter.evict_idle(), 2);
        assert_eq!(limiter.tracked_identities(), 0);
    }

    #[test]
    fn test_concurrent_callers_share_the_last_slot() {
        use std::sync::Arc;
        use std::thread;

        let limiter = Arc::new(SlidingWindowLimiter::new(
            SlidingWindowConfig::new().with_requests_per_minute(25),
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let l = Arc::clone(&limiter);
                thread::spawn(move || (0..10).filter(|_| l.is_allowed("shared").allowed).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 25);
    }
}
