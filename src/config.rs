//! Configuration for the outbound, inbound and batching layers.
//!
//! Values come from YAML (every field optional) and may be overridden from the
//! environment with `ADMISSION_*` variables.

use crate::batch::BatchConfig;
use crate::resilience::backoff::BackoffConfig;
use crate::resilience::sliding_window::SlidingWindowConfig;
use crate::resilience::token_bucket::TokenBucketConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Seconds to a `Duration`, saturating at `Duration::MAX` and flooring negatives and NaN at zero.
pub(crate) fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

fn is_duration_secs(secs: f64) -> bool {
    secs >= 0.0 && Duration::try_from_secs_f64(secs).is_ok()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub outbound: OutboundConfig,
    pub inbound: InboundConfig,
    pub batch: BatchConfig,
}

/// Outbound pacing and retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    pub rate_per_second: f64,
    /// Defaults to twice the rate.
    pub bucket_capacity: Option<f64>,
    pub max_retries: u32,
    pub initial_backoff_secs: f64,
    /// Ceiling for a single backoff sleep; unset means uncapped.
    pub max_backoff_secs: Option<f64>,
    pub request_timeout_secs: f64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 5.0,
            bucket_capacity: None,
            max_retries: 3,
            initial_backoff_secs: 2.0,
            max_backoff_secs: None,
            request_timeout_secs: 15.0,
        }
    }
}

impl OutboundConfig {
    pub fn with_rate_per_second(mut self, rps: f64) -> Self {
        self.rate_per_second = rps;
        self
    }

    pub fn with_bucket_capacity(mut self, capacity: f64) -> Self {
        self.bucket_capacity = Some(capacity);
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_initial_backoff_secs(mut self, secs: f64) -> Self {
        self.initial_backoff_secs = secs;
        self
    }

    pub fn with_max_backoff_secs(mut self, secs: f64) -> Self {
        self.max_backoff_secs = Some(secs);
        self
    }

    pub fn capacity(&self) -> f64 {
        self.bucket_capacity
            .unwrap_or(self.rate_per_second * 2.0)
    }

    pub fn token_bucket(&self) -> TokenBucketConfig {
        TokenBucketConfig::new()
            .with_rate(self.rate_per_second)
            .with_capacity(self.capacity())
    }

    pub fn backoff(&self) -> BackoffConfig {
        let mut cfg = BackoffConfig::new()
            .with_max_retries(self.max_retries)
            .with_initial_backoff(saturating_secs(self.initial_backoff_secs));
        if let Some(cap) = self.max_backoff_secs {
            cfg = cfg.with_max_backoff(saturating_secs(cap));
        }
        cfg
    }
}

/// Inbound per-client limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// Paths that bypass inbound limiting.
    pub exempt_paths: Vec<String>,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            exempt_paths: ["/", "/health", "/docs", "/redoc", "/openapi.json"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl InboundConfig {
    pub fn with_requests_per_minute(mut self, n: u32) -> Self {
        self.requests_per_minute = n;
        self
    }

    pub fn with_requests_per_hour(mut self, n: u32) -> Self {
        self.requests_per_hour = n;
        self
    }

    pub fn sliding_window(&self) -> SlidingWindowConfig {
        SlidingWindowConfig::new()
            .with_requests_per_minute(self.requests_per_minute)
            .with_requests_per_hour(self.requests_per_hour)
    }
}

impl AdmissionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Apply `ADMISSION_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse::<T>().ok())
        }

        if let Some(v) = parsed(&lookup, "ADMISSION_RPS") {
            self.outbound.rate_per_second = v;
        }
        if let Some(v) = parsed(&lookup, "ADMISSION_BUCKET_CAPACITY") {
            self.outbound.bucket_capacity = Some(v);
        }
        if let Some(v) = parsed(&lookup, "ADMISSION_MAX_RETRIES") {
            self.outbound.max_retries = v;
        }
        if let Some(v) = parsed(&lookup, "ADMISSION_RPM") {
            self.inbound.requests_per_minute = v;
        }
        if let Some(v) = parsed(&lookup, "ADMISSION_RPH") {
            self.inbound.requests_per_hour = v;
        }
        if let Some(v) = parsed(&lookup, "ADMISSION_MAX_BATCH_SIZE") {
            self.batch.max_batch_size = v;
        }
        if let Some(v) = parsed(&lookup, "ADMISSION_BATCH_TIMEOUT_SECS") {
            self.batch.batch_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "ADMISSION_MAX_CONCURRENT_BATCHES") {
            self.batch.max_concurrent_batches = v;
        }
        if let Some(v) = parsed(&lookup, "ADMISSION_MEMORY_LIMIT_MB") {
            self.batch.memory_limit_mb = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: &str, value: String| {
            Err(Error::configuration_with_context(
                msg,
                ErrorContext::new()
                    .with_field_path(field)
                    .with_details(format!("got {value}"))
                    .with_source("config_loader"),
            ))
        };

        let out = &self.outbound;
        if !out.rate_per_second.is_finite() || out.rate_per_second <= 0.0 {
            return invalid(
                "outbound.rate_per_second",
                "rate must be a positive number",
                out.rate_per_second.to_string(),
            );
        }
        if !out.capacity().is_finite() || out.capacity() < 1.0 {
            return invalid(
                "outbound.bucket_capacity",
                "bucket must hold at least one token",
                out.capacity().to_string(),
            );
        }
        if !is_duration_secs(out.initial_backoff_secs) {
            return invalid(
                "outbound.initial_backoff_secs",
                "backoff must be a non-negative duration",
                out.initial_backoff_secs.to_string(),
            );
        }
        if let Some(cap) = out.max_backoff_secs {
            if !is_duration_secs(cap) {
                return invalid(
                    "outbound.max_backoff_secs",
                    "backoff ceiling must be a non-negative duration",
                    cap.to_string(),
                );
            }
        }
        if !is_duration_secs(out.request_timeout_secs) || out.request_timeout_secs <= 0.0 {
            return invalid(
                "outbound.request_timeout_secs",
                "request timeout must be a positive duration",
                out.request_timeout_secs.to_string(),
            );
        }

        let batch = &self.batch;
        if batch.max_batch_size == 0 {
            return invalid(
                "batch.max_batch_size",
                "max_batch_size must be at least 1",
                batch.max_batch_size.to_string(),
            );
        }
        if batch.max_concurrent_batches == 0 || batch.max_concurrent_batches > Semaphore::MAX_PERMITS {
            return invalid(
                "batch.max_concurrent_batches",
                "max_concurrent_batches must be between 1 and the semaphore permit limit",
                batch.max_concurrent_batches.to_string(),
            );
        }
        if !is_duration_secs(batch.batch_timeout_secs) || batch.batch_timeout_secs <= 0.0 {
            return invalid(
                "batch.batch_timeout_secs",
                "batch timeout must be a positive duration",
                batch.batch_timeout_secs.to_string(),
            );
        }
        if let Some(retention) = batch.retention_secs {
            if !is_duration_secs(retention) {
                return invalid(
                    "batch.retention_secs",
                    "retention must be a non-negative duration",
                    retention.to_string(),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = AdmissionConfig::default();
        assert_eq!(cfg.outbound.rate_per_second, 5.0);
        assert_eq!(cfg.outbound.capacity(), 10.0);
        assert_eq!(cfg.outbound.max_retries, 3);
        assert_eq!(cfg.outbound.initial_backoff_secs, 2.0);
        assert_eq!(cfg.inbound.requests_per_minute, 60);
        assert_eq!(cfg.inbound.requests_per_hour, 1000);
        assert_eq!(cfg.batch.max_batch_size, 6);
        assert_eq!(cfg.batch.batch_timeout_secs, 2.0);
        assert_eq!(cfg.batch.max_concurrent_batches, 2);
        assert_eq!(cfg.batch.memory_limit_mb, 4096);
        assert!(cfg.inbound.exempt_paths.contains(&"/health".to_string()));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = AdmissionConfig::from_yaml_str(
            r#"
batch:
  max_batch_size: 4
outbound:
  rate_per_second: 2.5
  max_backoff_secs: 30
"#,
        )
        .unwrap();
        assert_eq!(cfg.batch.max_batch_size, 4);
        assert_eq!(cfg.batch.batch_timeout_secs, 2.0);
        assert_eq!(cfg.outbound.capacity(), 5.0);
        assert_eq!(cfg.outbound.backoff().max_backoff, Some(Duration::from_secs(30)));
        assert_eq!(cfg.inbound.requests_per_minute, 60);
    }

    #[test]
    fn test_invalid_yaml_values_rejected() {
        let err = AdmissionConfig::from_yaml_str("batch:\n  max_batch_size: 0\n").unwrap_err();
        let ctx = err.context().unwrap();
        assert_eq!(ctx.field_path.as_deref(), Some("batch.max_batch_size"));

        assert!(AdmissionConfig::from_yaml_str("outbound:\n  rate_per_second: 0\n").is_err());
        assert!(AdmissionConfig::from_yaml_str("batch:\n  batch_timeout_secs: -1\n").is_err());
        assert!(AdmissionConfig::from_yaml_str("outbound:\n  bucket_capacity: 0.5\n").is_err());
    }

    #[test]
    fn test_unrepresentable_durations_rejected() {
        let cases = [
            ("outbound:\n  max_backoff_secs: .inf\n", "outbound.max_backoff_secs"),
            ("outbound:\n  max_backoff_secs: -3\n", "outbound.max_backoff_secs"),
            ("outbound:\n  request_timeout_secs: 1.0e30\n", "outbound.request_timeout_secs"),
            ("outbound:\n  request_timeout_secs: 0\n", "outbound.request_timeout_secs"),
            ("outbound:\n  initial_backoff_secs: .nan\n", "outbound.initial_backoff_secs"),
            ("batch:\n  batch_timeout_secs: 1.0e30\n", "batch.batch_timeout_secs"),
            ("batch:\n  retention_secs: .inf\n", "batch.retention_secs"),
            (
                "batch:\n  max_concurrent_batches: 18446744073709551615\n",
                "batch.max_concurrent_batches",
            ),
        ];
        for (yaml, field) in cases {
            let err = AdmissionConfig::from_yaml_str(yaml).unwrap_err();
            let ctx = err.context().unwrap();
            assert_eq!(ctx.field_path.as_deref(), Some(field), "{yaml}");
            assert!(ctx.details.as_deref().unwrap().starts_with("got "));
        }
    }

    #[test]
    fn test_saturating_secs() {
        assert_eq!(saturating_secs(1.5), Duration::from_millis(1500));
        assert_eq!(saturating_secs(f64::INFINITY), Duration::MAX);
        assert_eq!(saturating_secs(1.0e30), Duration::MAX);
        assert_eq!(saturating_secs(-2.0), Duration::ZERO);
        assert_eq!(saturating_secs(f64::NAN), Duration::ZERO);
    }

    #[test]
    fn test_unvalidated_outbound_values_do_not_panic() {
        let outbound = OutboundConfig::default().with_max_backoff_secs(f64::INFINITY);
        assert_eq!(outbound.backoff().max_backoff, Some(Duration::MAX));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ADMISSION_RPS", "8"),
            ("ADMISSION_MAX_BATCH_SIZE", "12"),
            ("ADMISSION_BATCH_TIMEOUT_SECS", "0.5"),
            ("ADMISSION_RPM", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let cfg = AdmissionConfig::default()
            .with_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.outbound.rate_per_second, 8.0);
        assert_eq!(cfg.outbound.capacity(), 16.0);
        assert_eq!(cfg.batch.max_batch_size, 12);
        assert_eq!(cfg.batch.batch_timeout_secs, 0.5);
        assert_eq!(cfg.inbound.requests_per_minute, 60);
    }

    #[test]
    fn test_section_conversions() {
        let cfg = AdmissionConfig::default();
        let bucket = cfg.outbound.token_bucket();
        assert_eq!(bucket.rate_per_second, 5.0);
        assert_eq!(bucket.capacity, 10.0);

        let backoff = cfg.outbound.backoff();
        assert_eq!(backoff.initial_backoff, Duration::from_secs(2));
        assert!(backoff.max_backoff.is_none());

        let window = cfg.inbound.sliding_window();
        assert_eq!(window.requests_per_minute, 60);
        assert_eq!(window.short_window, Duration::from_secs(60));
    }
}
