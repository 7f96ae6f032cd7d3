//! Batch configuration and the pending FIFO.

use super::types::WorkUnit;
use crate::config::saturating_secs;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    /// Interval of the timer that seals partial batches.
    pub batch_timeout_secs: f64,
    pub max_concurrent_batches: usize,
    /// Soft budget for pending payload bytes. Exceeding it is logged, never rejected.
    pub memory_limit_mb: u64,
    /// Finished batches older than this are evicted from the registry. Unset keeps them.
    pub retention_secs: Option<f64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 6,
            batch_timeout_secs: 2.0,
            max_concurrent_batches: 2,
            memory_limit_mb: 4096,
            retention_secs: None,
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_batch_size(mut self, s: usize) -> Self {
        self.max_batch_size = s;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_max_concurrent_batches(mut self, n: usize) -> Self {
        self.max_concurrent_batches = n;
        self
    }

    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_secs = Some(retention.as_secs_f64());
        self
    }

    pub fn batch_timeout(&self) -> Duration {
        saturating_secs(self.batch_timeout_secs).max(Duration::from_millis(1))
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(saturating_secs)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }
}

/// Units waiting to be sealed, oldest first.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    units: VecDeque<WorkUnit>,
    bytes: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append and return the new length.
    pub fn push(&mut self, unit: WorkUnit) -> usize {
        self.bytes += unit.payload.size_bytes() as u64;
        self.units.push_back(unit);
        self.units.len()
    }

    /// Remove up to `n` units from the front, preserving submission order.
    pub fn take_front(&mut self, n: usize) -> Vec<WorkUnit> {
        let n = n.min(self.units.len());
        let taken: Vec<WorkUnit> = self.units.drain(..n).collect();
        let freed: u64 = taken.iter().map(|u| u.payload.size_bytes() as u64).sum();
        self.bytes = self.bytes.saturating_sub(freed);
        taken
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}
