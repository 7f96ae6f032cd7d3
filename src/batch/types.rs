//! Work units, lifecycle states and the worker seam.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub(crate) fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Opaque input for one unit of work plus its processing options.
#[derive(Debug, Clone, Default)]
pub struct WorkPayload {
    pub data: Bytes,
    pub options: serde_json::Value,
}

impl WorkPayload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            options: serde_json::Value::Null,
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Completed | UnitState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Sealed,
    Processing,
    Completed,
    Failed,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Failed)
    }
}

/// A submitted unit. Owned by the pending queue until sealed, then by its batch.
#[derive(Debug)]
pub struct WorkUnit {
    pub id: String,
    pub payload: WorkPayload,
    pub submitted_at: SystemTime,
}

impl WorkUnit {
    pub fn new(payload: WorkPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            submitted_at: SystemTime::now(),
        }
    }
}

/// The external processing function applied to each unit.
///
/// Errors and panics are contained per unit; they never abort sibling units.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn process(&self, unit_id: &str, payload: &WorkPayload) -> Result<serde_json::Value>;
}

/// Adapter turning an async closure into a [`Worker`].
pub struct FnWorker<F> {
    f: F,
}

pub fn worker_fn<F, Fut>(f: F) -> FnWorker<F>
where
    F: Fn(WorkPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    FnWorker { f }
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(WorkPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    async fn process(&self, _unit_id: &str, payload: &WorkPayload) -> Result<serde_json::Value> {
        (self.f)(payload.clone()).await
    }
}
