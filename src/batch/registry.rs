//! Lifecycle records for units and batches, queryable by id.

use super::types::{epoch_millis, BatchState, UnitState, WorkUnit};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub unit_id: String,
    /// The unit's own progress. It can finish `Failed` inside a `Completed` batch.
    pub status: UnitState,
    pub submitted_at_ms: u64,
    /// Unset while the unit is still pending.
    pub batch_id: Option<String>,
    /// Status of the owning batch, which is what callers polling for batch
    /// completion should read. `None` until the unit is assigned.
    pub batch_status: Option<BatchState>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitSummary {
    pub unit_id: String,
    pub status: UnitState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub status: BatchState,
    pub total_units: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub units: Vec<UnitSummary>,
}

#[derive(Debug, Clone)]
struct UnitRecord {
    status: UnitState,
    submitted_at: SystemTime,
    batch_id: Option<String>,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct BatchRecord {
    status: BatchState,
    unit_ids: Vec<String>,
    created_at: SystemTime,
    started_at: Option<SystemTime>,
    completed_at: Option<SystemTime>,
    completed_count: usize,
    failed_count: usize,
}

/// Read side for clients, write side for the accumulator and executor.
///
/// The two maps have separate locks and no method holds both at once.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    units: RwLock<HashMap<String, UnitRecord>>,
    batches: RwLock<HashMap<String, BatchRecord>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn units_read(&self) -> RwLockReadGuard<'_, HashMap<String, UnitRecord>> {
        self.units.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn units_write(&self) -> RwLockWriteGuard<'_, HashMap<String, UnitRecord>> {
        self.units.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn batches_read(&self) -> RwLockReadGuard<'_, HashMap<String, BatchRecord>> {
        self.batches.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn batches_write(&self) -> RwLockWriteGuard<'_, HashMap<String, BatchRecord>> {
        self.batches.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn unit(&self, unit_id: &str) -> Option<UnitStatus> {
        let record = self.units_read().get(unit_id).cloned()?;
        let batch_status = record
            .batch_id
            .as_ref()
            .and_then(|b| self.batches_read().get(b).map(|r| r.status));

        Some(UnitStatus {
            unit_id: unit_id.to_string(),
            status: record.status,
            submitted_at_ms: epoch_millis(record.submitted_at),
            batch_id: record.batch_id,
            batch_status,
            result: record.result,
            error: record.error,
        })
    }

    pub fn batch(&self, batch_id: &str) -> Option<BatchStatus> {
        let record = self.batches_read().get(batch_id).cloned()?;
        let units = {
            let map = self.units_read();
            record
                .unit_ids
                .iter()
                .filter_map(|id| {
                    map.get(id).map(|u| UnitSummary {
                        unit_id: id.clone(),
                        status: u.status,
                        error: u.error.clone(),
                    })
                })
                .collect()
        };

        Some(BatchStatus {
            batch_id: batch_id.to_string(),
            status: record.status,
            total_units: record.unit_ids.len(),
            completed_count: record.completed_count,
            failed_count: record.failed_count,
            created_at_ms: epoch_millis(record.created_at),
            started_at_ms: record.started_at.map(epoch_millis),
            completed_at_ms: record.completed_at.map(epoch_millis),
            units,
        })
    }

    /// Ids of all known batches, oldest first.
    pub fn batch_ids(&self) -> Vec<String> {
        let map = self.batches_read();
        let mut ids: Vec<(&String, SystemTime)> =
            map.iter().map(|(id, r)| (id, r.created_at)).collect();
        ids.sort_by_key(|(_, created)| *created);
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn batch_count(&self) -> usize {
        self.batches_read().len()
    }

    pub fn unit_count(&self) -> usize {
        self.units_read().len()
    }

    pub(crate) fn insert_pending(&self, unit: &WorkUnit) {
        self.units_write().insert(
            unit.id.clone(),
            UnitRecord {
                status: UnitState::Pending,
                submitted_at: unit.submitted_at,
                batch_id: None,
                result: None,
                error: None,
            },
        );
    }

    pub(crate) fn seal(&self, batch_id: &str, units: &[WorkUnit]) {
        // Batch first so a unit never points at a missing batch.
        self.batches_write().insert(
            batch_id.to_string(),
            BatchRecord {
                status: BatchState::Sealed,
                unit_ids: units.iter().map(|u| u.id.clone()).collect(),
                created_at: SystemTime::now(),
                started_at: None,
                completed_at: None,
                completed_count: 0,
                failed_count: 0,
            },
        );
        let mut map = self.units_write();
        for unit in units {
            if let Some(record) = map.get_mut(&unit.id) {
                record.status = UnitState::Assigned;
                record.batch_id = Some(batch_id.to_string());
            }
        }
    }

    pub(crate) fn start_batch(&self, batch_id: &str) {
        if let Some(record) = self.batches_write().get_mut(batch_id) {
            record.status = BatchState::Processing;
            record.started_at = Some(SystemTime::now());
        }
    }

    pub(crate) fn start_unit(&self, unit_id: &str) {
        if let Some(record) = self.units_write().get_mut(unit_id) {
            record.status = UnitState::Processing;
        }
    }

    pub(crate) fn complete_unit(&self, batch_id: &str, unit_id: &str, result: serde_json::Value) {
        if let Some(record) = self.units_write().get_mut(unit_id) {
            record.status = UnitState::Completed;
            record.result = Some(result);
        }
        if let Some(batch) = self.batches_write().get_mut(batch_id) {
            batch.completed_count += 1;
        }
    }

    pub(crate) fn fail_unit(&self, batch_id: &str, unit_id: &str, error: String) {
        if let Some(record) = self.units_write().get_mut(unit_id) {
            record.status = UnitState::Failed;
            record.error = Some(error);
        }
        if let Some(batch) = self.batches_write().get_mut(batch_id) {
            batch.failed_count += 1;
        }
    }

    pub(crate) fn finish_batch(&self, batch_id: &str, state: BatchState) {
        if let Some(record) = self.batches_write().get_mut(batch_id) {
            record.status = state;
            record.completed_at = Some(SystemTime::now());
        }
    }

    /// Evict finished batches (and their units) completed more than `retention` ago.
    pub fn cleanup(&self, retention: Duration) -> usize {
        let now = SystemTime::now();
        let expired: Vec<(String, Vec<String>)> = {
            let mut map = self.batches_write();
            let ids: Vec<String> = map
                .iter()
                .filter(|(_, r)| {
                    r.status.is_terminal()
                        && r.completed_at
                            .and_then(|t| now.duration_since(t).ok())
                            .map_or(false, |age| age >= retention)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| map.remove(&id).map(|r| (id, r.unit_ids)))
                .collect()
        };

        if !expired.is_empty() {
            let mut units = self.units_write();
            for (_, unit_ids) in &expired {
                for id in unit_ids {
                    units.remove(id);
                }
            }
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::types::WorkPayload;

    fn units(n: usize) -> Vec<WorkUnit> {
        (0..n).map(|_| WorkUnit::new(WorkPayload::new("page"))).collect()
    }

    #[test]
    fn test_unknown_ids() {
        let registry = StatusRegistry::new();
        assert!(registry.unit("missing").is_none());
        assert!(registry.batch("missing").is_none());
    }

    #[test]
    fn test_pending_unit_has_no_batch() {
        let registry = StatusRegistry::new();
        let u = WorkUnit::new(WorkPayload::new("page"));
        registry.insert_pending(&u);

        let status = registry.unit(&u.id).unwrap();
        assert_eq!(status.status, UnitState::Pending);
        assert!(status.batch_id.is_none());
        assert!(status.batch_status.is_none());
        assert!(status.submitted_at_ms > 0);
    }

    #[test]
    fn test_lifecycle_updates_counters() {
        let registry = StatusRegistry::new();
        let batch = units(3);
        for u in &batch {
            registry.insert_pending(u);
        }
        registry.seal("b1", &batch);

        let sealed = registry.batch("b1").unwrap();
        assert_eq!(sealed.status, BatchState::Sealed);
        assert_eq!(sealed.total_units, 3);
        let first = registry.unit(&batch[0].id).unwrap();
        assert_eq!(first.status, UnitState::Assigned);
        assert_eq!(first.batch_id.as_deref(), Some("b1"));
        assert_eq!(first.batch_status, Some(BatchState::Sealed));

        registry.start_batch("b1");
        registry.start_unit(&batch[0].id);
        registry.complete_unit("b1", &batch[0].id, serde_json::json!({"ok": true}));
        registry.start_unit(&batch[1].id);
        registry.fail_unit("b1", &batch[1].id, "bad image".into());
        registry.start_unit(&batch[2].id);
        registry.complete_unit("b1", &batch[2].id, serde_json::json!(null));
        registry.finish_batch("b1", BatchState::Completed);

        let done = registry.batch("b1").unwrap();
        assert_eq!(done.status, BatchState::Completed);
        assert_eq!(done.completed_count, 2);
        assert_eq!(done.failed_count, 1);
        assert!(done.started_at_ms.is_some());
        assert!(done.completed_at_ms.is_some());
        assert_eq!(done.units[1].status, UnitState::Failed);
        assert_eq!(done.units[1].error.as_deref(), Some("bad image"));

        let ok = registry.unit(&batch[0].id).unwrap();
        assert_eq!(ok.result, Some(serde_json::json!({"ok": true})));
        assert!(ok.error.is_none());

        let bad = registry.unit(&batch[1].id).unwrap();
        assert_eq!(bad.status, UnitState::Failed);
        assert_eq!(bad.batch_status, Some(BatchState::Completed));
    }

    #[test]
    fn test_cleanup_only_evicts_finished_batches() {
        let registry = StatusRegistry::new();
        let finished = units(2);
        let running = units(1);
        for u in finished.iter().chain(running.iter()) {
            registry.insert_pending(u);
        }
        registry.seal("done", &finished);
        registry.finish_batch("done", BatchState::Completed);
        registry.seal("busy", &running);
        registry.start_batch("busy");

        assert_eq!(registry.cleanup(Duration::from_secs(3600)), 0);
        assert_eq!(registry.cleanup(Duration::ZERO), 1);
        assert!(registry.batch("done").is_none());
        assert!(registry.unit(&finished[0].id).is_none());
        assert!(registry.batch("busy").is_some());
        assert_eq!(registry.unit_count(), 1);
    }

    #[test]
    fn test_batch_ids_in_creation_order() {
        let registry = StatusRegistry::new();
        registry.seal("first", &units(1));
        std::thread::sleep(Duration::from_millis(2));
        registry.seal("second", &units(1));
        assert_eq!(registry.batch_ids(), vec!["first".to_string(), "second".to_string()]);
        assert_eq!(registry.batch_count(), 2);
    }
}
