//! In-memory store, the test workhorse. Also usable as an embedded
//! backend when durability is not required.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use webqa_protocol::{EventFamily, EventRecord, Run, RunId, RunStatus};

use crate::{EventStore, RunStore, StoreError};

#[derive(Default)]
struct Tables {
    runs: HashMap<RunId, Run>,
    events: HashMap<RunId, Vec<EventRecord>>,
}

/// Both tables behind one mutex, so the check-then-insert paths that
/// back the uniqueness invariants are atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_running(&self, run: &Run) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let conflict = tables
            .runs
            .values()
            .any(|existing| {
                existing.status == RunStatus::Running && existing.session_key == run.session_key
            });
        if conflict {
            return Err(StoreError::RunningExists {
                session_key: run.session_key.clone(),
            });
        }
        tables.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn find_running(&self, session_key: &str) -> Result<Option<Run>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .runs
            .values()
            .find(|run| run.status == RunStatus::Running && run.session_key == session_key)
            .cloned())
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.tables.lock().runs.get(run_id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let mut runs: Vec<Run> = self.tables.lock().runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn finish_if_running(
        &self,
        run_id: &RunId,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Ok(false);
        }
        let mut tables = self.tables.lock();
        let run = tables
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.clone()))?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        run.status = status;
        run.finished_at = Some(finished_at);
        Ok(true)
    }

    async fn delete(&self, run_id: &RunId) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables.runs.remove(run_id);
        tables.events.remove(run_id);
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, event: &EventRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let log = tables.events.entry(event.run_id.clone()).or_default();
        if let Some(latest) = log.last().map(|last| last.sequence)
            && event.sequence <= latest
        {
            return Err(StoreError::SequenceConflict {
                run_id: event.run_id.clone(),
                sequence: event.sequence,
                latest,
            });
        }
        log.push(event.clone());
        Ok(())
    }

    async fn read_from(
        &self,
        run_id: &RunId,
        family: Option<EventFamily>,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let tables = self.tables.lock();
        let events = tables
            .events
            .get(run_id)
            .map(|log| {
                log.iter()
                    .filter(|event| event.sequence >= from_sequence)
                    .filter(|event| family.is_none_or(|family| event.family == family))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(events)
    }

    async fn read_all(&self, run_id: &RunId) -> Result<Vec<EventRecord>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables.events.get(run_id).cloned().unwrap_or_default())
    }

    async fn delete_run_events(&self, run_id: &RunId) -> Result<(), StoreError> {
        self.tables.lock().events.remove(run_id);
        Ok(())
    }
}
