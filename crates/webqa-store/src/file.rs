//! Durable file-backed store: one JSON document per run plus one JSONL
//! append-only log per run's events.
//!
//! Atomicity of the one-running-run-per-session-key check is provided by
//! a single async mutex over the run index; event appends take a per-run
//! write lock and cache the latest sequence so steady-state appends do
//! not rescan the log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};
use webqa_protocol::{EventFamily, EventRecord, Run, RunId, RunStatus};

use crate::{EventStore, RunStore, StoreError};

#[derive(Debug, Default)]
struct RunIndex {
    loaded: bool,
    /// session key -> run id of the run currently holding it.
    running: HashMap<String, RunId>,
}

#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    run_index: tokio::sync::Mutex<RunIndex>,
    event_locks: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
    /// Latest appended sequence per run; inner `None` means the log
    /// exists-but-empty or was scanned empty.
    sequence_cache: Mutex<HashMap<RunId, Option<u64>>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run_index: tokio::sync::Mutex::new(RunIndex::default()),
            event_locks: Mutex::new(HashMap::new()),
            sequence_cache: Mutex::new(HashMap::new()),
        }
    }

    fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join("runs").join(format!("{run_id}.json"))
    }

    fn events_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join("events").join(format!("{run_id}.jsonl"))
    }

    async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn event_lock(&self, run_id: &RunId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.event_locks.lock();
        guard
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cached_latest(&self, run_id: &RunId) -> Option<Option<u64>> {
        self.sequence_cache.lock().get(run_id).copied()
    }

    fn update_cached_latest(&self, run_id: &RunId, latest: Option<u64>) {
        self.sequence_cache.lock().insert(run_id.clone(), latest);
    }

    async fn scan_latest_sequence(path: &Path) -> Result<Option<u64>, StoreError> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }

        let file = OpenOptions::new().read(true).open(path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut latest: Option<u64> = None;

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: EventRecord = serde_json::from_str(&line)?;
            latest = Some(latest.map_or(event.sequence, |current| current.max(event.sequence)));
        }
        Ok(latest)
    }

    async fn read_events(&self, run_id: &RunId) -> Result<Vec<EventRecord>, StoreError> {
        let path = self.events_path(run_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    async fn load_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        let path = self.run_path(run_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let bytes = fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn load_runs(&self) -> Result<Vec<Run>, StoreError> {
        let dir = self.root.join("runs");
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir).await?;
        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = fs::read(entry.path()).await?;
            runs.push(serde_json::from_slice(&bytes)?);
        }
        Ok(runs)
    }

    async fn write_run(&self, run: &Run) -> Result<(), StoreError> {
        let path = self.run_path(&run.run_id);
        Self::ensure_parent(&path).await?;
        let json = serde_json::to_vec(run)?;
        fs::write(&path, json).await?;
        Ok(())
    }

    async fn ensure_index(&self, index: &mut RunIndex) -> Result<(), StoreError> {
        if index.loaded {
            return Ok(());
        }
        for run in self.load_runs().await? {
            if run.status == RunStatus::Running {
                index
                    .running
                    .insert(run.session_key.clone(), run.run_id.clone());
            }
        }
        index.loaded = true;
        debug!(running = index.running.len(), "run index loaded");
        Ok(())
    }
}

#[async_trait]
impl RunStore for FileStore {
    #[instrument(
        skip(self, run),
        fields(run_id = %run.run_id, session_key = %run.session_key)
    )]
    async fn insert_running(&self, run: &Run) -> Result<(), StoreError> {
        let mut index = self.run_index.lock().await;
        self.ensure_index(&mut index).await?;

        if index.running.contains_key(&run.session_key) {
            return Err(StoreError::RunningExists {
                session_key: run.session_key.clone(),
            });
        }

        self.write_run(run).await?;
        index
            .running
            .insert(run.session_key.clone(), run.run_id.clone());
        debug!("running run inserted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_running(&self, session_key: &str) -> Result<Option<Run>, StoreError> {
        let mut index = self.run_index.lock().await;
        self.ensure_index(&mut index).await?;

        let Some(run_id) = index.running.get(session_key).cloned() else {
            return Ok(None);
        };
        match self.load_run(&run_id).await? {
            Some(run) if run.status == RunStatus::Running => Ok(Some(run)),
            _ => {
                // Stale entry: the run reached a terminal state out-of-band.
                index.running.remove(session_key);
                Ok(None)
            }
        }
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        self.load_run(run_id).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let mut runs = self.load_runs().await?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    #[instrument(skip(self), fields(run_id = %run_id, status = ?status))]
    async fn finish_if_running(
        &self,
        run_id: &RunId,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Ok(false);
        }

        let mut index = self.run_index.lock().await;
        self.ensure_index(&mut index).await?;

        let Some(mut run) = self.load_run(run_id).await? else {
            return Err(StoreError::RunNotFound(run_id.clone()));
        };
        if run.status != RunStatus::Running {
            return Ok(false);
        }

        run.status = status;
        run.finished_at = Some(finished_at);
        self.write_run(&run).await?;
        index.running.remove(&run.session_key);
        debug!("run finished");
        Ok(true)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn delete(&self, run_id: &RunId) -> Result<(), StoreError> {
        let mut index = self.run_index.lock().await;
        self.ensure_index(&mut index).await?;
        index.running.retain(|_, id| id != run_id);

        let path = self.run_path(run_id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(&path).await?;
        }
        drop(index);

        self.delete_run_events(run_id).await?;
        debug!("run deleted");
        Ok(())
    }
}

#[async_trait]
impl EventStore for FileStore {
    #[instrument(
        skip(self, event),
        fields(run_id = %event.run_id, sequence = event.sequence)
    )]
    async fn append(&self, event: &EventRecord) -> Result<(), StoreError> {
        let path = self.events_path(&event.run_id);
        Self::ensure_parent(&path).await?;

        let lock = self.event_lock(&event.run_id);
        let _guard = lock.lock().await;

        let latest = match self.cached_latest(&event.run_id) {
            Some(latest) => latest,
            None => {
                let latest = Self::scan_latest_sequence(&path).await?;
                self.update_cached_latest(&event.run_id, latest);
                latest
            }
        };

        if let Some(latest) = latest
            && event.sequence <= latest
        {
            warn!(latest, "sequence conflict while appending event");
            return Err(StoreError::SequenceConflict {
                run_id: event.run_id.clone(),
                sequence: event.sequence,
                latest,
            });
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let line = serde_json::to_string(event)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        self.update_cached_latest(&event.run_id, Some(event.sequence));
        debug!("event appended to log");
        Ok(())
    }

    async fn read_from(
        &self,
        run_id: &RunId,
        family: Option<EventFamily>,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let events = self.read_events(run_id).await?;
        Ok(events
            .into_iter()
            .filter(|event| event.sequence >= from_sequence)
            .filter(|event| family.is_none_or(|family| event.family == family))
            .take(limit)
            .collect())
    }

    async fn read_all(&self, run_id: &RunId) -> Result<Vec<EventRecord>, StoreError> {
        self.read_events(run_id).await
    }

    async fn delete_run_events(&self, run_id: &RunId) -> Result<(), StoreError> {
        let lock = self.event_lock(run_id);
        let _guard = lock.lock().await;

        let path = self.events_path(run_id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(&path).await?;
        }
        self.sequence_cache.lock().remove(run_id);
        Ok(())
    }
}
