//! Run and event persistence for the web QA console.
//!
//! Two tables: a mutable run table and an append-only event log. The
//! store is the sole enforcer of the two structural invariants (at most
//! one running run per session key, unique strictly-increasing sequence
//! numbers per run), so callers lean on its atomic checks instead of
//! holding locks of their own.

mod error;
mod file;
mod memory;

pub use error::StoreError;
pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use webqa_protocol::{EventFamily, EventRecord, Run, RunId, RunStatus};

/// Run table operations.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a freshly created running run. Fails with
    /// [`StoreError::RunningExists`] when a running run already holds
    /// the same session key; the check and the insert are atomic.
    async fn insert_running(&self, run: &Run) -> Result<(), StoreError>;

    /// The running run for a session key, if any.
    async fn find_running(&self, session_key: &str) -> Result<Option<Run>, StoreError>;

    async fn get(&self, run_id: &RunId) -> Result<Option<Run>, StoreError>;

    /// Most recent runs, ordered by start time descending.
    async fn list(&self, limit: usize) -> Result<Vec<Run>, StoreError>;

    /// Transition a run out of `Running`, setting `finished_at` exactly
    /// once. Returns `false` without touching the row when the run is
    /// already terminal, so racing terminal writers (stream completion
    /// vs. cancellation) cannot overwrite each other.
    async fn finish_if_running(
        &self,
        run_id: &RunId,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Administrative removal of a run, cascading to its events.
    async fn delete(&self, run_id: &RunId) -> Result<(), StoreError>;
}

/// Append-only event log operations.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event. The sequence number must be past every
    /// previously appended sequence for the run; duplicates fail with
    /// [`StoreError::SequenceConflict`]. Gaps are tolerated: logging
    /// upstream is best-effort and a dropped write must not wedge the
    /// rest of the log.
    async fn append(&self, event: &EventRecord) -> Result<(), StoreError>;

    /// Events for a run in sequence order, optionally filtered by
    /// family, starting at `from_sequence`.
    async fn read_from(
        &self,
        run_id: &RunId,
        family: Option<EventFamily>,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// The complete log for a run in sequence order.
    async fn read_all(&self, run_id: &RunId) -> Result<Vec<EventRecord>, StoreError>;

    async fn delete_run_events(&self, run_id: &RunId) -> Result<(), StoreError>;
}

/// Convenience bound for components that persist both runs and events.
pub trait Store: RunStore + EventStore {}

impl<T: RunStore + EventStore> Store for T {}
