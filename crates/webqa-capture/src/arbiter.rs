//! Session arbitration: at most one running run per session key.
//!
//! Correctness rests entirely on the store's atomic uniqueness check.
//! The arbiter holds no locks, and a constraint violation is an
//! expected, recoverable condition (two requests racing on the same
//! browser session), not a bug.

use chrono::Utc;
use tracing::{debug, instrument};
use webqa_protocol::{Run, RunStatus, TestId};
use webqa_store::{RunStore, StoreError};

use crate::error::CaptureError;

/// Establish the single running run for a session key, creating it when
/// none exists and returning the already-running one otherwise. Safe to
/// call concurrently from racing request handlers.
#[instrument(skip(store, prompt, test_id))]
pub async fn ensure_running_run(
    store: &dyn RunStore,
    session_key: &str,
    prompt: &str,
    test_id: Option<TestId>,
) -> Result<Run, CaptureError> {
    let run = Run::new(session_key, prompt, test_id);
    match store.insert_running(&run).await {
        Ok(()) => {
            debug!(run_id = %run.run_id, "created running run");
            Ok(run)
        }
        Err(StoreError::RunningExists { .. }) => match store.find_running(session_key).await? {
            Some(existing) => {
                debug!(run_id = %existing.run_id, "reusing running run");
                Ok(existing)
            }
            // The other run finished between the violation and the
            // lookup; surface it instead of looping.
            None => Err(CaptureError::ArbitrationRace {
                session_key: session_key.to_owned(),
            }),
        },
        Err(error) => Err(error.into()),
    }
}

/// Out-of-band stop: transition the session's running run to canceled.
/// Returns `None` when nothing was running (or another terminal writer
/// got there first).
#[instrument(skip(store))]
pub async fn cancel_running_run(
    store: &dyn RunStore,
    session_key: &str,
) -> Result<Option<Run>, CaptureError> {
    let Some(mut run) = store.find_running(session_key).await? else {
        return Ok(None);
    };

    let finished_at = Utc::now();
    if store
        .finish_if_running(&run.run_id, RunStatus::Canceled, finished_at)
        .await?
    {
        debug!(run_id = %run.run_id, "run canceled");
        run.status = RunStatus::Canceled;
        run.finished_at = Some(finished_at);
        Ok(Some(run))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use webqa_protocol::RunId;
    use webqa_store::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_converge_on_one_run() {
        let store = Arc::new(MemoryStore::new());
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ensure_running_run(store.as_ref(), "browser-1", "race", None)
                    .await
                    .expect("arbitration succeeds")
            }));
        }

        let mut run_ids = HashSet::new();
        for handle in handles {
            run_ids.insert(handle.await.unwrap().run_id);
        }
        assert_eq!(run_ids.len(), 1);

        let running = store.find_running("browser-1").await.unwrap().unwrap();
        assert!(run_ids.contains(&running.run_id));
    }

    #[tokio::test]
    async fn distinct_session_keys_get_distinct_runs() {
        let store = MemoryStore::new();
        let first = ensure_running_run(&store, "browser-1", "a", None).await.unwrap();
        let second = ensure_running_run(&store, "browser-2", "b", None).await.unwrap();
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn cancel_transitions_and_frees_the_key() {
        let store = MemoryStore::new();
        let run = ensure_running_run(&store, "browser-1", "prompt", None).await.unwrap();

        let canceled = cancel_running_run(&store, "browser-1").await.unwrap().unwrap();
        assert_eq!(canceled.run_id, run.run_id);
        assert_eq!(canceled.status, RunStatus::Canceled);
        assert!(canceled.finished_at.is_some());

        assert!(cancel_running_run(&store, "browser-1").await.unwrap().is_none());

        let next = ensure_running_run(&store, "browser-1", "again", None).await.unwrap();
        assert_ne!(next.run_id, run.run_id);
    }

    /// Store double reproducing the narrow race: insert always reports a
    /// conflict, but the running run can no longer be found.
    struct VanishingStore;

    #[async_trait]
    impl RunStore for VanishingStore {
        async fn insert_running(&self, run: &Run) -> Result<(), StoreError> {
            Err(StoreError::RunningExists {
                session_key: run.session_key.clone(),
            })
        }

        async fn find_running(&self, _session_key: &str) -> Result<Option<Run>, StoreError> {
            Ok(None)
        }

        async fn get(&self, _run_id: &RunId) -> Result<Option<Run>, StoreError> {
            Ok(None)
        }

        async fn list(&self, _limit: usize) -> Result<Vec<Run>, StoreError> {
            Ok(Vec::new())
        }

        async fn finish_if_running(
            &self,
            _run_id: &RunId,
            _status: RunStatus,
            _finished_at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn delete(&self, _run_id: &RunId) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn vanished_run_after_conflict_is_fatal() {
        let error = ensure_running_run(&VanishingStore, "browser-1", "prompt", None)
            .await
            .unwrap_err();
        assert!(matches!(error, CaptureError::ArbitrationRace { .. }));
    }
}
