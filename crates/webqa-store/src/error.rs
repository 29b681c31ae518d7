use thiserror::Error;
use webqa_protocol::RunId;

/// Store failures. `RunningExists` and `SequenceConflict` are the two
/// constraint violations callers match on; everything else propagates.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a running run already exists for session key {session_key}")]
    RunningExists { session_key: String },

    #[error("sequence conflict for run {run_id}: {sequence} is not past {latest}")]
    SequenceConflict {
        run_id: RunId,
        sequence: u64,
        latest: u64,
    },

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("store io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}
