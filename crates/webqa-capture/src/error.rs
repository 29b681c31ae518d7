use thiserror::Error;
use webqa_store::StoreError;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The insert hit the running-run constraint but the follow-up
    /// lookup found nothing. Under correct store behavior this cannot
    /// happen, so it is surfaced rather than retried or swallowed.
    #[error("running run for session {session_key} vanished during arbitration")]
    ArbitrationRace { session_key: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
