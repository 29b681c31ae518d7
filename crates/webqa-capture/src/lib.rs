//! Live agent-stream capture.
//!
//! Sits between the upstream browser agent and the client: the arbiter
//! establishes (or reuses) the single running run for a browser session,
//! and the logger taps the agent's server-sent-event byte stream,
//! persisting every normalized event while forwarding the original bytes
//! untouched. Replay is handled offline by
//! `webqa_protocol::transcript::reconstruct` over the persisted log.

mod arbiter;
mod error;
mod logger;
mod sse;

pub use arbiter::{cancel_running_run, ensure_running_run};
pub use error::CaptureError;
pub use logger::wrap;
pub use sse::{DATA_LINE_MARKER, DONE_SENTINEL, SseLineDecoder};
