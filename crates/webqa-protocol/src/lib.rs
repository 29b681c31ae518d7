//! Shared protocol types for the web QA console.
//!
//! Everything in this crate is pure data plus deterministic functions over
//! it: the run/event model, the raw-stream event normalizer, and the
//! transcript reconstructor. Persistence and streaming live elsewhere
//! (`webqa-store`, `webqa-capture`).

pub mod event;
pub mod ids;
pub mod normalize;
pub mod run;
pub mod transcript;

pub use event::{EventFamily, EventRecord, EventRole};
pub use ids::{EventId, RunId, TestId};
pub use normalize::{NormalizedEvent, normalize};
pub use run::{METADATA_PROMPT, METADATA_SESSION_KEY, Run, RunStatus};
pub use transcript::{
    MessageRole, ToolCallState, TranscriptMessage, TranscriptPart, reconstruct,
};
