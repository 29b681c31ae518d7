//! Persisted stream-event types.
//!
//! The agent protocol's fine-grained event vocabulary is open-ended and
//! owned by an external, evolving SDK, so events keep their raw payload
//! as an opaque `serde_json::Value` and carry only the derived columns
//! (family, role, stream id) as typed fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventId, RunId};
use crate::normalize::NormalizedEvent;

/// Coarse classification of an event's fine-grained type, used for
/// grouping and reconstruction dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventFamily {
    Lifecycle,
    Text,
    Reasoning,
    ToolInput,
    ToolOutput,
    Data,
    Error,
}

/// Speaker attributed to a stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One normalized, persisted fragment of the raw agent stream.
///
/// Events for a run, read in sequence order, form the complete record of
/// everything the agent emitted for that run. The sequence number is the
/// only trustworthy ordering key; `event_id` and `created_at` are
/// identity and bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub run_id: RunId,
    /// Unique per run, strictly increasing in emission order. Assigned
    /// by the capture layer's in-memory counter.
    pub sequence: u64,
    pub role: EventRole,
    pub family: EventFamily,
    /// Fine-grained type string, e.g. `"text-delta"` or `"finish"`.
    pub event_type: String,
    /// The raw normalized event, verbatim.
    pub payload: Value,
    /// Correlates multi-fragment logical units (a streamed text block,
    /// or a tool call's input and output). Absent when the source event
    /// carried no natural correlating id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Build a persistable record from a normalized event, stamping the
    /// current time and a fresh identity.
    pub fn from_normalized(run_id: RunId, sequence: u64, normalized: NormalizedEvent) -> Self {
        Self {
            event_id: EventId::default(),
            run_id,
            sequence,
            role: normalized.role,
            family: normalized.family,
            event_type: normalized.event_type,
            payload: normalized.payload,
            stream_id: normalized.stream_id,
            created_at: Utc::now(),
        }
    }
}
