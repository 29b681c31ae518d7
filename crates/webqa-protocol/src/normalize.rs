//! Normalization of raw agent-stream events.
//!
//! Maps one decoded JSON event from the agent's UI message stream into a
//! canonical record: family and role derived from the type string,
//! stream id pulled from the first recognized correlation field, payload
//! kept verbatim. Pure and total over JSON objects with a string
//! `"type"`; anything else is not recognizable and yields `None`.

use serde_json::Value;

use crate::event::{EventFamily, EventRole};

/// Correlation-id fields, checked in priority order; the first
/// string-typed match wins.
const STREAM_ID_FIELDS: [&str; 3] = ["id", "toolCallId", "messageId"];

/// Canonical view of one raw stream event.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub event_type: String,
    pub family: EventFamily,
    pub role: EventRole,
    pub stream_id: Option<String>,
    /// The source event, verbatim.
    pub payload: Value,
}

/// Normalize one raw decoded event, or `None` if the input is not a
/// recognizable event object.
pub fn normalize(raw: &Value) -> Option<NormalizedEvent> {
    let object = raw.as_object()?;
    let event_type = object.get("type")?.as_str()?.to_owned();

    let family = classify_family(&event_type);
    let role = resolve_role(object.get("role").and_then(Value::as_str), &event_type);
    let stream_id = STREAM_ID_FIELDS
        .iter()
        .find_map(|field| object.get(*field).and_then(Value::as_str))
        .map(ToOwned::to_owned);

    Some(NormalizedEvent {
        event_type,
        family,
        role,
        stream_id,
        payload: raw.clone(),
    })
}

fn classify_family(event_type: &str) -> EventFamily {
    match event_type {
        "start" | "finish" => EventFamily::Lifecycle,
        t if t.starts_with("text-") => EventFamily::Text,
        t if t.starts_with("reasoning-") => EventFamily::Reasoning,
        t if t.starts_with("tool-input-") => EventFamily::ToolInput,
        t if t.starts_with("tool-output-") => EventFamily::ToolOutput,
        t if t.starts_with("data-") => EventFamily::Data,
        t if t.contains("error") => EventFamily::Error,
        _ => EventFamily::Data,
    }
}

fn resolve_role(explicit: Option<&str>, event_type: &str) -> EventRole {
    if let Some(role) = explicit {
        match role.to_ascii_lowercase().as_str() {
            "system" => return EventRole::System,
            "user" => return EventRole::User,
            "assistant" => return EventRole::Assistant,
            "tool" => return EventRole::Tool,
            _ => {}
        }
    }
    // The stream is agent-originated by construction.
    if event_type.starts_with("tool-") {
        EventRole::Tool
    } else {
        EventRole::Assistant
    }
}
