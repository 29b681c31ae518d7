//! Transcript reconstruction from a run's persisted event log.
//!
//! A single forward pass over the log rebuilds the conversation: text and
//! reasoning fragments are re-accumulated into whole blocks, tool calls
//! are paired with their outputs, and messages are segmented on speaker
//! changes. The fold is deterministic and never fails: the log is a
//! best-effort capture of a live stream and may be truncated mid-fragment,
//! so orphan fragments are dropped rather than surfaced as errors.

use std::collections::HashMap;

use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};
use serde_json::Value;

use crate::event::{EventFamily, EventRecord, EventRole};
use crate::ids::EventId;

/// Speaker of a reconstructed message. Tool and system activity is
/// folded into the assistant's turn rather than given its own speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Progress of a reconstructed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallState {
    InputAvailable,
    OutputAvailable,
}

/// One block of a reconstructed message.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    Tool {
        tool_name: String,
        state: ToolCallState,
        input: Option<Value>,
        output: Option<Value>,
    },
}

impl TranscriptPart {
    /// Wire-level part type: `text`, `reasoning`, or `tool-<name>`.
    pub fn part_type(&self) -> String {
        match self {
            TranscriptPart::Text { .. } => "text".to_owned(),
            TranscriptPart::Reasoning { .. } => "reasoning".to_owned(),
            TranscriptPart::Tool { tool_name, .. } => format!("tool-{tool_name}"),
        }
    }
}

// Tool parts carry their tool name inside the "type" tag, which serde's
// static tagging cannot express.
impl Serialize for TranscriptPart {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", &self.part_type())?;
        match self {
            TranscriptPart::Text { text } | TranscriptPart::Reasoning { text } => {
                map.serialize_entry("text", text)?;
            }
            TranscriptPart::Tool {
                state,
                input,
                output,
                ..
            } => {
                map.serialize_entry("state", state)?;
                if let Some(input) = input {
                    map.serialize_entry("input", input)?;
                }
                if let Some(output) = output {
                    map.serialize_entry("output", output)?;
                }
            }
        }
        map.end()
    }
}

/// One reconstructed message, parts in display order.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptMessage {
    pub id: String,
    pub role: MessageRole,
    pub parts: Vec<TranscriptPart>,
}

/// Rebuild the conversation for one run from its full event log.
///
/// Events are sorted by sequence number first; sequence is the only
/// correct order, storage ids and timestamps are not. Running this twice
/// over the same log yields identical output.
pub fn reconstruct(mut events: Vec<EventRecord>) -> Vec<TranscriptMessage> {
    events.sort_by_key(|event| event.sequence);

    let mut fold = Fold::default();
    for event in &events {
        fold.observe(event);
    }
    fold.finish()
}

struct PartSlot {
    /// Sequence number the part is ordered by within its message.
    /// Parts without one sort last, stably.
    order: Option<u64>,
    part: TranscriptPart,
}

struct MessageBuilder {
    id: String,
    role: MessageRole,
    slots: Vec<PartSlot>,
    closed: bool,
}

impl MessageBuilder {
    /// Fix part positions. Later tool-output sightings may still mutate
    /// part contents in place, but never move a part once the message
    /// has closed.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.slots
            .sort_by_key(|slot| (slot.order.is_none(), slot.order.unwrap_or(u64::MAX)));
        self.closed = true;
    }
}

struct Accumulator {
    family: EventFamily,
    text: String,
    first_sequence: u64,
}

/// Location of a tool part: (message index, slot index).
struct ToolSlot {
    message: usize,
    slot: usize,
}

#[derive(Default)]
struct Fold {
    messages: Vec<MessageBuilder>,
    current: Option<usize>,
    accumulators: HashMap<String, Accumulator>,
    tool_calls: HashMap<String, ToolSlot>,
}

impl Fold {
    fn observe(&mut self, event: &EventRecord) {
        let index = self.ensure_message(event);
        match event.family {
            EventFamily::Text | EventFamily::Reasoning => {
                self.observe_streaming(event, index);
            }
            EventFamily::ToolInput => self.observe_tool_input(event, index),
            EventFamily::ToolOutput => self.observe_tool_output(event, index),
            EventFamily::Lifecycle | EventFamily::Data | EventFamily::Error => {}
        }
    }

    /// Close the current message and open a new one whenever the mapped
    /// role changes (or no message exists yet). Returns the index of the
    /// message this event belongs to.
    fn ensure_message(&mut self, event: &EventRecord) -> usize {
        let role = map_role(event.role);
        if let Some(index) = self.current
            && self.messages[index].role == role
        {
            return index;
        }
        if let Some(index) = self.current {
            self.messages[index].close();
        }

        let id = event
            .stream_id
            .clone()
            .unwrap_or_else(|| format!("msg-{}", event.event_id));
        self.messages.push(MessageBuilder {
            id,
            role,
            slots: Vec::new(),
            closed: false,
        });
        let index = self.messages.len() - 1;
        self.current = Some(index);
        index
    }

    fn observe_streaming(&mut self, event: &EventRecord, message: usize) {
        let key = event
            .stream_id
            .clone()
            .unwrap_or_else(|| synthetic_stream_key(event.family, &event.event_id));

        if event.event_type.ends_with("-start") {
            let seed = payload_str(&event.payload, "text").unwrap_or_default();
            self.accumulators.insert(
                key,
                Accumulator {
                    family: event.family,
                    text: seed.to_owned(),
                    first_sequence: event.sequence,
                },
            );
        } else if event.event_type.ends_with("-delta") {
            // A delta with no open accumulator is an orphan; drop it.
            if let Some(accumulator) = self.accumulators.get_mut(&key) {
                let delta = payload_str(&event.payload, "delta")
                    .or_else(|| payload_str(&event.payload, "text"))
                    .unwrap_or_default();
                accumulator.text.push_str(delta);
            }
        } else if event.event_type.ends_with("-end")
            && let Some(accumulator) = self.accumulators.remove(&key)
        {
            let part = match accumulator.family {
                EventFamily::Reasoning => TranscriptPart::Reasoning {
                    text: accumulator.text,
                },
                _ => TranscriptPart::Text {
                    text: accumulator.text,
                },
            };
            self.messages[message].slots.push(PartSlot {
                order: Some(accumulator.first_sequence),
                part,
            });
        }
    }

    fn observe_tool_input(&mut self, event: &EventRecord, message: usize) {
        let key = tool_correlation_key(event);
        match self.tool_calls.get(&key) {
            Some(location) => {
                let slot = &mut self.messages[location.message].slots[location.slot];
                if let TranscriptPart::Tool { input, .. } = &mut slot.part {
                    *input = Some(event.payload.clone());
                }
                if slot.order.is_none_or(|order| event.sequence < order) {
                    slot.order = Some(event.sequence);
                }
            }
            None => {
                let part = TranscriptPart::Tool {
                    tool_name: tool_name(&event.payload),
                    state: ToolCallState::InputAvailable,
                    input: Some(event.payload.clone()),
                    output: None,
                };
                self.append_tool_part(key, message, event.sequence, part);
            }
        }
    }

    fn observe_tool_output(&mut self, event: &EventRecord, message: usize) {
        let key = tool_correlation_key(event);
        match self.tool_calls.get(&key) {
            Some(location) => {
                let slot = &mut self.messages[location.message].slots[location.slot];
                if let TranscriptPart::Tool { state, output, .. } = &mut slot.part {
                    *output = Some(event.payload.clone());
                    *state = ToolCallState::OutputAvailable;
                }
            }
            None => {
                // Output with no recorded input: keep the fragment as a
                // fresh partial entry.
                let part = TranscriptPart::Tool {
                    tool_name: tool_name(&event.payload),
                    state: ToolCallState::OutputAvailable,
                    input: None,
                    output: Some(event.payload.clone()),
                };
                self.append_tool_part(key, message, event.sequence, part);
            }
        }
    }

    fn append_tool_part(&mut self, key: String, message: usize, sequence: u64, part: TranscriptPart) {
        let slots = &mut self.messages[message].slots;
        slots.push(PartSlot {
            order: Some(sequence),
            part,
        });
        self.tool_calls.insert(
            key,
            ToolSlot {
                message,
                slot: slots.len() - 1,
            },
        );
    }

    fn finish(mut self) -> Vec<TranscriptMessage> {
        if let Some(index) = self.current {
            self.messages[index].close();
        }
        self.messages
            .into_iter()
            .filter(|builder| !builder.slots.is_empty())
            .map(|builder| TranscriptMessage {
                id: builder.id,
                role: builder.role,
                parts: builder.slots.into_iter().map(|slot| slot.part).collect(),
            })
            .collect()
    }
}

fn map_role(role: EventRole) -> MessageRole {
    match role {
        EventRole::User => MessageRole::User,
        EventRole::Assistant | EventRole::Tool | EventRole::System => MessageRole::Assistant,
    }
}

/// Fallback key for streaming fragments that carry no natural id. Unique
/// per event, so it never correlates with anything else; a delta without
/// a natural id and without a matching start cannot accumulate.
fn synthetic_stream_key(family: EventFamily, event_id: &EventId) -> String {
    let scope = match family {
        EventFamily::Reasoning => "reasoning",
        _ => "text",
    };
    format!("{scope}-{event_id}")
}

fn tool_correlation_key(event: &EventRecord) -> String {
    payload_str(&event.payload, "toolCallId")
        .map(ToOwned::to_owned)
        .or_else(|| event.stream_id.clone())
        .unwrap_or_else(|| format!("tool-{}", event.event_id))
}

fn tool_name(payload: &Value) -> String {
    payload_str(payload, "toolName").unwrap_or("unknown").to_owned()
}

fn payload_str<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload.get(field).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ids::RunId;
    use crate::normalize::normalize;

    fn event(sequence: u64, raw: serde_json::Value) -> EventRecord {
        let normalized = normalize(&raw).expect("recognizable test event");
        EventRecord::from_normalized(RunId::from_string("R1"), sequence, normalized)
    }

    #[test]
    fn text_stream_concatenates_in_sequence_order() {
        let log = vec![
            event(0, json!({"type": "text-start", "id": "s1", "text": "Hello"})),
            event(1, json!({"type": "text-delta", "id": "s1", "delta": " world"})),
            event(2, json!({"type": "text-delta", "id": "s1", "text": "!"})),
            event(3, json!({"type": "text-end", "id": "s1"})),
        ];

        let messages = reconstruct(log);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Assistant);
        assert_eq!(messages[0].id, "s1");
        assert_eq!(
            messages[0].parts,
            vec![TranscriptPart::Text {
                text: "Hello world!".to_owned()
            }]
        );
    }

    #[test]
    fn reconstruction_sorts_unsorted_input_itself() {
        let mut log = vec![
            event(0, json!({"type": "text-start", "id": "s1"})),
            event(1, json!({"type": "text-delta", "id": "s1", "delta": "a"})),
            event(2, json!({"type": "text-delta", "id": "s1", "delta": "b"})),
            event(3, json!({"type": "text-end", "id": "s1"})),
        ];
        log.reverse();

        let messages = reconstruct(log);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].parts,
            vec![TranscriptPart::Text {
                text: "ab".to_owned()
            }]
        );
    }

    #[test]
    fn reconstruction_is_deterministic() {
        let log = vec![
            event(0, json!({"type": "text-start", "id": "s1", "text": "x"})),
            event(1, json!({"type": "tool-input-available", "toolCallId": "t1", "toolName": "click"})),
            event(2, json!({"type": "text-end", "id": "s1"})),
        ];

        let first = serde_json::to_string(&reconstruct(log.clone())).unwrap();
        let second = serde_json::to_string(&reconstruct(log)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn tool_call_pairs_input_with_output_at_input_position() {
        let log = vec![
            event(0, json!({
                "type": "tool-input-available",
                "toolCallId": "t1",
                "toolName": "search",
                "input": {"query": "pricing page"}
            })),
            event(1, json!({"type": "text-start", "id": "s1", "text": "Looking"})),
            event(2, json!({"type": "text-end", "id": "s1"})),
            event(3, json!({
                "type": "tool-output-available",
                "toolCallId": "t1",
                "output": {"matches": 3}
            })),
        ];

        let messages = reconstruct(log);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].parts.len(), 2);

        // Ordered by the input's sequence number, not the output's.
        let TranscriptPart::Tool {
            tool_name,
            state,
            input,
            output,
        } = &messages[0].parts[0]
        else {
            panic!("expected tool part first, got {:?}", messages[0].parts);
        };
        assert_eq!(tool_name, "search");
        assert_eq!(*state, ToolCallState::OutputAvailable);
        assert!(input.is_some());
        assert_eq!(
            output.as_ref().and_then(|o| o.get("output")),
            Some(&json!({"matches": 3}))
        );
        assert_eq!(messages[0].parts[0].part_type(), "tool-search");
    }

    #[test]
    fn tool_output_before_input_keeps_partial_entry() {
        let log = vec![
            event(0, json!({
                "type": "tool-output-available",
                "toolCallId": "t9",
                "toolName": "extract",
                "output": {"rows": 2}
            })),
            event(1, json!({
                "type": "tool-input-available",
                "toolCallId": "t9",
                "toolName": "extract",
                "input": {"selector": "table"}
            })),
        ];

        let messages = reconstruct(log);
        assert_eq!(messages.len(), 1);
        let TranscriptPart::Tool { state, input, output, .. } = &messages[0].parts[0] else {
            panic!("expected tool part");
        };
        // The late input fills in; the already-available output state stays.
        assert_eq!(*state, ToolCallState::OutputAvailable);
        assert!(input.is_some());
        assert!(output.is_some());
    }

    #[test]
    fn role_switch_segments_messages() {
        let log = vec![
            event(0, json!({"type": "text-start", "id": "u1", "role": "user", "text": "run the"})),
            event(1, json!({"type": "text-delta", "id": "u1", "role": "user", "delta": " checkout test"})),
            event(2, json!({"type": "text-end", "id": "u1", "role": "user"})),
            event(3, json!({"type": "text-start", "id": "a1", "text": "Starting"})),
            event(4, json!({"type": "text-end", "id": "a1"})),
            event(5, json!({"type": "text-start", "id": "u2", "role": "user", "text": "stop"})),
            event(6, json!({"type": "text-end", "id": "u2", "role": "user"})),
        ];

        let messages = reconstruct(log);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[2].role, MessageRole::User);
        assert_eq!(
            messages[0].parts,
            vec![TranscriptPart::Text {
                text: "run the checkout test".to_owned()
            }]
        );
        assert_eq!(
            messages[2].parts,
            vec![TranscriptPart::Text {
                text: "stop".to_owned()
            }]
        );
    }

    #[test]
    fn empty_segments_are_suppressed() {
        let log = vec![
            event(0, json!({"type": "data-note", "role": "user", "note": "noop"})),
            event(1, json!({"type": "text-start", "id": "a1", "text": "hi"})),
            event(2, json!({"type": "text-end", "id": "a1"})),
            event(3, json!({"type": "finish"})),
        ];

        let messages = reconstruct(log);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Assistant);
    }

    #[test]
    fn orphan_delta_is_dropped() {
        let log = vec![
            event(0, json!({"type": "text-delta", "id": "ghost", "delta": "lost"})),
            event(1, json!({"type": "start"})),
        ];
        assert!(reconstruct(log).is_empty());
    }

    #[test]
    fn unterminated_stream_emits_no_part() {
        let log = vec![
            event(0, json!({"type": "text-start", "id": "s1", "text": "partial"})),
            event(1, json!({"type": "text-delta", "id": "s1", "delta": " capture"})),
        ];
        assert!(reconstruct(log).is_empty());
    }

    #[test]
    fn reasoning_stream_becomes_reasoning_part() {
        let log = vec![
            event(0, json!({"type": "reasoning-start", "id": "r1"})),
            event(1, json!({"type": "reasoning-delta", "id": "r1", "delta": "because"})),
            event(2, json!({"type": "reasoning-end", "id": "r1"})),
        ];

        let messages = reconstruct(log);
        assert_eq!(
            messages[0].parts,
            vec![TranscriptPart::Reasoning {
                text: "because".to_owned()
            }]
        );
        assert_eq!(messages[0].parts[0].part_type(), "reasoning");
    }

    #[test]
    fn message_id_falls_back_to_synthetic() {
        let log = vec![
            event(0, json!({"type": "text-start"})),
            event(1, json!({"type": "text-start", "id": "s2", "text": "kept"})),
            event(2, json!({"type": "text-end", "id": "s2"})),
        ];

        let messages = reconstruct(log);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].id.starts_with("msg-"));
    }

    #[test]
    fn tool_part_serializes_with_dynamic_type_tag() {
        let log = vec![event(0, json!({
            "type": "tool-input-available",
            "toolCallId": "t1",
            "toolName": "navigate",
            "input": {"url": "https://example.test"}
        }))];

        let messages = reconstruct(log);
        let json = serde_json::to_value(&messages[0].parts[0]).unwrap();
        assert_eq!(json["type"], "tool-navigate");
        assert_eq!(json["state"], "input-available");
        assert_eq!(json["input"]["toolName"], "navigate");
    }

    #[test]
    fn interleaved_tool_calls_stay_separate() {
        let log = vec![
            event(0, json!({"type": "tool-input-available", "toolCallId": "t1", "toolName": "click"})),
            event(1, json!({"type": "tool-input-available", "toolCallId": "t2", "toolName": "extract"})),
            event(2, json!({"type": "tool-output-available", "toolCallId": "t2", "output": "rows"})),
            event(3, json!({"type": "tool-output-available", "toolCallId": "t1", "output": "done"})),
        ];

        let messages = reconstruct(log);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].parts.len(), 2);
        assert_eq!(messages[0].parts[0].part_type(), "tool-click");
        assert_eq!(messages[0].parts[1].part_type(), "tool-extract");
        for part in &messages[0].parts {
            let TranscriptPart::Tool { state, .. } = part else {
                panic!("expected tool part");
            };
            assert_eq!(*state, ToolCallState::OutputAvailable);
        }
    }
}
