//! The gateway path emits newline-delimited `data: <json>` frames. This module folds the
//! "unwrap stream_event / message / delta" cases into a single tagged-union switch, per the
//! design notes: the parser's state is a "current text node" id, a last-seen message id, and
//! nothing else.

use serde_json::Value;
use tayfa_types::StreamEvent;
use tracing::debug;

#[derive(Default)]
pub struct StreamParser {
    current_message_id: Option<String>,
    current_text: String,
    last_seen_session_id: Option<String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent `session_id` seen on any frame, including ones the parser otherwise
    /// discards. Used to recover a resumable session after a graceful timeout cuts the stream
    /// before a terminal `result` frame arrives.
    pub fn recovered_session_id(&self) -> Option<String> {
        self.last_seen_session_id.clone()
    }

    /// Ingests one raw wire frame, returning zero or more events to publish. A delta frame
    /// usually buffers silently (returns nothing); a new message id or `content_block_stop`
    /// flushes the buffered text as a single `Assistant` event first.
    pub fn ingest(&mut self, raw: Value) -> Vec<StreamEvent> {
        let raw = unwrap_stream_event_wrapper(raw);
        let frame_type = raw.get("type").and_then(Value::as_str).unwrap_or("");
        let message_id = raw
            .get("id")
            .or_else(|| raw.get("message_id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(session_id) = raw.get("session_id").and_then(Value::as_str) {
            self.last_seen_session_id = Some(session_id.to_string());
        }

        let mut events = Vec::new();

        if let Some(id) = &message_id {
            if self
                .current_message_id
                .as_ref()
                .is_some_and(|current| current != id)
            {
                events.extend(self.flush());
            }
            self.current_message_id = Some(id.clone());
        }

        match frame_type {
            "assistant" => {
                if let Some(text) = raw.get("text").and_then(Value::as_str) {
                    self.current_text.push_str(text);
                }
                if let Some(delta) = raw.get("delta").and_then(|d| d.get("text")).and_then(Value::as_str) {
                    self.current_text.push_str(delta);
                }
            }
            "content_block_start" => {
                events.push(StreamEvent::ContentBlockStart {
                    index: raw.get("index").and_then(Value::as_u64).unwrap_or(0) as u32,
                });
            }
            "content_block_delta" => {
                let text = raw
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                    .or_else(|| raw.get("text").and_then(Value::as_str));
                if let Some(text) = text {
                    self.current_text.push_str(text);
                }
            }
            "content_block_stop" => {
                events.extend(self.flush());
                events.push(StreamEvent::ContentBlockStop {
                    index: raw.get("index").and_then(Value::as_u64).unwrap_or(0) as u32,
                });
            }
            "tool_use" => {
                events.push(StreamEvent::ToolUse {
                    name: raw
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input: raw.get("input").cloned().unwrap_or(Value::Null),
                });
            }
            "input_json_delta" => {
                // Accumulating partial tool-call JSON is an internal detail the runner does
                // not need to surface incrementally; the final `tool_use` frame carries the
                // fully assembled `input`.
            }
            "tool_result" => {
                events.push(StreamEvent::ToolResult {
                    output: raw.get("output").cloned().unwrap_or(Value::Null),
                });
            }
            "message" => {
                events.push(StreamEvent::Message {
                    content: raw.get("content").cloned().unwrap_or(Value::Null),
                });
            }
            "result" => {
                events.extend(self.flush());
                events.push(StreamEvent::Result {
                    result: raw
                        .get("result")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    cost_usd: raw.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0),
                    num_turns: raw.get("num_turns").and_then(Value::as_u64).unwrap_or(0) as u32,
                    session_id: raw
                        .get("session_id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
            "system" | "user" | "message_start" | "message_delta" | "message_stop" => {
                // Internal frames, intentionally ignored.
            }
            "stream_end" => {
                events.extend(self.flush());
                events.push(StreamEvent::stream_end());
            }
            other => {
                debug!(frame_type = other, "dropping unrecognized stream frame");
            }
        }

        events
    }

    /// Flushes any buffered assistant text into an `Assistant` event. Call once at stream end
    /// to avoid losing a partial buffer that was never explicitly closed.
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        if self.current_text.is_empty() {
            return Vec::new();
        }
        let text = std::mem::take(&mut self.current_text);
        vec![StreamEvent::Assistant { text: Some(text) }]
    }
}

fn unwrap_stream_event_wrapper(raw: Value) -> Value {
    if raw.get("type").and_then(Value::as_str) == Some("stream_event") {
        if let Some(inner) = raw.get("event").cloned() {
            return unwrap_stream_event_wrapper(inner);
        }
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deltas_accumulate_into_one_assistant_event() {
        let mut parser = StreamParser::new();
        assert!(parser
            .ingest(json!({"type": "content_block_delta", "id": "m1", "delta": {"text": "Hel"}}))
            .is_empty());
        assert!(parser
            .ingest(json!({"type": "content_block_delta", "id": "m1", "delta": {"text": "lo"}}))
            .is_empty());
        let events = parser.ingest(json!({"type": "content_block_stop", "id": "m1", "index": 0}));
        assert!(matches!(
            &events[0],
            StreamEvent::Assistant { text: Some(t) } if t == "Hello"
        ));
    }

    #[test]
    fn new_message_id_flushes_prior_buffer() {
        let mut parser = StreamParser::new();
        parser.ingest(json!({"type": "content_block_delta", "id": "m1", "delta": {"text": "a"}}));
        let events = parser.ingest(json!({"type": "content_block_delta", "id": "m2", "delta": {"text": "b"}}));
        assert!(matches!(&events[0], StreamEvent::Assistant{text: Some(t)} if t == "a"));
    }

    #[test]
    fn stream_event_wrapper_is_unwrapped() {
        let mut parser = StreamParser::new();
        let events = parser.ingest(json!({
            "type": "stream_event",
            "event": {"type": "tool_use", "name": "read_file", "input": {"path": "x"}}
        }));
        assert!(matches!(&events[0], StreamEvent::ToolUse{name, ..} if name == "read_file"));
    }

    #[test]
    fn unknown_frame_types_are_dropped_not_surfaced() {
        let mut parser = StreamParser::new();
        let events = parser.ingest(json!({"type": "totally_unknown"}));
        assert!(events.is_empty());
    }

    #[test]
    fn result_frame_flushes_pending_text_first() {
        let mut parser = StreamParser::new();
        parser.ingest(json!({"type": "content_block_delta", "id": "m1", "delta": {"text": "done"}}));
        let events = parser.ingest(json!({"type": "result", "result": "ok", "cost_usd": 0.01, "num_turns": 1}));
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::Assistant{..}));
        assert!(matches!(&events[1], StreamEvent::Result{..}));
    }
}
