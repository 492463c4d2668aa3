use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorType;

/// A running task's in-memory bookkeeping record. Never persisted; lost across restarts.
#[derive(Debug, Clone, Serialize)]
pub struct RunningTask {
    pub task_id: String,
    pub agent: String,
    pub role: String,
    pub runtime: String,
    pub started_at_epoch_seconds: i64,
}

impl RunningTask {
    pub fn elapsed_seconds(&self, now_epoch_seconds: i64) -> i64 {
        (now_epoch_seconds - self.started_at_epoch_seconds).max(0)
    }
}

/// The tagged union of events the streaming parser recognizes from the gateway path, folded
/// into one switch per the design notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Assistant { text: Option<String> },
    ContentBlockStart { index: u32 },
    ContentBlockStop { index: u32 },
    ToolUse { name: String, input: Value },
    ToolResult { output: Value },
    Message { content: Value },
    Result {
        result: String,
        #[serde(default)]
        cost_usd: f64,
        #[serde(default)]
        num_turns: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    System,
    User,
    MessageStart,
    MessageDelta,
    MessageStop,
    StreamEnd,
}

impl StreamEvent {
    pub fn stream_end() -> Self {
        StreamEvent::StreamEnd
    }
}

/// The outcome of one agent invocation, returned by the agent runner to the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_result: Option<String>,
    pub result: String,
    pub cost_usd: f64,
    pub duration_sec: f64,
    pub num_turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// The body returned by `POST /api/tasks-list/{id}/trigger`.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerResult {
    pub task_id: String,
    pub agent: String,
    pub role: String,
    pub runtime: String,
    pub success: bool,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}
