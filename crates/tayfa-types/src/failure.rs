use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorType;

/// The cap on persisted `AgentFailure` records per project (oldest dropped first on append).
/// The source material left this unbounded; see DESIGN.md for the rationale.
pub const MAX_AGENT_FAILURES: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFailure {
    pub id: String,
    pub task_id: String,
    pub agent: String,
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
}

impl AgentFailure {
    pub fn new(
        task_id: impl Into<String>,
        agent: impl Into<String>,
        error_type: ErrorType,
        message: impl Into<String>,
        traceback: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            agent: agent.into(),
            error_type,
            message: message.into(),
            traceback,
            timestamp: Utc::now(),
            resolved: false,
        }
    }
}

/// Append `failure` to `log`, enforcing `MAX_AGENT_FAILURES` by dropping the oldest entries.
pub fn append_failure_bounded(log: &mut Vec<AgentFailure>, failure: AgentFailure) {
    log.push(failure);
    if log.len() > MAX_AGENT_FAILURES {
        let overflow = log.len() - MAX_AGENT_FAILURES;
        log.drain(0..overflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_log_drops_oldest() {
        let mut log = Vec::new();
        for i in 0..(MAX_AGENT_FAILURES + 10) {
            append_failure_bounded(
                &mut log,
                AgentFailure::new(format!("T{i}"), "dev", ErrorType::Unknown, "boom", None),
            );
        }
        assert_eq!(log.len(), MAX_AGENT_FAILURES);
        assert_eq!(log.first().unwrap().task_id, "T10");
    }
}
