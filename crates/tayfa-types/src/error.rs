use serde::{Deserialize, Serialize};

/// The closed error taxonomy from the error handling design: every component boundary in the
/// engine returns one of these, and the HTTP layer maps each variant to exactly one status
/// code (see `http_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    NotFound,
    InvalidStatus,
    Blocked,
    NoExecutor,
    AlreadyRunning,
    Timeout,
    Overloaded,
    RateLimit,
    Network,
    Authentication,
    Budget,
    Unknown,
    LockTimeout,
}

impl ErrorType {
    /// Single source of truth for which error types the scheduler may retry. Also used by
    /// the HTTP layer so the retryable set never drifts between the two call sites.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorType::Timeout | ErrorType::Overloaded | ErrorType::RateLimit | ErrorType::Network
        )
    }

    pub fn http_status(self) -> u16 {
        match self {
            ErrorType::NotFound => 404,
            ErrorType::InvalidStatus
            | ErrorType::Blocked
            | ErrorType::NoExecutor
            | ErrorType::AlreadyRunning => 409,
            ErrorType::Timeout => 504,
            ErrorType::Overloaded => 503,
            ErrorType::RateLimit => 503,
            ErrorType::Network => 502,
            ErrorType::Authentication => 401,
            ErrorType::Budget => 402,
            ErrorType::Unknown => 500,
            ErrorType::LockTimeout => 503,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::NotFound => "not_found",
            ErrorType::InvalidStatus => "invalid_status",
            ErrorType::Blocked => "blocked",
            ErrorType::NoExecutor => "no_executor",
            ErrorType::AlreadyRunning => "already_running",
            ErrorType::Timeout => "timeout",
            ErrorType::Overloaded => "overloaded",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::Network => "network",
            ErrorType::Authentication => "authentication",
            ErrorType::Budget => "budget",
            ErrorType::Unknown => "unknown",
            ErrorType::LockTimeout => "lock_timeout",
        }
    }

    /// Classifies raw subprocess/HTTP failure text into an `ErrorType`, per the agent
    /// runner's error classification rules.
    pub fn classify(stderr_or_message: &str, http_status: Option<u16>) -> Self {
        let lower = stderr_or_message.to_ascii_lowercase();
        if http_status == Some(529) || lower.contains("overloaded") || lower.contains("due to load") {
            return ErrorType::Overloaded;
        }
        if lower.contains("rate limit") || lower.contains("rate_limit") {
            return ErrorType::RateLimit;
        }
        if http_status == Some(401) || lower.contains("unauthorized") || lower.contains("expired token")
        {
            return ErrorType::Authentication;
        }
        if lower.contains("connection refused")
            || lower.contains("dns")
            || lower.contains("transport error")
            || lower.contains("network")
        {
            return ErrorType::Network;
        }
        if lower.contains("budget") || lower.contains("max_budget") {
            return ErrorType::Budget;
        }
        ErrorType::Unknown
    }
}

/// Engine-internal error type. Every fallible function at a component boundary
/// (store/state-model/runner/scheduler) returns `Result<T, EngineError>`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("task {0} is not in a triggerable status")]
    InvalidStatus(String),
    #[error("task {0} has unsatisfied dependencies")]
    Blocked(String),
    #[error("no executor resolvable for task {0}")]
    NoExecutor(String),
    #[error("task {0} already has a run in flight")]
    AlreadyRunning(String),
    #[error("agent invocation timed out")]
    Timeout,
    #[error("upstream overloaded")]
    Overloaded,
    #[error("rate limited")]
    RateLimit,
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication error: {0}")]
    Authentication(String),
    #[error("budget exceeded: {0}")]
    Budget(String),
    #[error("unknown error: {0}")]
    Unknown(String),
    #[error("could not acquire lock on {0}")]
    LockTimeout(String),
}

impl EngineError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            EngineError::NotFound(_) => ErrorType::NotFound,
            EngineError::InvalidStatus(_) => ErrorType::InvalidStatus,
            EngineError::Blocked(_) => ErrorType::Blocked,
            EngineError::NoExecutor(_) => ErrorType::NoExecutor,
            EngineError::AlreadyRunning(_) => ErrorType::AlreadyRunning,
            EngineError::Timeout => ErrorType::Timeout,
            EngineError::Overloaded => ErrorType::Overloaded,
            EngineError::RateLimit => ErrorType::RateLimit,
            EngineError::Network(_) => ErrorType::Network,
            EngineError::Authentication(_) => ErrorType::Authentication,
            EngineError::Budget(_) => ErrorType::Budget,
            EngineError::Unknown(_) => ErrorType::Unknown,
            EngineError::LockTimeout(_) => ErrorType::LockTimeout,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.error_type().http_status()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_set_matches_scheduler_contract() {
        for retryable in [
            ErrorType::Timeout,
            ErrorType::Overloaded,
            ErrorType::RateLimit,
            ErrorType::Network,
        ] {
            assert!(retryable.is_retryable());
        }
        for terminal in [
            ErrorType::NotFound,
            ErrorType::InvalidStatus,
            ErrorType::Blocked,
            ErrorType::NoExecutor,
            ErrorType::AlreadyRunning,
            ErrorType::Authentication,
            ErrorType::Budget,
            ErrorType::Unknown,
        ] {
            assert!(!terminal.is_retryable());
        }
    }

    #[test]
    fn classify_recognizes_overload_and_rate_limit() {
        assert_eq!(
            ErrorType::classify("Overloaded", None),
            ErrorType::Overloaded
        );
        assert_eq!(ErrorType::classify("", Some(529)), ErrorType::Overloaded);
        assert_eq!(
            ErrorType::classify("rate limit exceeded due to load", None),
            ErrorType::Overloaded
        );
        assert_eq!(
            ErrorType::classify("429 rate limit exceeded, please retry later", None),
            ErrorType::RateLimit
        );
    }
}
