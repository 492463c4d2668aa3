mod chat;
mod employee;
mod error;
mod failure;
mod stream;
mod task;

pub use chat::{
    append_chat_entry_bounded, parse_memory_sections, push_memory_section, ChatHistoryEntry,
    MemorySection, MAX_CHAT_HISTORY, MAX_MEMORY_ENTRIES,
};
pub use employee::{runtime_kind_for_model, Employee, EmployeeRegistry, RuntimeKind};
pub use error::{EngineError, ErrorType, Result};
pub use failure::{append_failure_bounded, AgentFailure, MAX_AGENT_FAILURES};
pub use stream::{RunnerOutcome, RunningTask, StreamEvent, TriggerResult};
pub use task::{Sprint, SprintStatus, Task, TaskFilter, TaskStatus, TaskType, TasksDocument};
