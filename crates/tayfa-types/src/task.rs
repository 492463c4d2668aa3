use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical task status. Legacy values (`pending`, `in_progress`, `in_review`) may still
/// appear in data written by older tooling; deserialization folds all of them into `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Done,
    Questions,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "done" => TaskStatus::Done,
            "questions" => TaskStatus::Questions,
            "cancelled" | "canceled" => TaskStatus::Cancelled,
            // pending / in_progress / in_review / new / anything unrecognized
            _ => TaskStatus::New,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Task,
    Bug,
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::Task
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_task: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    pub author: String,
    pub executor: String,
    #[serde(default)]
    pub sprint_id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub is_finalize: bool,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::New
    }
}

impl Task {
    pub fn new_task(
        id: String,
        title: String,
        description: String,
        author: String,
        executor: String,
        sprint_id: String,
        depends_on: Vec<String>,
        project_path: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            description,
            task_type: TaskType::Task,
            related_task: None,
            status: TaskStatus::New,
            author,
            executor,
            sprint_id,
            depends_on,
            is_finalize: false,
            result: String::new(),
            project_path,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_bug(
        id: String,
        title: String,
        description: String,
        author: String,
        executor: String,
        sprint_id: String,
        related_task: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            description,
            task_type: TaskType::Bug,
            related_task,
            status: TaskStatus::New,
            author,
            executor,
            sprint_id,
            depends_on: Vec::new(),
            is_finalize: false,
            result: String::new(),
            project_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_finalize(id: String, sprint_id: String, author: String, executor: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: "Finalize sprint".to_string(),
            description: String::new(),
            task_type: TaskType::Task,
            related_task: None,
            status: TaskStatus::New,
            author,
            executor,
            sprint_id,
            depends_on: Vec::new(),
            is_finalize: true,
            result: String::new(),
            project_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintStatus {
    Active,
    Completed,
    Released,
}

impl Default for SprintStatus {
    fn default() -> Self {
        SprintStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sprint {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: SprintStatus,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub ready_to_execute: bool,
}

impl Sprint {
    pub fn new(id: String, title: String, description: String, created_by: String) -> Self {
        Self {
            id,
            title,
            description,
            created_by,
            created_at: Utc::now(),
            status: SprintStatus::Active,
            version: String::new(),
            ready_to_execute: false,
        }
    }
}

/// A full project's `tasks.json` document: tasks, sprints, and the monotonic id counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksDocument {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub sprints: Vec<Sprint>,
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub next_bug_id: u64,
    #[serde(default)]
    pub next_sprint_id: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
}
