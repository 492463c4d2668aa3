use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The two LLM runtimes an employee's `model` field can select. Gateway-served models are
/// proxied through the local HTTP gateway; alternate-runtime models are invoked as a
/// standalone CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Gateway,
    Alternate,
}

/// Classifies an employee's configured model into the runtime path that serves it.
pub fn runtime_kind_for_model(model: &str) -> RuntimeKind {
    match model.to_ascii_lowercase().as_str() {
        "opus" | "sonnet" | "haiku" => RuntimeKind::Gateway,
        _ => RuntimeKind::Alternate,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Employee {
    pub role: String,
    pub model: String,
    pub workdir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
}

fn default_permission_mode() -> String {
    "ask".to_string()
}

impl Employee {
    pub fn runtime_kind(&self) -> RuntimeKind {
        runtime_kind_for_model(&self.model)
    }

    /// Resolves the effective working directory for a task, honoring the task's
    /// `project_path` override when present.
    pub fn effective_workdir<'a>(&'a self, task_project_path: Option<&'a str>) -> &'a str {
        task_project_path
            .or(self.project_path.as_deref())
            .unwrap_or(&self.workdir)
    }
}

/// `employees.json`: an external registry the engine only reads.
pub type EmployeeRegistry = HashMap<String, Employee>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_models_are_recognized() {
        assert_eq!(runtime_kind_for_model("opus"), RuntimeKind::Gateway);
        assert_eq!(runtime_kind_for_model("Sonnet"), RuntimeKind::Gateway);
        assert_eq!(runtime_kind_for_model("haiku"), RuntimeKind::Gateway);
    }

    #[test]
    fn alternate_models_fall_back_to_cli_path() {
        assert_eq!(runtime_kind_for_model("composer"), RuntimeKind::Alternate);
        assert_eq!(runtime_kind_for_model("cursor"), RuntimeKind::Alternate);
        assert_eq!(runtime_kind_for_model("whatever"), RuntimeKind::Alternate);
    }

    #[test]
    fn effective_workdir_prefers_task_override() {
        let employee = Employee {
            role: "developer".into(),
            model: "sonnet".into(),
            workdir: "/home/dev/project".into(),
            project_path: None,
            allowed_tools: vec![],
            permission_mode: "ask".into(),
            max_budget_usd: None,
            fallback_model: None,
        };
        assert_eq!(employee.effective_workdir(None), "/home/dev/project");
        assert_eq!(
            employee.effective_workdir(Some("/tmp/other")),
            "/tmp/other"
        );
    }
}
