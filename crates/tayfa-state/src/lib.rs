//! Tasks, sprints, bugs, dependencies, status transitions, auto-finalize; exposes pure
//! queries and mutating operations on top of the locked JSON store.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tayfa_bus::BoardBus;
use tayfa_store::LockedJsonStore;
use tayfa_types::{
    Employee, EmployeeRegistry, EngineError, Result, Sprint, SprintStatus, Task, TaskFilter,
    TaskStatus, TasksDocument,
};

/// Project-scoped handle onto `.tayfa/common/tasks.json` and `employees.json`.
#[derive(Clone)]
pub struct StateModel {
    store: LockedJsonStore,
    board_bus: BoardBus,
    tasks_path: PathBuf,
    employees_path: PathBuf,
}

impl StateModel {
    pub fn new(project_root: impl AsRef<Path>, board_bus: BoardBus) -> Self {
        let common = project_root.as_ref().join(".tayfa").join("common");
        Self {
            store: LockedJsonStore::new(),
            board_bus,
            tasks_path: common.join("tasks.json"),
            employees_path: common.join("employees.json"),
        }
    }

    #[cfg(test)]
    fn at_paths(tasks_path: PathBuf, employees_path: PathBuf, board_bus: BoardBus) -> Self {
        Self {
            store: LockedJsonStore::new(),
            board_bus,
            tasks_path,
            employees_path,
        }
    }

    async fn load(&self) -> TasksDocument {
        self.store
            .read(&self.tasks_path, TasksDocument::default())
            .await
            .unwrap_or_default()
    }

    pub async fn create_task(
        &self,
        title: String,
        description: String,
        author: String,
        executor: String,
        sprint_id: Option<String>,
        depends_on: Option<Vec<String>>,
        project_path: Option<String>,
    ) -> Result<Task> {
        let sprint_id = sprint_id.unwrap_or_default();
        let depends_on = depends_on.unwrap_or_default();
        let created_id = std::sync::Mutex::new(String::new());

        let doc = self
            .store
            .update(&self.tasks_path, TasksDocument::default(), |mut doc| {
                let id = format!("T{:03}", doc.next_id);
                doc.next_id += 1;
                *created_id.lock().unwrap() = id.clone();
                let task = Task::new_task(
                    id,
                    title.clone(),
                    description.clone(),
                    author.clone(),
                    executor.clone(),
                    sprint_id.clone(),
                    depends_on.clone(),
                    project_path.clone(),
                );
                doc.tasks.push(task);
                if !sprint_id.is_empty() {
                    recompute_finalize_deps_in(&mut doc, &sprint_id);
                }
                doc
            })
            .await?;

        self.board_bus.publish_changed();
        let id = created_id.into_inner().unwrap();
        find_task(&doc, &id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn create_bug(
        &self,
        title: String,
        description: String,
        author: String,
        executor: String,
        sprint_id: Option<String>,
        related_task: Option<String>,
    ) -> Result<Task> {
        let sprint_id = sprint_id.unwrap_or_default();
        let created_id = std::sync::Mutex::new(String::new());

        let doc = self
            .store
            .update(&self.tasks_path, TasksDocument::default(), |mut doc| {
                let id = format!("B{:03}", doc.next_bug_id);
                doc.next_bug_id += 1;
                *created_id.lock().unwrap() = id.clone();
                let bug = Task::new_bug(
                    id,
                    title.clone(),
                    description.clone(),
                    author.clone(),
                    executor.clone(),
                    sprint_id.clone(),
                    related_task.clone(),
                );
                doc.tasks.push(bug);
                if !sprint_id.is_empty() {
                    recompute_finalize_deps_in(&mut doc, &sprint_id);
                }
                doc
            })
            .await?;

        self.board_bus.publish_changed();
        let id = created_id.into_inner().unwrap();
        find_task(&doc, &id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn create_sprint(
        &self,
        title: String,
        description: String,
        created_by: String,
        ready_to_execute: Option<bool>,
    ) -> Result<(Sprint, Task)> {
        let created_sprint_id = std::sync::Mutex::new(String::new());
        let created_finalize_id = std::sync::Mutex::new(String::new());

        let doc = self
            .store
            .update(&self.tasks_path, TasksDocument::default(), |mut doc| {
                let sprint_id = format!("S{:03}", doc.next_sprint_id);
                doc.next_sprint_id += 1;
                *created_sprint_id.lock().unwrap() = sprint_id.clone();

                let mut sprint = Sprint::new(
                    sprint_id.clone(),
                    title.clone(),
                    description.clone(),
                    created_by.clone(),
                );
                sprint.ready_to_execute = ready_to_execute.unwrap_or(false);
                doc.sprints.push(sprint);

                let finalize_id = format!("T{:03}", doc.next_id);
                doc.next_id += 1;
                *created_finalize_id.lock().unwrap() = finalize_id.clone();
                let finalize = Task::new_finalize(
                    finalize_id,
                    sprint_id,
                    created_by.clone(),
                    created_by.clone(),
                );
                doc.tasks.push(finalize);
                doc
            })
            .await?;

        self.board_bus.publish_changed();
        let sprint_id = created_sprint_id.into_inner().unwrap();
        let finalize_id = created_finalize_id.into_inner().unwrap();
        let sprint = doc
            .sprints
            .iter()
            .find(|s| s.id == sprint_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(sprint_id.clone()))?;
        let finalize = find_task(&doc, &finalize_id)
            .cloned()
            .ok_or(EngineError::NotFound(finalize_id))?;
        Ok((sprint, finalize))
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        let doc = self.load().await;
        find_task(&doc, id).cloned()
    }

    pub async fn get_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let doc = self.load().await;
        doc.tasks
            .into_iter()
            .filter(|t| {
                filter.status.map(|s| t.status == s).unwrap_or(true)
                    && filter
                        .sprint_id
                        .as_deref()
                        .map(|sid| t.sprint_id == sid)
                        .unwrap_or(true)
                    && filter
                        .task_type
                        .map(|ty| t.task_type == ty)
                        .unwrap_or(true)
            })
            .collect()
    }

    pub async fn list_sprints(&self) -> Vec<Sprint> {
        self.load().await.sprints
    }

    pub async fn update_task_status(&self, id: &str, new_status: TaskStatus) -> Result<Task> {
        let id_owned = id.to_string();
        let missing = std::sync::Mutex::new(false);

        let doc = self
            .store
            .update(&self.tasks_path, TasksDocument::default(), |mut doc| {
                let Some(task) = doc.tasks.iter_mut().find(|t| t.id == id_owned) else {
                    *missing.lock().unwrap() = true;
                    return doc;
                };
                task.status = new_status;
                task.touch();
                let is_finalize = task.is_finalize;
                let sprint_id = task.sprint_id.clone();

                if new_status == TaskStatus::Done && is_finalize && !sprint_id.is_empty() {
                    let all_siblings_terminal = doc
                        .tasks
                        .iter()
                        .filter(|t| t.sprint_id == sprint_id && !t.is_finalize)
                        .all(|t| t.status.is_terminal());
                    if all_siblings_terminal {
                        if let Some(sprint) = doc.sprints.iter_mut().find(|s| s.id == sprint_id) {
                            sprint.status = SprintStatus::Completed;
                        }
                    }
                }
                doc
            })
            .await?;

        if *missing.lock().unwrap() {
            return Err(EngineError::NotFound(id.to_string()));
        }

        self.board_bus.publish_changed();
        find_task(&doc, id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub async fn set_task_result(&self, id: &str, text: String) -> Result<Task> {
        let id_owned = id.to_string();
        let missing = std::sync::Mutex::new(false);

        let doc = self
            .store
            .update(&self.tasks_path, TasksDocument::default(), |mut doc| {
                let Some(task) = doc.tasks.iter_mut().find(|t| t.id == id_owned) else {
                    *missing.lock().unwrap() = true;
                    return doc;
                };
                task.result = text.clone();
                task.touch();
                doc
            })
            .await?;

        if *missing.lock().unwrap() {
            return Err(EngineError::NotFound(id.to_string()));
        }
        self.board_bus.publish_changed();
        find_task(&doc, id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub async fn set_sprint_ready(&self, id: &str, ready: bool) -> Result<Sprint> {
        let id_owned = id.to_string();
        let missing = std::sync::Mutex::new(false);

        let doc = self
            .store
            .update(&self.tasks_path, TasksDocument::default(), |mut doc| {
                let Some(sprint) = doc.sprints.iter_mut().find(|s| s.id == id_owned) else {
                    *missing.lock().unwrap() = true;
                    return doc;
                };
                sprint.ready_to_execute = ready;
                doc
            })
            .await?;

        if *missing.lock().unwrap() {
            return Err(EngineError::NotFound(id.to_string()));
        }
        self.board_bus.publish_changed();
        doc.sprints
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Resolves a task's executor against the employee registry, honoring the task's
    /// `project_path` override over the employee's default `workdir`.
    pub async fn resolve_executor(&self, task: &Task) -> Result<ResolvedExecutor> {
        let registry: EmployeeRegistry = self
            .store
            .read(&self.employees_path, EmployeeRegistry::default())
            .await?;
        let employee = registry
            .get(&task.executor)
            .cloned()
            .ok_or_else(|| EngineError::NoExecutor(task.id.clone()))?;
        let workdir = employee
            .effective_workdir(task.project_path.as_deref())
            .to_string();
        Ok(ResolvedExecutor {
            agent: task.executor.clone(),
            role: employee.role.clone(),
            workdir,
            model: employee.model.clone(),
            allowed_tools: employee.allowed_tools.clone(),
            permission_mode: employee.permission_mode.clone(),
            runtime: format!("{:?}", employee.runtime_kind()).to_lowercase(),
            employee,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedExecutor {
    pub agent: String,
    pub role: String,
    pub workdir: String,
    pub model: String,
    pub allowed_tools: Vec<String>,
    pub permission_mode: String,
    pub runtime: String,
    pub employee: Employee,
}

/// `status == new` and every dependency resolves to a terminal (`done`/`cancelled`) task. A
/// missing dependency id is treated as blocked.
pub fn is_runnable(task: &Task, all_tasks: &[Task]) -> bool {
    if task.status != TaskStatus::New {
        return false;
    }
    task.depends_on.iter().all(|dep_id| {
        all_tasks
            .iter()
            .find(|t| &t.id == dep_id)
            .map(|t| t.status.is_terminal())
            .unwrap_or(false)
    })
}

fn find_task<'a>(doc: &'a TasksDocument, id: &str) -> Option<&'a Task> {
    doc.tasks.iter().find(|t| t.id == id)
}

/// Recomputes a sprint's finalize task's `depends_on` to exactly the id-set of its
/// non-finalize siblings. Invoked after every task add/remove in a sprint.
fn recompute_finalize_deps_in(doc: &mut TasksDocument, sprint_id: &str) {
    let sibling_ids: Vec<String> = doc
        .tasks
        .iter()
        .filter(|t| t.sprint_id == sprint_id && !t.is_finalize)
        .map(|t| t.id.clone())
        .collect();
    let sibling_set: HashSet<&str> = sibling_ids.iter().map(String::as_str).collect();

    if let Some(finalize) = doc
        .tasks
        .iter_mut()
        .find(|t| t.sprint_id == sprint_id && t.is_finalize)
    {
        let current_set: HashSet<&str> = finalize.depends_on.iter().map(String::as_str).collect();
        if current_set != sibling_set {
            finalize.depends_on = sibling_ids;
            finalize.touch();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tayfa_types::TaskType;

    fn model() -> (StateModel, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let tasks_path = dir.path().join("tasks.json");
        let employees_path = dir.path().join("employees.json");
        (
            StateModel::at_paths(tasks_path, employees_path, BoardBus::new()),
            dir,
        )
    }

    #[tokio::test]
    async fn create_sprint_creates_empty_finalize_task() {
        let (model, _dir) = model();
        let (sprint, finalize) = model
            .create_sprint("S".into(), "".into(), "op".into(), None)
            .await
            .unwrap();
        assert_eq!(sprint.id, "S000");
        assert_eq!(finalize.id, "T000");
        assert!(finalize.is_finalize);
        assert!(finalize.depends_on.is_empty());
    }

    #[tokio::test]
    async fn creating_a_task_in_a_sprint_links_the_finalize_task() {
        let (model, _dir) = model();
        let (sprint, _finalize) = model
            .create_sprint("S".into(), "".into(), "op".into(), None)
            .await
            .unwrap();
        let task = model
            .create_task(
                "a".into(),
                "".into(),
                "op".into(),
                "developer".into(),
                Some(sprint.id.clone()),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(task.id, "T001");

        let sprints = model.list_sprints().await;
        assert_eq!(sprints.len(), 1);
        let tasks = model.get_tasks(&TaskFilter::default()).await;
        let finalize = tasks.iter().find(|t| t.is_finalize).unwrap();
        assert_eq!(finalize.depends_on, vec!["T001".to_string()]);
    }

    #[tokio::test]
    async fn finalize_reaching_done_completes_the_sprint_when_all_siblings_terminal() {
        let (model, _dir) = model();
        let (sprint, _finalize) = model
            .create_sprint("S".into(), "".into(), "op".into(), None)
            .await
            .unwrap();
        let task = model
            .create_task(
                "a".into(),
                "".into(),
                "op".into(),
                "developer".into(),
                Some(sprint.id.clone()),
                None,
                None,
            )
            .await
            .unwrap();

        model
            .update_task_status(&task.id, TaskStatus::Done)
            .await
            .unwrap();

        let tasks = model.get_tasks(&TaskFilter::default()).await;
        let finalize = tasks.iter().find(|t| t.is_finalize).unwrap().clone();
        assert!(is_runnable(&finalize, &tasks));

        model
            .update_task_status(&finalize.id, TaskStatus::Done)
            .await
            .unwrap();

        let sprints = model.list_sprints().await;
        assert_eq!(sprints[0].status, SprintStatus::Completed);
    }

    #[tokio::test]
    async fn task_with_empty_depends_on_is_always_runnable_when_new() {
        let task = Task::new_task(
            "T000".into(),
            "t".into(),
            "".into(),
            "op".into(),
            "dev".into(),
            "".into(),
            vec![],
            None,
        );
        assert!(is_runnable(&task, &[task.clone()]));
    }

    #[tokio::test]
    async fn missing_dependency_is_treated_as_blocked() {
        let mut task = Task::new_task(
            "T001".into(),
            "t".into(),
            "".into(),
            "op".into(),
            "dev".into(),
            "".into(),
            vec!["T999".into()],
            None,
        );
        task.task_type = TaskType::Task;
        assert!(!is_runnable(&task, &[task.clone()]));
    }

    #[tokio::test]
    async fn resolve_executor_honors_task_project_path_override() {
        let (model, dir) = model();
        let mut registry = EmployeeRegistry::new();
        registry.insert(
            "developer".into(),
            Employee {
                role: "developer".into(),
                model: "sonnet".into(),
                workdir: "/default".into(),
                project_path: None,
                allowed_tools: vec![],
                permission_mode: "ask".into(),
                max_budget_usd: None,
                fallback_model: None,
            },
        );
        tokio::fs::write(
            dir.path().join("employees.json"),
            serde_json::to_vec(&registry).unwrap(),
        )
        .await
        .unwrap();

        let mut task = Task::new_task(
            "T000".into(),
            "t".into(),
            "".into(),
            "op".into(),
            "developer".into(),
            "".into(),
            vec![],
            Some("/override".into()),
        );
        task.executor = "developer".into();
        let resolved = model.resolve_executor(&task).await.unwrap();
        assert_eq!(resolved.workdir, "/override");
    }

    #[tokio::test]
    async fn resolve_executor_fails_when_not_in_registry() {
        let (model, _dir) = model();
        let task = Task::new_task(
            "T000".into(),
            "t".into(),
            "".into(),
            "op".into(),
            "ghost".into(),
            "".into(),
            vec![],
            None,
        );
        let err = model.resolve_executor(&task).await.unwrap_err();
        assert!(matches!(err, EngineError::NoExecutor(_)));
    }
}
