//! Accepts a "run this task" request, resolves the executor, applies dependency + single-flight
//! + concurrency rules, invokes the agent runner with retry/backoff, updates state on
//! completion, and emits `board_changed` to the event bus.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tayfa_bus::BoardBus;
use tayfa_runtime::{run_and_record, AgentRunner, HistoryStore, InvokeRequest};
use tayfa_state::StateModel;
use tayfa_store::LockedJsonStore;
use tayfa_types::{
    append_failure_bounded, AgentFailure, EngineError, ErrorType, Result, RunningTask, Task,
    TaskFilter, TaskStatus, TriggerResult,
};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);
const RESUME_PROMPT_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Width of the optional internal concurrency semaphore. The scheduler's own contract is
    /// only single-flight-per-task; this ceiling is a safety net for non-UI-driven clients.
    pub max_concurrent_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_concurrent_tasks: 4,
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    state: StateModel,
    runner: Arc<AgentRunner>,
    history: Arc<HistoryStore>,
    board_bus: BoardBus,
    failures_store: LockedJsonStore,
    failures_path: PathBuf,
    discussions_dir: PathBuf,
    running: Arc<Mutex<HashMap<String, RunningTask>>>,
    concurrency: Arc<Semaphore>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        state: StateModel,
        runner: AgentRunner,
        history: HistoryStore,
        board_bus: BoardBus,
        state_dir: impl Into<PathBuf>,
        config: SchedulerConfig,
    ) -> Self {
        let state_dir = state_dir.into();
        Self {
            state,
            runner: Arc::new(runner),
            history: Arc::new(history),
            board_bus,
            failures_store: LockedJsonStore::new(),
            failures_path: state_dir.join("agent_failures.json"),
            discussions_dir: state_dir.join("discussions"),
            running: Arc::new(Mutex::new(HashMap::new())),
            concurrency: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            config,
        }
    }

    /// Snapshot of the in-memory running-record map, for `GET /api/running-tasks`.
    pub async fn running_tasks(&self) -> HashMap<String, RunningTask> {
        self.running.lock().await.clone()
    }

    pub async fn agent_failures(&self, resolved: Option<bool>) -> Vec<AgentFailure> {
        let log: Vec<AgentFailure> = self
            .failures_store
            .read(&self.failures_path, Vec::new())
            .await
            .unwrap_or_default();
        match resolved {
            Some(flag) => log.into_iter().filter(|f| f.resolved == flag).collect(),
            None => log,
        }
    }

    pub async fn resolve_failure(&self, id: &str) -> Result<()> {
        let id_owned = id.to_string();
        self.failures_store
            .update(&self.failures_path, Vec::new(), move |mut log: Vec<AgentFailure>| {
                if let Some(failure) = log.iter_mut().find(|f| f.id == id_owned) {
                    failure.resolved = true;
                }
                log
            })
            .await?;
        Ok(())
    }

    /// The single entry point: `trigger(task_id)`. See the state machine in the task
    /// execution design for the full transition table.
    pub async fn trigger(&self, task_id: &str) -> Result<TriggerResult> {
        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| EngineError::Unknown("scheduler concurrency semaphore closed".into()))?;

        let task = self
            .state
            .get_task(task_id)
            .await
            .ok_or_else(|| EngineError::NotFound(task_id.to_string()))?;

        if task.status != TaskStatus::New {
            return Err(EngineError::InvalidStatus(task_id.to_string()));
        }

        if !self.reserve(task_id).await {
            return Err(EngineError::AlreadyRunning(task_id.to_string()));
        }

        match self.run_reserved(task).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.release(task_id).await;
                self.board_bus.publish_changed();
                Err(err)
            }
        }
    }

    /// Reserves the single-flight slot for `task_id`. Returns `false` if already reserved.
    async fn reserve(&self, task_id: &str) -> bool {
        let mut running = self.running.lock().await;
        if running.contains_key(task_id) {
            return false;
        }
        running.insert(
            task_id.to_string(),
            RunningTask {
                task_id: task_id.to_string(),
                agent: String::new(),
                role: String::new(),
                runtime: String::new(),
                started_at_epoch_seconds: Utc::now().timestamp(),
            },
        );
        true
    }

    async fn commit(&self, task_id: &str, agent: &str, role: &str, runtime: &str) {
        let mut running = self.running.lock().await;
        if let Some(record) = running.get_mut(task_id) {
            record.agent = agent.to_string();
            record.role = role.to_string();
            record.runtime = runtime.to_string();
        }
    }

    async fn release(&self, task_id: &str) {
        self.running.lock().await.remove(task_id);
    }

    async fn run_reserved(&self, task: Task) -> Result<TriggerResult> {
        let all_tasks = self.state.get_tasks(&TaskFilter::default()).await;
        if !tayfa_state::is_runnable(&task, &all_tasks) {
            return Err(EngineError::Blocked(task.id.clone()));
        }

        let resolved = self.state.resolve_executor(&task).await?;
        self.commit(&task.id, &resolved.agent, &resolved.role, &resolved.runtime)
            .await;
        self.board_bus.publish_changed();

        let base_prompt = self.compose_prompt(&task).await;
        let mut current_prompt = base_prompt.clone();
        let mut resume_session: Option<String> = None;
        let mut attempt = 0u32;

        let outcome = loop {
            attempt += 1;

            if let Some(current) = self.state.get_task(&task.id).await {
                if current.status == TaskStatus::Cancelled {
                    self.release(&task.id).await;
                    self.board_bus.publish_changed();
                    return Ok(TriggerResult {
                        task_id: task.id.clone(),
                        agent: resolved.agent.clone(),
                        role: resolved.role.clone(),
                        runtime: resolved.runtime.clone(),
                        success: false,
                        result: String::new(),
                        note: Some("cancelled before attempt".to_string()),
                    });
                }
            }

            let request = InvokeRequest {
                task_id: task.id.clone(),
                agent: resolved.agent.clone(),
                role: resolved.role.clone(),
                prompt: current_prompt.clone(),
                model: resolved.model.clone(),
                workdir: resolved.workdir.clone(),
                session_id: resume_session.clone(),
                tools: resolved.allowed_tools.clone(),
                permission_mode: resolved.permission_mode.clone(),
            };

            let outcome =
                run_and_record(&self.runner, &self.history, request, resolved.employee.runtime_kind()).await?;

            if outcome.success {
                break outcome;
            }

            info!(
                task_id = %task.id,
                attempt,
                error_type = ?outcome.error_type,
                "agent attempt failed"
            );

            if outcome.error_type == Some(ErrorType::Timeout) {
                resume_session = outcome.session_id.clone();
                let excerpt: String = base_prompt.chars().take(RESUME_PROMPT_EXCERPT_CHARS).collect();
                current_prompt = format!(
                    "You hit a timeout. If you already did part of the work, continue; otherwise restart. Original task: {excerpt}"
                );
            }

            let retryable = outcome.error_type.map(ErrorType::is_retryable).unwrap_or(false);
            if !retryable || attempt >= self.config.max_attempts {
                break outcome;
            }

            tokio::time::sleep(self.config.retry_delay).await;
        };

        let final_result = if !outcome.success {
            if let Some(current) = self.state.get_task(&task.id).await {
                if current.status.is_terminal() {
                    self.release(&task.id).await;
                    self.board_bus.publish_changed();
                    return Ok(TriggerResult {
                        task_id: task.id.clone(),
                        agent: resolved.agent.clone(),
                        role: resolved.role.clone(),
                        runtime: resolved.runtime.clone(),
                        success: true,
                        result: current.result,
                        note: Some("Completed despite stream error".to_string()),
                    });
                }
            }

            let failure = AgentFailure::new(
                task.id.clone(),
                resolved.agent.clone(),
                outcome.error_type.unwrap_or(ErrorType::Unknown),
                outcome.message.clone().unwrap_or_default(),
                None,
            );
            if let Err(err) = self.append_failure(failure).await {
                warn!(task_id = %task.id, %err, "failed to persist agent failure record");
            }
            outcome
        } else {
            outcome
        };

        self.release(&task.id).await;
        self.board_bus.publish_changed();

        Ok(TriggerResult {
            task_id: task.id.clone(),
            agent: resolved.agent,
            role: resolved.role,
            runtime: resolved.runtime,
            success: final_result.success,
            result: final_result.result,
            note: None,
        })
    }

    async fn append_failure(&self, failure: AgentFailure) -> Result<()> {
        self.failures_store
            .update(&self.failures_path, Vec::new(), move |mut log: Vec<AgentFailure>| {
                append_failure_bounded(&mut log, failure.clone());
                log
            })
            .await?;
        Ok(())
    }

    async fn compose_prompt(&self, task: &Task) -> String {
        let discussion_path = self.discussions_dir.join(format!("{}.md", task.id));
        let discussion = tokio::fs::read_to_string(&discussion_path).await.unwrap_or_default();
        format!(
            "Task {}: {}\n\n{}\n\nRead the discussion log above, do the work, then write your \
             result and update the task's status to `done` or `questions`.",
            task.id, task.description, discussion.trim()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tayfa_runtime::RunnerConfig;
    use tayfa_types::{Employee, EmployeeRegistry};

    async fn harness() -> (Scheduler, tempfile::TempDir) {
        harness_with_gateway("http://127.0.0.1:1", Duration::from_millis(200)).await
    }

    /// `gateway_url` lets the concurrency test use an address that hangs for the full
    /// `agent_timeout` instead of failing instantly, so there is a real window for a second
    /// `trigger` call to observe the first one's reservation.
    async fn harness_with_gateway(gateway_url: &str, agent_timeout: Duration) -> (Scheduler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let board_bus = BoardBus::new();
        let state = StateModel::new(dir.path(), board_bus.clone());

        let mut registry = EmployeeRegistry::new();
        registry.insert(
            "developer".to_string(),
            Employee {
                role: "developer".into(),
                model: "sonnet".into(),
                workdir: dir.path().to_str().unwrap().to_string(),
                project_path: None,
                allowed_tools: vec![],
                permission_mode: "ask".into(),
                max_budget_usd: None,
                fallback_model: None,
            },
        );
        tokio::fs::create_dir_all(dir.path().join(".tayfa").join("common"))
            .await
            .unwrap();
        tokio::fs::write(
            dir.path().join(".tayfa").join("common").join("employees.json"),
            serde_json::to_vec(&registry).unwrap(),
        )
        .await
        .unwrap();

        let runner = AgentRunner::new(
            tayfa_bus::AgentStreamBus::new(),
            RunnerConfig {
                gateway_url: gateway_url.to_string(),
                agent_timeout,
                graceful_drain: Duration::from_millis(50),
                alternate_cli_path: "true".into(),
            },
        );
        let history = HistoryStore::new(dir.path());
        let scheduler = Scheduler::new(
            state,
            runner,
            history,
            board_bus,
            dir.path(),
            SchedulerConfig {
                max_attempts: 1,
                retry_delay: Duration::from_millis(1),
                max_concurrent_tasks: 2,
            },
        );
        (scheduler, dir)
    }

    #[tokio::test]
    async fn triggering_unknown_task_is_not_found() {
        let (scheduler, _dir) = harness().await;
        let err = scheduler.trigger("T999").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn triggering_blocked_task_reports_blocked() {
        let (scheduler, _dir) = harness().await;
        let task = scheduler
            .state
            .create_task(
                "a".into(),
                "".into(),
                "op".into(),
                "developer".into(),
                None,
                Some(vec!["T999".into()]),
                None,
            )
            .await
            .unwrap();
        let err = scheduler.trigger(&task.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Blocked(_)));
    }

    #[tokio::test]
    async fn failed_invocation_records_agent_failure_and_releases_slot() {
        let (scheduler, _dir) = harness().await;
        let task = scheduler
            .state
            .create_task(
                "a".into(),
                "".into(),
                "op".into(),
                "developer".into(),
                None,
                None,
                None,
            )
            .await
            .unwrap();

        let result = scheduler.trigger(&task.id).await.unwrap();
        assert!(!result.success);

        let failures = scheduler.agent_failures(None).await;
        assert_eq!(failures.len(), 1);
        assert!(scheduler.running_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_triggers_of_same_task_yield_exactly_one_success_path() {
        // A non-routable address hangs for the full deadline instead of failing instantly,
        // giving the second `trigger` call a real window to observe the reservation.
        let (scheduler, _dir) =
            harness_with_gateway("http://10.255.255.1", Duration::from_millis(300)).await;
        let task = scheduler
            .state
            .create_task(
                "a".into(),
                "".into(),
                "op".into(),
                "developer".into(),
                None,
                None,
                None,
            )
            .await
            .unwrap();

        let scheduler = Arc::new(scheduler);
        let id = task.id.clone();
        let (s1, s2) = (scheduler.clone(), scheduler.clone());
        let (id1, id2) = (id.clone(), id.clone());
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { s1.trigger(&id1).await }),
            tokio::spawn(async move { s2.trigger(&id2).await }),
        );
        let outcomes = [r1.unwrap(), r2.unwrap()];
        let already_running_count = outcomes
            .iter()
            .filter(|r| matches!(r, Err(EngineError::AlreadyRunning(_))))
            .count();
        assert_eq!(already_running_count, 1);
    }
}
