use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tayfa_types::{EngineError, RunningTask, StreamEvent, TaskFilter, TaskStatus, TaskType};
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};

use crate::AppState;

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/tasks-list", get(list_tasks).post(create_tasks))
        .route("/api/tasks-list/{id}/trigger", post(trigger_task))
        .route("/api/tasks-list/{id}/status", put(set_task_status))
        .route("/api/bugs", post(create_bug))
        .route("/api/sprints", get(list_sprints).post(create_sprint))
        .route("/api/sprints/{id}", put(update_sprint))
        .route("/api/running-tasks", get(running_tasks))
        .route("/api/agent-failures", get(list_agent_failures))
        .route("/api/agent-failures/{id}", delete(resolve_agent_failure))
        .route("/api/board-events", get(board_events))
        .route("/api/agent-stream/{name}", get(agent_stream))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_sec: i64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: state.version,
        uptime_sec: (chrono::Utc::now() - state.started_at).num_seconds(),
    })
}

#[derive(Debug, Deserialize, Default)]
struct ListTasksQuery {
    status: Option<TaskStatus>,
    sprint_id: Option<String>,
    task_type: Option<TaskType>,
}

async fn list_tasks(State(state): State<AppState>, Query(query): Query<ListTasksQuery>) -> Json<Value> {
    let filter = TaskFilter {
        status: query.status,
        sprint_id: query.sprint_id,
        task_type: query.task_type,
    };
    let tasks = state.state.get_tasks(&filter).await;
    Json(json!(tasks))
}

#[derive(Debug, Deserialize)]
struct CreateTaskInput {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_author")]
    author: String,
    executor: String,
    sprint_id: Option<String>,
    depends_on: Option<Vec<String>>,
    project_path: Option<String>,
}

fn default_author() -> String {
    "operator".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

async fn create_tasks(
    State(state): State<AppState>,
    Json(input): Json<OneOrMany<CreateTaskInput>>,
) -> Result<Json<Value>, ApiError> {
    let mut created = Vec::new();
    for item in input.into_vec() {
        let task = state
            .state
            .create_task(
                item.title,
                item.description,
                item.author,
                item.executor,
                item.sprint_id,
                item.depends_on,
                item.project_path,
            )
            .await?;
        created.push(task);
    }
    if created.len() == 1 {
        Ok(Json(json!(created.into_iter().next().unwrap())))
    } else {
        Ok(Json(json!(created)))
    }
}

#[derive(Debug, Deserialize)]
struct CreateBugInput {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_author")]
    author: String,
    executor: String,
    sprint_id: Option<String>,
    related_task: Option<String>,
}

async fn create_bug(State(state): State<AppState>, Json(input): Json<CreateBugInput>) -> Result<Json<Value>, ApiError> {
    let bug = state
        .state
        .create_bug(
            input.title,
            input.description,
            input.author,
            input.executor,
            input.sprint_id,
            input.related_task,
        )
        .await?;
    Ok(Json(json!(bug)))
}

#[derive(Debug, Deserialize)]
struct CreateSprintInput {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_author")]
    created_by: String,
    ready_to_execute: Option<bool>,
}

async fn create_sprint(
    State(state): State<AppState>,
    Json(input): Json<CreateSprintInput>,
) -> Result<Json<Value>, ApiError> {
    let (sprint, finalize_task) = state
        .state
        .create_sprint(input.title, input.description, input.created_by, input.ready_to_execute)
        .await?;
    Ok(Json(json!({ "sprint": sprint, "finalize_task": finalize_task })))
}

async fn list_sprints(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.state.list_sprints().await))
}

#[derive(Debug, Deserialize, Default)]
struct UpdateSprintInput {
    ready_to_execute: Option<bool>,
}

async fn update_sprint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<UpdateSprintInput>,
) -> Result<Json<Value>, ApiError> {
    let sprint = match input.ready_to_execute {
        Some(ready) => state.state.set_sprint_ready(&id, ready).await?,
        None => state
            .state
            .list_sprints()
            .await
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?,
    };
    Ok(Json(json!(sprint)))
}

#[derive(Debug, Deserialize)]
struct SetTaskStatusInput {
    status: TaskStatus,
}

async fn set_task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<SetTaskStatusInput>,
) -> Result<Json<Value>, ApiError> {
    state.state.update_task_status(&id, input.status).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn trigger_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let result = state.scheduler.trigger(&id).await?;
    Ok(Json(json!(result)))
}

async fn running_tasks(State(state): State<AppState>) -> Json<Value> {
    let now = chrono::Utc::now().timestamp();
    let running = state.scheduler.running_tasks().await;
    let entries: serde_json::Map<String, Value> = running
        .into_iter()
        .map(|(id, record)| (id, json!(running_task_view(&record, now))))
        .collect();
    Json(json!({ "running": entries }))
}

#[derive(Serialize)]
struct RunningTaskView<'a> {
    agent: &'a str,
    role: &'a str,
    runtime: &'a str,
    started_at: i64,
    elapsed_seconds: i64,
}

fn running_task_view(record: &RunningTask, now: i64) -> RunningTaskView<'_> {
    RunningTaskView {
        agent: &record.agent,
        role: &record.role,
        runtime: &record.runtime,
        started_at: record.started_at_epoch_seconds,
        elapsed_seconds: record.elapsed_seconds(now),
    }
}

#[derive(Debug, Deserialize, Default)]
struct AgentFailuresQuery {
    resolved: Option<bool>,
}

async fn list_agent_failures(State(state): State<AppState>, Query(query): Query<AgentFailuresQuery>) -> Json<Value> {
    let failures = state.scheduler.agent_failures(query.resolved).await;
    Json(json!({ "failures": failures }))
}

async fn resolve_agent_failure(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    state.scheduler.resolve_failure(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn board_events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.board_bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(event) => Some(Ok(Event::default().data(serde_json::to_string(&event).unwrap_or_default()))),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("keepalive"))
}

async fn agent_stream(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    match state.agent_bus.subscribe(&name).await {
        Some((replay, rx)) => {
            let replay_stream = tokio_stream::iter(replay.into_iter().map(|event| Ok(stream_event_to_sse(&event))));
            let live_stream =
                BroadcastStream::new(rx).filter_map(|msg| msg.ok().map(|event| Ok(stream_event_to_sse(&event))));
            Sse::new(replay_stream.chain(live_stream).boxed())
                .keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("keepalive"))
        }
        None => {
            let synthetic_end = tokio_stream::once(Ok(stream_event_to_sse(&StreamEvent::stream_end())));
            Sse::new(synthetic_end.boxed())
                .keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("keepalive"))
        }
    }
}

fn stream_event_to_sse(event: &StreamEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}
