use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tayfa_bus::{AgentStreamBus, BoardBus};
use tayfa_observability::{canonical_logs_dir_from_state_dir, init_logging};
use tayfa_runtime::{AgentRunner, HistoryStore, RunnerConfig};
use tayfa_scheduler::{Scheduler, SchedulerConfig};
use tayfa_server::{serve, AppState};
use tayfa_state::StateModel;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tayfa-engine")]
#[command(about = "Headless task execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts the HTTP + SSE server.
    Serve {
        #[arg(long, alias = "host")]
        hostname: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Triggers a single task and prints the outcome, without starting the server.
    Trigger {
        task_id: String,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Prints the resolved configuration for the current project.
    Status {
        #[arg(long)]
        state_dir: Option<String>,
    },
}

/// Engine tuning knobs. Precedence is CLI flag > `TAYFA_*` environment variable >
/// `<state_dir>/config.json` > built-in default, matching the resolution order the rest of
/// the engine uses for `state_dir` itself.
#[derive(Debug, Clone, Deserialize)]
struct EngineConfig {
    #[serde(default = "default_hostname")]
    hostname: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_agent_timeout_secs")]
    agent_timeout_secs: u64,
    #[serde(default = "default_graceful_drain_secs")]
    graceful_drain_secs: u64,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    retry_delay_secs: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    max_concurrent_tasks: usize,
    #[serde(default = "default_gateway_url")]
    gateway_url: String,
    #[serde(default = "default_alternate_cli_path")]
    alternate_cli_path: String,
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4700
}
fn default_agent_timeout_secs() -> u64 {
    600
}
fn default_graceful_drain_secs() -> u64 {
    20
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    3
}
fn default_max_concurrent_tasks() -> usize {
    4
}
fn default_gateway_url() -> String {
    "http://127.0.0.1:8317".to_string()
}
fn default_alternate_cli_path() -> String {
    "claude".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            agent_timeout_secs: default_agent_timeout_secs(),
            graceful_drain_secs: default_graceful_drain_secs(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            gateway_url: default_gateway_url(),
            alternate_cli_path: default_alternate_cli_path(),
        }
    }
}

impl EngineConfig {
    /// Loads `<state_dir>/config.json` if present, then overlays `TAYFA_*` environment
    /// variables, then the CLI's explicit `--hostname`/`--port` (the only two flags that make
    /// sense per-invocation rather than per-project).
    async fn load(state_dir: &Path, cli_hostname: Option<String>, cli_port: Option<u16>) -> Self {
        let mut config = match tokio::fs::read(state_dir.join("config.json")).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => EngineConfig::default(),
        };

        if let Ok(v) = std::env::var("TAYFA_HOSTNAME") {
            config.hostname = v;
        }
        if let Some(v) = std::env::var("TAYFA_PORT").ok().and_then(|v| v.parse().ok()) {
            config.port = v;
        }
        if let Ok(v) = std::env::var("TAYFA_GATEWAY_URL") {
            config.gateway_url = v;
        }
        if let Some(v) = std::env::var("TAYFA_AGENT_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()) {
            config.agent_timeout_secs = v;
        }
        if let Some(v) = std::env::var("TAYFA_MAX_CONCURRENT_TASKS").ok().and_then(|v| v.parse().ok()) {
            config.max_concurrent_tasks = v;
        }

        if let Some(hostname) = cli_hostname {
            config.hostname = hostname;
        }
        if let Some(port) = cli_port {
            config.port = port;
        }

        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let _logging_guard = init_logging(&canonical_logs_dir_from_state_dir(&state_dir))?;
            let config = EngineConfig::load(&state_dir, hostname, port).await;
            let app_state = build_app_state(&state_dir, &config)?;

            let addr: SocketAddr = format!("{}:{}", config.hostname, config.port)
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr);
            serve(addr, app_state).await?;
        }
        Command::Trigger { task_id, state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            tracing_subscriber::fmt().with_env_filter("info").with_target(false).init();
            let config = EngineConfig::load(&state_dir, None, None).await;
            let app_state = build_app_state(&state_dir, &config)?;
            let result = app_state.scheduler.trigger(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Status { state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let config = EngineConfig::load(&state_dir, None, None).await;
            let app_state = build_app_state(&state_dir, &config)?;
            let running = app_state.scheduler.running_tasks().await;
            let failures = app_state.scheduler.agent_failures(Some(false)).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "state_dir": state_dir.display().to_string(),
                    "config": SerializableConfig::from(&config),
                    "running_tasks": running,
                    "unresolved_agent_failures": failures,
                }))?
            );
        }
    }

    Ok(())
}

#[derive(serde::Serialize)]
struct SerializableConfig<'a> {
    hostname: &'a str,
    port: u16,
    agent_timeout_secs: u64,
    graceful_drain_secs: u64,
    max_attempts: u32,
    retry_delay_secs: u64,
    max_concurrent_tasks: usize,
    gateway_url: &'a str,
    alternate_cli_path: &'a str,
}

impl<'a> From<&'a EngineConfig> for SerializableConfig<'a> {
    fn from(config: &'a EngineConfig) -> Self {
        Self {
            hostname: &config.hostname,
            port: config.port,
            agent_timeout_secs: config.agent_timeout_secs,
            graceful_drain_secs: config.graceful_drain_secs,
            max_attempts: config.max_attempts,
            retry_delay_secs: config.retry_delay_secs,
            max_concurrent_tasks: config.max_concurrent_tasks,
            gateway_url: &config.gateway_url,
            alternate_cli_path: &config.alternate_cli_path,
        }
    }
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("TAYFA_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".tayfa")
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting tayfa-engine on http://{addr}");
    info!(
        "startup paths: cwd={} state_dir={}",
        cwd.display(),
        state_dir.display()
    );
}

fn build_app_state(state_dir: &Path, config: &EngineConfig) -> anyhow::Result<AppState> {
    let board_bus = BoardBus::new();
    let agent_bus = AgentStreamBus::new();
    let project_root = std::env::current_dir().context("resolving project root")?;
    let state = StateModel::new(&project_root, board_bus.clone());

    let runner_config = RunnerConfig {
        gateway_url: config.gateway_url.clone(),
        agent_timeout: Duration::from_secs(config.agent_timeout_secs),
        graceful_drain: Duration::from_secs(config.graceful_drain_secs),
        alternate_cli_path: config.alternate_cli_path.clone(),
    };
    let runner = AgentRunner::new(agent_bus.clone(), runner_config);
    let history = HistoryStore::new(state_dir);

    let scheduler_config = SchedulerConfig {
        max_attempts: config.max_attempts,
        retry_delay: Duration::from_secs(config.retry_delay_secs),
        max_concurrent_tasks: config.max_concurrent_tasks,
    };
    let scheduler = Scheduler::new(
        state.clone(),
        runner,
        history,
        board_bus.clone(),
        state_dir,
        scheduler_config,
    );

    Ok(AppState::new(state, scheduler, board_bus, agent_bus))
}
