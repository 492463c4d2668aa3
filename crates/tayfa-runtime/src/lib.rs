//! Given (agent, prompt, model), spawns the LLM CLI or calls the LLM gateway, parses its
//! streaming output, publishes events on the per-agent bus, and records chat history / agent
//! memory. This crate owns everything downstream of the scheduler's retry loop for a single
//! attempt.

mod history;
mod parser;
mod runner;

pub use history::{append_memory_section, read_memory, HistoryStore};
pub use parser::StreamParser;
pub use runner::{AgentRunner, InvokeRequest, RunnerConfig};

use chrono::Utc;
use tayfa_types::{ChatHistoryEntry, MemorySection, Result, RuntimeKind};

/// Runs one attempt end to end: injects the agent's memory as a postscript to the prompt,
/// invokes the runner, then records the chat-history entry and the memory section the
/// invocation produced (a `Summary` on success, an `INTERRUPTED` section on failure/timeout).
pub async fn run_and_record(
    runner: &AgentRunner,
    history: &HistoryStore,
    mut req: InvokeRequest,
    runtime: RuntimeKind,
) -> Result<tayfa_types::RunnerOutcome> {
    let memory = read_memory(&req.workdir, &req.agent).await;
    if !memory.trim().is_empty() {
        req.prompt = format!("{}\n\n---\nPrior memory:\n{}\n", req.prompt, memory);
    }

    let outcome = runner.invoke(&req, runtime).await;

    history
        .append_chat_entry(
            &req.agent,
            ChatHistoryEntry {
                timestamp: Utc::now(),
                prompt: req.prompt.clone(),
                result: outcome.result.clone(),
                model: req.model.clone(),
                cost_usd: outcome.cost_usd,
                duration_sec: outcome.duration_sec,
                num_turns: outcome.num_turns,
                task_id: req.task_id.clone(),
                success: outcome.success,
                error_type: outcome.error_type,
                session_id: outcome.session_id.clone(),
            },
        )
        .await?;

    let section = if outcome.success {
        MemorySection::summary(&outcome.result, &req.task_id)
    } else {
        MemorySection::interrupted(
            outcome.message.as_deref().unwrap_or("invocation failed"),
            outcome.partial_result.as_deref(),
        )
    };
    append_memory_section(&req.workdir, &req.agent, section).await?;

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tayfa_bus::AgentStreamBus;
    use std::time::Duration;

    fn test_request(workdir: &str) -> InvokeRequest {
        InvokeRequest {
            task_id: "T001".into(),
            agent: "dev".into(),
            role: "developer".into(),
            prompt: "do the thing".into(),
            model: "sonnet".into(),
            workdir: workdir.into(),
            session_id: None,
            tools: vec![],
            permission_mode: "ask".into(),
        }
    }

    #[tokio::test]
    async fn failing_gateway_url_classifies_as_network_error_not_panic() {
        let bus = AgentStreamBus::new();
        let runner = AgentRunner::new(
            bus,
            RunnerConfig {
                gateway_url: "http://127.0.0.1:1".into(),
                agent_timeout: Duration::from_millis(500),
                graceful_drain: Duration::from_millis(100),
                alternate_cli_path: "true".into(),
            },
        );
        let dir = tempfile::tempdir().unwrap();
        let req = test_request(dir.path().to_str().unwrap());
        let outcome = runner.invoke(&req, RuntimeKind::Gateway).await;
        assert!(!outcome.success);
        assert!(outcome.error_type.is_some());
    }

    #[tokio::test]
    async fn run_and_record_persists_history_and_memory_even_on_failure() {
        let bus = AgentStreamBus::new();
        let runner = AgentRunner::new(
            bus,
            RunnerConfig {
                gateway_url: "http://127.0.0.1:1".into(),
                agent_timeout: Duration::from_millis(200),
                graceful_drain: Duration::from_millis(50),
                alternate_cli_path: "true".into(),
            },
        );
        let dir = tempfile::tempdir().unwrap();
        let history = HistoryStore::new(dir.path());
        let req = test_request(dir.path().to_str().unwrap());

        let outcome = run_and_record(&runner, &history, req.clone(), RuntimeKind::Gateway)
            .await
            .unwrap();
        assert!(!outcome.success);

        let memory = read_memory(&req.workdir, &req.agent).await;
        assert!(memory.contains("INTERRUPTED"));
    }
}
