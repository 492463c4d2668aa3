//! Spawns the LLM CLI (gateway path or alternate path), streams its output onto the per-agent
//! bus, and returns a [`RunnerOutcome`] once the stream reaches a terminal state.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::{json, Value};
use tayfa_bus::AgentStreamBus;
use tayfa_types::{ErrorType, RunnerOutcome, RuntimeKind, StreamEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::parser::StreamParser;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub gateway_url: String,
    /// Per-invocation deadline before the runner attempts a graceful shutdown.
    pub agent_timeout: Duration,
    /// Additional time given to drain output after the deadline, before a hard kill.
    pub graceful_drain: Duration,
    /// Path to the alternate-runtime CLI binary (invoked directly, no gateway hop).
    pub alternate_cli_path: String,
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub task_id: String,
    pub agent: String,
    pub role: String,
    pub prompt: String,
    pub model: String,
    pub workdir: String,
    pub session_id: Option<String>,
    pub tools: Vec<String>,
    pub permission_mode: String,
}

pub struct AgentRunner {
    http: reqwest::Client,
    bus: AgentStreamBus,
    config: RunnerConfig,
}

impl AgentRunner {
    pub fn new(bus: AgentStreamBus, config: RunnerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            bus,
            config,
        }
    }

    /// Runs one agent invocation end to end: resets the bus's replay buffer for this agent,
    /// dispatches to the gateway or alternate path based on `runtime`, and always terminates
    /// the stream with a `stream_end` sentinel even on error.
    pub async fn invoke(&self, req: &InvokeRequest, runtime: RuntimeKind) -> RunnerOutcome {
        self.bus.start_run(&req.agent).await;
        let started = Instant::now();

        let result = match runtime {
            RuntimeKind::Gateway => self.invoke_gateway(req).await,
            RuntimeKind::Alternate => self.invoke_alternate(req).await,
        };

        let mut outcome = result.unwrap_or_else(|err| RunnerOutcome {
            success: false,
            error_type: Some(err),
            message: Some(err.as_str().to_string()),
            partial_result: None,
            result: String::new(),
            cost_usd: 0.0,
            duration_sec: 0.0,
            num_turns: 0,
            session_id: req.session_id.clone(),
        });
        outcome.duration_sec = started.elapsed().as_secs_f64();

        self.bus.publish(&req.agent, StreamEvent::stream_end()).await;
        outcome
    }

    async fn invoke_gateway(&self, req: &InvokeRequest) -> Result<RunnerOutcome, ErrorType> {
        let url = format!("{}/run", self.config.gateway_url.trim_end_matches('/'));
        let body = json!({
            "name": req.agent,
            "prompt": req.prompt,
            "model": req.model,
            "workdir": req.workdir,
            "tools": req.tools,
            "permission_mode": req.permission_mode,
            "session": req.session_id,
        });

        let send_deadline = self.config.agent_timeout + Duration::from_secs(60);
        let response = match tokio::time::timeout(send_deadline, self.http.post(&url).json(&body).send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(%err, "gateway request failed");
                return Err(ErrorType::classify(&err.to_string(), err.status().map(|s| s.as_u16())));
            }
            Err(_) => return Err(ErrorType::Timeout),
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(ErrorType::classify(&text, Some(status)));
        }

        let mut stream = response.bytes_stream();
        let mut parser = StreamParser::new();
        let mut buf = String::new();
        let mut partial_text = String::new();
        let mut final_event: Option<StreamEvent> = None;

        let drain = self.drain_gateway_stream(
            &mut stream,
            &mut parser,
            &mut buf,
            &mut partial_text,
            &mut final_event,
            &req.agent,
        );

        let mut timed_out = false;
        match tokio::time::timeout(self.config.agent_timeout, drain).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                timed_out = true;
                let drain_more = self.drain_gateway_stream(
                    &mut stream,
                    &mut parser,
                    &mut buf,
                    &mut partial_text,
                    &mut final_event,
                    &req.agent,
                );
                let _ = tokio::time::timeout(self.config.graceful_drain, drain_more).await;
            }
        }

        if timed_out {
            return Ok(RunnerOutcome {
                success: false,
                error_type: Some(ErrorType::Timeout),
                message: Some("agent invocation timed out".to_string()),
                partial_result: Some(partial_text),
                result: String::new(),
                cost_usd: 0.0,
                duration_sec: 0.0,
                num_turns: 0,
                session_id: parser.recovered_session_id().or_else(|| req.session_id.clone()),
            });
        }

        match final_event {
            Some(StreamEvent::Result {
                result,
                cost_usd,
                num_turns,
                session_id,
            }) => Ok(RunnerOutcome {
                success: true,
                error_type: None,
                message: None,
                partial_result: None,
                result,
                cost_usd,
                duration_sec: 0.0,
                num_turns,
                session_id: session_id.or_else(|| req.session_id.clone()),
            }),
            _ => {
                debug!(task_id = %req.task_id, "stream ended without a terminal result frame");
                Ok(RunnerOutcome {
                    success: false,
                    error_type: Some(ErrorType::Unknown),
                    message: Some("stream ended without a result frame".to_string()),
                    partial_result: Some(partial_text),
                    result: String::new(),
                    cost_usd: 0.0,
                    duration_sec: 0.0,
                    num_turns: 0,
                    session_id: parser.recovered_session_id().or_else(|| req.session_id.clone()),
                })
            }
        }
    }

    /// Reads chunks until the stream ends or a transport error occurs, feeding each
    /// newline-delimited `data: <json>` frame through `parser` and publishing the resulting
    /// events onto the bus. Cancel-safe: the caller wraps this in `tokio::time::timeout` and
    /// may call it again afterward since it only ever borrows `stream`.
    #[allow(clippy::too_many_arguments)]
    async fn drain_gateway_stream(
        &self,
        stream: &mut (impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin),
        parser: &mut StreamParser,
        buf: &mut String,
        partial_text: &mut String,
        final_event: &mut Option<StreamEvent>,
        agent: &str,
    ) -> Result<(), ErrorType> {
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|err| ErrorType::classify(&err.to_string(), err.status().map(|s| s.as_u16())))?;
            buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                let line = line.trim_end_matches(['\r', '\n']);
                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                let Ok(value) = serde_json::from_str::<Value>(payload) else {
                    continue;
                };

                for event in parser.ingest(value) {
                    if let StreamEvent::Assistant { text: Some(text) } = &event {
                        partial_text.push_str(text);
                    }
                    if matches!(event, StreamEvent::Result { .. }) {
                        *final_event = Some(event.clone());
                    }
                    self.bus.publish(agent, event).await;
                }
            }
        }
        Ok(())
    }

    async fn invoke_alternate(&self, req: &InvokeRequest) -> Result<RunnerOutcome, ErrorType> {
        let mut command = Command::new(&self.config.alternate_cli_path);
        command
            .arg("--model")
            .arg(&req.model)
            .arg("--permission-mode")
            .arg(&req.permission_mode)
            .current_dir(&req.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(session_id) = &req.session_id {
            command.arg("--session").arg(session_id);
        }
        if !req.tools.is_empty() {
            command.arg("--tools").arg(req.tools.join(","));
        }

        let mut child = command
            .spawn()
            .map_err(|err| ErrorType::classify(&err.to_string(), None))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(req.prompt.as_bytes()).await;
        }

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));

        if let Some(mut stdout) = child.stdout.take() {
            let stdout_buf = stdout_buf.clone();
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stdout.read_to_string(&mut buf).await;
                *stdout_buf.lock().await = buf;
            });
        }
        if let Some(mut stderr) = child.stderr.take() {
            let stderr_buf = stderr_buf.clone();
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                *stderr_buf.lock().await = buf;
            });
        }

        let mut timed_out = false;
        let status = match tokio::time::timeout(self.config.agent_timeout, child.wait()).await {
            Ok(status) => status.ok(),
            Err(_) => match tokio::time::timeout(self.config.graceful_drain, child.wait()).await {
                Ok(status) => status.ok(),
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    timed_out = true;
                    None
                }
            },
        };

        // Give the reader tasks a moment to flush what they already captured.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stdout_text = stdout_buf.lock().await.clone();
        let stderr_text = stderr_buf.lock().await.clone();

        if timed_out {
            return Ok(RunnerOutcome {
                success: false,
                error_type: Some(ErrorType::Timeout),
                message: Some("agent invocation timed out".to_string()),
                partial_result: Some(stdout_text),
                result: String::new(),
                cost_usd: 0.0,
                duration_sec: 0.0,
                num_turns: 0,
                session_id: req.session_id.clone(),
            });
        }

        match status {
            Some(status) if status.success() => {
                let parsed: Value = serde_json::from_str(&stdout_text).unwrap_or(Value::Null);
                let event = StreamEvent::Result {
                    result: parsed
                        .get("result")
                        .and_then(Value::as_str)
                        .unwrap_or(stdout_text.trim())
                        .to_string(),
                    cost_usd: parsed.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0),
                    num_turns: parsed.get("num_turns").and_then(Value::as_u64).unwrap_or(1) as u32,
                    session_id: parsed
                        .get("session_id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| req.session_id.clone()),
                };
                self.bus.publish(&req.agent, event.clone()).await;
                let StreamEvent::Result {
                    result,
                    cost_usd,
                    num_turns,
                    session_id,
                } = event
                else {
                    unreachable!()
                };
                Ok(RunnerOutcome {
                    success: true,
                    error_type: None,
                    message: None,
                    partial_result: None,
                    result,
                    cost_usd,
                    duration_sec: 0.0,
                    num_turns,
                    session_id,
                })
            }
            _ => Err(ErrorType::classify(&stderr_text, None)),
        }
    }
}
