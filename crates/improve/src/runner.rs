//! Agent execution.
//!
//! `AgentRunner` is the seam between the pipeline and the agent CLIs. The
//! CLI runner spawns `claude` or `codex` with JSON streaming output, records
//! tool calls as they happen, and folds every transport problem into a
//! non-success `StepResult`.

use crate::event_log::EventLog;
use async_trait::async_trait;
use chrono::Utc;
use improve_core::{BackendKind, EventKind, StepKind, StepResult};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages during long-running agent calls.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for draining stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes of text kept in memory per stream.
const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub improvement_id: u32,
    pub step: StepKind,
    pub attempt: u32,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub model: String,
    pub backend: BackendKind,
    pub max_turns: u32,
    /// Directory receiving `<step>-<attempt>.log`.
    pub artifact_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl AgentRequest {
    pub fn log_path(&self) -> PathBuf {
        self.artifact_dir
            .join(format!("{}-{}.log", self.step.as_str(), self.attempt))
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Execute one step. Never fails: errors become `success = false`.
    async fn run(&self, request: AgentRequest) -> StepResult;
}

impl std::fmt::Debug for dyn AgentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AgentRunner")
    }
}

/// Runs the configured agent CLI as a subprocess.
#[derive(Debug)]
pub struct CliAgentRunner {
    /// Overrides the backend's default executable.
    bin: Option<PathBuf>,
    timeout_sec: u32,
    events: Arc<EventLog>,
}

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

impl CliAgentRunner {
    pub fn new(bin: Option<PathBuf>, timeout_sec: u32, events: Arc<EventLog>) -> Self {
        Self {
            bin,
            timeout_sec,
            events,
        }
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let bin = self
            .bin
            .clone()
            .unwrap_or_else(|| PathBuf::from(request.backend.default_bin()));
        let mut cmd = Command::new(bin);
        match request.backend {
            BackendKind::Claude => {
                cmd.arg("-p")
                    .arg("--verbose")
                    .arg("--dangerously-skip-permissions")
                    .arg("--output-format")
                    .arg("stream-json")
                    .arg("--model")
                    .arg(&request.model)
                    .arg("--max-turns")
                    .arg(request.max_turns.to_string())
                    .arg(&request.prompt);
            }
            BackendKind::Codex => {
                cmd.arg("exec")
                    .arg("--json")
                    .arg("--dangerously-bypass-approvals-and-sandbox")
                    .arg("--model")
                    .arg(&request.model)
                    .arg(&request.prompt);
            }
        }
        cmd.current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn execute(&self, request: &AgentRequest) -> std::io::Result<StepResult> {
        std::fs::create_dir_all(&request.artifact_dir)?;
        let log_path = request.log_path();
        let start = Utc::now();

        debug!(
            improvement_id = request.improvement_id,
            step = %request.step,
            model = %request.model,
            working_dir = %request.working_dir.display(),
            "spawning agent process"
        );
        let mut child = self.command(request).spawn()?;

        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(consume_stream(
                stdout,
                request.backend,
                log_path.clone(),
                StreamContext {
                    events: Arc::clone(&self.events),
                    improvement_id: request.improvement_id,
                    step: request.step,
                },
            ))
        });
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        let started = Instant::now();
        let timeout_duration = Duration::from_secs(u64::from(self.timeout_sec));

        let outcome = loop {
            let elapsed = started.elapsed();
            if self.timeout_sec > 0 && elapsed >= timeout_duration {
                warn!(
                    improvement_id = request.improvement_id,
                    step = %request.step,
                    timeout_sec = self.timeout_sec,
                    "agent timed out; killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill timed-out agent");
                }
                if let Err(err) = child.wait().await {
                    warn!(error = %err, "failed to reap timed-out agent");
                }
                break ProcessOutcome::TimedOut;
            }

            let remaining = if self.timeout_sec > 0 {
                timeout_duration.saturating_sub(elapsed)
            } else {
                Duration::MAX
            };

            tokio::select! {
                result = child.wait() => break ProcessOutcome::Completed(result?),
                () = request.cancel.cancelled() => {
                    info!(
                        improvement_id = request.improvement_id,
                        step = %request.step,
                        "cancellation requested; killing agent"
                    );
                    if let Err(err) = child.kill().await {
                        warn!(error = %err, "failed to kill cancelled agent");
                    }
                    if let Err(err) = child.wait().await {
                        warn!(error = %err, "failed to reap cancelled agent");
                    }
                    break ProcessOutcome::Cancelled;
                }
                () = tokio::time::sleep(HEARTBEAT_INTERVAL.min(remaining)) => {
                    info!(
                        improvement_id = request.improvement_id,
                        step = %request.step,
                        attempt = request.attempt,
                        elapsed_sec = started.elapsed().as_secs(),
                        "agent still running"
                    );
                }
            }
        };

        let stream = match stdout_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(stream))) => stream,
                Ok(Ok(Err(err))) => {
                    warn!(error = %err, "stdout capture failed");
                    StreamSummary::default()
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "stdout task panicked");
                    StreamSummary::default()
                }
                Err(_) => {
                    warn!("stdout capture timed out");
                    StreamSummary::default()
                }
            },
            None => StreamSummary::default(),
        };
        let stderr = match stderr_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(buf))) => buf,
                _ => Vec::new(),
            },
            None => Vec::new(),
        };

        if !stderr.is_empty() {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await?;
            file.write_all(b"\n\n--- STDERR ---\n").await?;
            file.write_all(&stderr).await?;
        }

        let wall_ms = (Utc::now() - start).num_milliseconds() as u64;
        let mut result = stream.into_result(request.backend, wall_ms);

        match outcome {
            ProcessOutcome::TimedOut => {
                result.success = false;
                result.error = Some(format!("timed out after {} seconds", self.timeout_sec));
            }
            ProcessOutcome::Cancelled => {
                result.success = false;
                result.error = Some("cancelled".to_string());
            }
            ProcessOutcome::Completed(status) => {
                let exit_code = status.code().unwrap_or(-1);
                if exit_code != 0 {
                    result.success = false;
                    let stderr_tail = String::from_utf8_lossy(&stderr);
                    let stderr_tail = stderr_tail.lines().last().unwrap_or("").trim();
                    result.error = Some(if stderr_tail.is_empty() {
                        format!("exit code {exit_code}")
                    } else {
                        format!("exit code {exit_code}: {stderr_tail}")
                    });
                }
            }
        }

        info!(
            improvement_id = request.improvement_id,
            step = %request.step,
            attempt = request.attempt,
            success = result.success,
            turns = result.turns,
            cost_usd = result.cost_usd,
            duration_ms = result.duration_ms,
            "agent step complete"
        );
        Ok(result)
    }
}

#[async_trait]
impl AgentRunner for CliAgentRunner {
    async fn run(&self, request: AgentRequest) -> StepResult {
        let start = Instant::now();
        match self.execute(&request).await {
            Ok(result) => result,
            Err(err) => {
                let message = if err.kind() == std::io::ErrorKind::NotFound {
                    format!("{} CLI not found", request.backend.as_str())
                } else {
                    format!("agent io error: {err}")
                };
                warn!(
                    improvement_id = request.improvement_id,
                    step = %request.step,
                    error = %message,
                    "agent step failed to run"
                );
                StepResult::failed(
                    request.backend,
                    message,
                    start.elapsed().as_millis() as u64,
                )
            }
        }
    }
}

// --- Stream parsing ---

/// One meaningful piece of a JSON stream line.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Text(String),
    ToolUse(String),
    Usage(UsageReport),
}

/// Final accounting reported by the agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageReport {
    pub turns: Option<u32>,
    pub cost_usd: Option<f64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub duration_ms: Option<u64>,
    pub result: Option<String>,
    pub is_error: bool,
}

/// Parse one line of agent JSON output. Non-JSON lines are plain text.
pub fn parse_stream_line(backend: BackendKind, line: &str) -> Vec<StreamItem> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return vec![StreamItem::Text(format!("{line}\n"))],
    };
    match backend {
        BackendKind::Claude => parse_claude_event(&value),
        BackendKind::Codex => parse_codex_event(&value),
    }
}

fn parse_claude_event(event: &Value) -> Vec<StreamItem> {
    match event.get("type").and_then(Value::as_str) {
        Some("assistant") => event
            .pointer("/message/content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                        Some("text") => block
                            .get("text")
                            .and_then(Value::as_str)
                            .map(|t| StreamItem::Text(format!("{t}\n"))),
                        Some("tool_use") => block
                            .get("name")
                            .and_then(Value::as_str)
                            .map(|n| StreamItem::ToolUse(n.to_string())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        Some("result") => vec![StreamItem::Usage(UsageReport {
            turns: event.get("num_turns").and_then(Value::as_u64).map(|n| n as u32),
            cost_usd: event.get("total_cost_usd").and_then(Value::as_f64),
            input_tokens: event.pointer("/usage/input_tokens").and_then(Value::as_u64),
            output_tokens: event.pointer("/usage/output_tokens").and_then(Value::as_u64),
            duration_ms: event.get("duration_ms").and_then(Value::as_u64),
            result: event
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string),
            is_error: event
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })],
        _ => Vec::new(),
    }
}

fn parse_codex_event(event: &Value) -> Vec<StreamItem> {
    match event.get("type").and_then(Value::as_str) {
        Some("item.completed") => {
            let item = event.get("item");
            match item.and_then(|i| i.get("type")).and_then(Value::as_str) {
                Some("agent_message") => item
                    .and_then(|i| i.get("text"))
                    .and_then(Value::as_str)
                    .map(|t| vec![StreamItem::Text(format!("{t}\n"))])
                    .unwrap_or_default(),
                Some(kind @ ("command_execution" | "file_change" | "mcp_tool_call")) => {
                    vec![StreamItem::ToolUse(kind.to_string())]
                }
                _ => Vec::new(),
            }
        }
        Some("turn.completed") => vec![StreamItem::Usage(UsageReport {
            turns: Some(1),
            input_tokens: event.pointer("/usage/input_tokens").and_then(Value::as_u64),
            output_tokens: event.pointer("/usage/output_tokens").and_then(Value::as_u64),
            ..UsageReport::default()
        })],
        Some("turn.failed" | "error") => vec![StreamItem::Usage(UsageReport {
            is_error: true,
            ..UsageReport::default()
        })],
        _ => Vec::new(),
    }
}

/// Accumulated view of an agent's stdout.
#[derive(Debug, Default)]
struct StreamSummary {
    text: String,
    usage: UsageReport,
    truncated: bool,
}

impl StreamSummary {
    fn push(&mut self, item: StreamItem) {
        match item {
            StreamItem::Text(text) => {
                if self.truncated {
                    return;
                }
                if self.text.len() + text.len() > MAX_OUTPUT_BYTES {
                    warn!(max_bytes = MAX_OUTPUT_BYTES, "agent text exceeded limit, truncating");
                    self.truncated = true;
                    return;
                }
                self.text.push_str(&text);
            }
            StreamItem::ToolUse(_) => {}
            StreamItem::Usage(report) => {
                // Codex reports per turn; sum them. Claude reports once.
                let usage = &mut self.usage;
                usage.turns = add(usage.turns, report.turns);
                usage.input_tokens = add(usage.input_tokens, report.input_tokens);
                usage.output_tokens = add(usage.output_tokens, report.output_tokens);
                usage.cost_usd = report.cost_usd.or(usage.cost_usd);
                usage.duration_ms = report.duration_ms.or(usage.duration_ms);
                usage.result = report.result.or(usage.result.take());
                usage.is_error |= report.is_error;
            }
        }
    }

    fn into_result(self, backend: BackendKind, wall_ms: u64) -> StepResult {
        let output = if self.text.trim().is_empty() {
            self.usage.result.unwrap_or_default()
        } else {
            self.text
        };
        StepResult {
            backend,
            success: !self.usage.is_error,
            turns: self.usage.turns.unwrap_or(0),
            cost_usd: self.usage.cost_usd.unwrap_or(0.0),
            input_tokens: self.usage.input_tokens.unwrap_or(0),
            output_tokens: self.usage.output_tokens.unwrap_or(0),
            duration_ms: self.usage.duration_ms.unwrap_or(wall_ms),
            output,
            error: self
                .usage
                .is_error
                .then(|| "agent reported an error".to_string()),
        }
    }
}

fn add<T: std::ops::Add<Output = T>>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    }
}

struct StreamContext {
    events: Arc<EventLog>,
    improvement_id: u32,
    step: StepKind,
}

/// Parse agent stdout line by line, streaming extracted text to `log_path`.
async fn consume_stream<R: AsyncRead + Unpin>(
    reader: R,
    backend: BackendKind,
    log_path: PathBuf,
    ctx: StreamContext,
) -> std::io::Result<StreamSummary> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .await?;

    let mut lines = tokio::io::BufReader::new(reader).lines();
    let mut summary = StreamSummary::default();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        for item in parse_stream_line(backend, trimmed) {
            match &item {
                StreamItem::Text(text) => file.write_all(text.as_bytes()).await?,
                StreamItem::ToolUse(tool) => {
                    debug!(improvement_id = ctx.improvement_id, tool = %tool, "tool call");
                    ctx.events.emit(EventKind::ToolCall {
                        improvement_id: ctx.improvement_id,
                        step: ctx.step,
                        tool: tool.clone(),
                    });
                }
                StreamItem::Usage(_) => {}
            }
            summary.push(item);
        }
    }

    file.flush().await?;
    Ok(summary)
}

/// Read from an async reader with a maximum byte limit.
async fn read_bounded<R: AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }
        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }

    Ok(buf)
}
