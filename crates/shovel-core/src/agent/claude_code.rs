//! Claude Code agent driver.
//!
//! Spawns `claude -p --output-format stream-json` in the instance workspace,
//! feeds it the prompt on stdin, and turns its JSONL output into
//! [`AgentEvent`]s that drive an [`AgentSession`].

use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::prompt::{ALLOWED_TOOLS, build_user_prompt, system_prompt};
use super::trajectory::TrajectoryLog;
use super::types::{AgentError, AgentEvent, AgentOutput, AgentSession, ProviderFailureKind};
use super::AgentDriver;
use crate::instance::Instance;
use crate::workspace::{WorkspaceInfo, sanitize_instance_id};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

/// Settings for [`ClaudeCodeDriver`].
#[derive(Debug, Clone)]
pub struct ClaudeCodeConfig {
    /// Path to the `claude` binary. `"claude"` resolves via `$PATH`.
    pub binary: String,
    pub model: String,
    /// Longest silence tolerated between two stream events.
    pub turn_timeout: Duration,
    /// Extra attempts after a transient provider failure.
    pub provider_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// How long to wait after SIGTERM before SIGKILL.
    pub kill_grace: Duration,
    /// Trajectory log directory; `None` disables trajectories.
    pub log_dir: Option<PathBuf>,
    /// Build dirs are `<project_dir>/tmp/docker_build_<instance_id>`.
    pub project_dir: PathBuf,
}

impl ClaudeCodeConfig {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: "claude".to_string(),
            model: DEFAULT_MODEL.to_string(),
            turn_timeout: Duration::from_secs(600),
            provider_retries: 2,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
            log_dir: None,
            project_dir: project_dir.into(),
        }
    }
}

/// [`AgentDriver`] backed by the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCodeDriver {
    config: ClaudeCodeConfig,
}

impl ClaudeCodeDriver {
    pub fn new(config: ClaudeCodeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClaudeCodeConfig {
        &self.config
    }

    /// Build dir handed to the agent for `docker build` contexts.
    pub fn build_dir(&self, instance_id: &str) -> PathBuf {
        self.config
            .project_dir
            .join("tmp")
            .join(format!("docker_build_{}", sanitize_instance_id(instance_id)))
    }

    fn command(&self, workspace: &WorkspaceInfo, max_turns: u32) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&self.config.model)
            .arg("--max-turns")
            .arg(max_turns.to_string())
            .arg("--permission-mode")
            .arg("bypassPermissions")
            .arg("--allowedTools")
            .arg(ALLOWED_TOOLS.join(","))
            .arg("--append-system-prompt")
            .arg(system_prompt());

        cmd.current_dir(&workspace.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn(&self, workspace: &WorkspaceInfo, max_turns: u32) -> Result<Child> {
        self.command(workspace, max_turns).spawn().with_context(|| {
            format!(
                "failed to spawn claude binary at '{}' -- is it installed and on PATH?",
                self.config.binary
            )
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .retry_base_delay
            .saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.config.retry_max_delay);
        let jitter_ms = u64::try_from(capped.as_millis() / 4).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    async fn run_once(
        &self,
        instance: &Instance,
        workspace: &WorkspaceInfo,
        max_turns: u32,
        attempt: u32,
    ) -> Result<AgentOutput, AgentError> {
        let instance_id = instance.instance_id.as_str();
        let user_prompt = build_user_prompt(instance, &self.build_dir(instance_id));
        let mut trajectory = self
            .config
            .log_dir
            .as_deref()
            .map(|dir| TrajectoryLog::create(dir, instance_id, attempt, &user_prompt));

        info!(
            instance_id,
            attempt,
            model = %self.config.model,
            cwd = %workspace.path.display(),
            "starting agent"
        );
        let started = Instant::now();

        let outcome = self
            .drive(instance_id, workspace, max_turns, &user_prompt, &mut trajectory)
            .await;

        if let Some(log) = trajectory {
            log.finish(match &outcome {
                Ok(_) => "completed",
                Err(AgentError::TurnLimitExceeded { .. }) => "turn_limit_exceeded",
                Err(AgentError::MalformedOutput(_)) => "malformed_output",
                Err(AgentError::ProviderFailure { .. }) => "provider_failure",
            });
        }

        match &outcome {
            Ok(out) => match out.cost_usd {
                Some(cost) => info!(
                    instance_id,
                    turns = out.turns,
                    "agent completed: {} turns, ${cost:.4}, duration={}",
                    out.turns,
                    format_elapsed(started.elapsed())
                ),
                None => info!(
                    instance_id,
                    turns = out.turns,
                    "agent completed: {} turns, duration={}",
                    out.turns,
                    format_elapsed(started.elapsed())
                ),
            },
            Err(e) => warn!(instance_id, attempt, error = %e, "agent attempt failed"),
        }
        outcome
    }

    async fn drive(
        &self,
        instance_id: &str,
        workspace: &WorkspaceInfo,
        max_turns: u32,
        user_prompt: &str,
        trajectory: &mut Option<TrajectoryLog>,
    ) -> Result<AgentOutput, AgentError> {
        let mut child = self
            .spawn(workspace, max_turns)
            .map_err(|e| AgentError::fatal(format!("{e:#}")))?;

        // `claude -p` reads the user prompt from stdin until EOF.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(user_prompt.as_bytes()).await {
                warn!(instance_id, error = %e, "failed to write prompt to agent stdin");
            }
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::fatal("agent stdout was not captured"))?;
        let stderr_tail = child.stderr.take().map(|s| tokio::spawn(read_tail(s)));

        let mut events = event_stream(stdout);
        let mut session = AgentSession::new(max_turns);

        let streamed = loop {
            match tokio::time::timeout(self.config.turn_timeout, events.next()).await {
                Err(_elapsed) => {
                    break Err(AgentError::transient(format!(
                        "agent produced no output for {}s (timeout)",
                        self.config.turn_timeout.as_secs()
                    )));
                }
                Ok(None) | Ok(Some(AgentEvent::Completed)) => break Ok(()),
                Ok(Some(event)) => {
                    log_event(instance_id, session.turns(), &event);
                    if let Some(log) = trajectory.as_mut() {
                        log.record(&event);
                    }
                    if let Err(e) = session.record(event) {
                        break Err(e);
                    }
                }
            }
        };
        drop(events);

        let outcome = match streamed {
            Ok(()) => {
                let exit_code = self.wait_exit(instance_id, &mut child).await;
                session.finish(exit_code)
            }
            Err(e) => {
                terminate(instance_id, &mut child, self.config.kill_grace).await;
                Err(e)
            }
        };

        // A killed agent can leave grandchildren holding stderr open.
        let stderr = match stderr_tail {
            Some(mut handle) => {
                match tokio::time::timeout(self.config.kill_grace, &mut handle).await {
                    Ok(Ok(tail)) => tail,
                    _ => {
                        handle.abort();
                        String::new()
                    }
                }
            }
            None => String::new(),
        };
        outcome.map_err(|e| with_stderr(e, &stderr))
    }

    async fn wait_exit(&self, instance_id: &str, child: &mut Child) -> Option<i32> {
        match tokio::time::timeout(self.config.kill_grace, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                warn!(instance_id, error = %e, "failed to wait for agent process");
                None
            }
            Err(_) => {
                debug!(instance_id, "agent closed stdout but did not exit");
                terminate(instance_id, child, self.config.kill_grace).await;
                None
            }
        }
    }
}

#[async_trait]
impl AgentDriver for ClaudeCodeDriver {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn run(
        &self,
        instance: &Instance,
        workspace: &WorkspaceInfo,
        max_turns: u32,
    ) -> Result<AgentOutput, AgentError> {
        let mut attempt = 0;
        loop {
            match self.run_once(instance, workspace, max_turns, attempt + 1).await {
                Err(e) if e.is_transient() && attempt < self.config.provider_retries => {
                    let delay = self.backoff_delay(attempt);
                    attempt += 1;
                    warn!(
                        instance_id = %instance.instance_id,
                        retry = attempt,
                        of = self.config.provider_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient provider failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Fold captured stderr into a provider failure; a transient-looking stderr
/// upgrades a fatal failure.
fn with_stderr(err: AgentError, stderr: &str) -> AgentError {
    let stderr = stderr.trim();
    match err {
        AgentError::ProviderFailure { kind, message } if !stderr.is_empty() => {
            let message = format!("{message}; stderr: {stderr}");
            match kind {
                ProviderFailureKind::Transient => AgentError::transient(message),
                ProviderFailureKind::Fatal => AgentError::provider(message),
            }
        }
        other => other,
    }
}

async fn read_tail(mut stderr: ChildStderr) -> String {
    const KEEP: usize = 2000;
    let mut buf = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut buf).await {
        debug!(error = %e, "error reading agent stderr");
    }
    let text = String::from_utf8_lossy(&buf);
    let skip = text.chars().count().saturating_sub(KEEP);
    text.chars().skip(skip).collect()
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(instance_id: &str, child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(instance_id, pid, "SIGTERM failed, proceeding to SIGKILL");
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => debug!(instance_id, "agent exited after SIGTERM"),
        _ => {
            debug!(instance_id, "agent did not exit after SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
}

/// Stream parsed events from the agent's stdout, ending with `Completed`.
fn event_stream(stdout: ChildStdout) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
    let stream = async_stream::stream! {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match parse_stream_json_line(trimmed) {
                        Ok(events) => {
                            for event in events {
                                yield event;
                            }
                        }
                        Err(e) => {
                            warn!(line = trimmed, error = %e, "skipping malformed JSONL line");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "error reading agent stdout");
                    yield AgentEvent::Error {
                        message: format!("stdout read error: {e}"),
                    };
                    break;
                }
            }
        }
        yield AgentEvent::Completed;
    };
    Box::pin(stream)
}

fn usage_event(usage: &serde_json::Value) -> Option<AgentEvent> {
    let input_tokens = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let output_tokens = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    (input_tokens > 0 || output_tokens > 0).then_some(AgentEvent::TokenUsage {
        input_tokens,
        output_tokens,
    })
}

/// Parse one stream-json line into zero or more events.
///
/// `Err` means the line was not JSON; callers skip it.
fn parse_stream_json_line(line: &str) -> Result<Vec<AgentEvent>> {
    let v: serde_json::Value =
        serde_json::from_str(line).context("malformed JSON in stream output")?;

    let mut events = Vec::new();
    let str_field = |obj: &serde_json::Value, key: &str| {
        obj.get(key).and_then(|t| t.as_str()).map(str::to_string)
    };

    match v.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "assistant" => {
            events.push(AgentEvent::AssistantTurn);
            let Some(message) = v.get("message") else {
                return Ok(events);
            };
            for block in message
                .get("content")
                .and_then(|c| c.as_array())
                .into_iter()
                .flatten()
            {
                match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text" => {
                        if let Some(text) = str_field(block, "text") {
                            events.push(AgentEvent::Message {
                                role: "assistant".to_string(),
                                content: text,
                            });
                        }
                    }
                    "tool_use" => events.push(AgentEvent::ToolCall {
                        tool: str_field(block, "name").unwrap_or_else(|| "unknown".into()),
                        input: block.get("input").cloned().unwrap_or_default(),
                    }),
                    _ => {}
                }
            }
            if let Some(usage) = message.get("usage").and_then(usage_event) {
                events.push(usage);
            }
        }

        // Tool results come back inside user messages.
        "user" => {
            let blocks = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array());
            for block in blocks.into_iter().flatten() {
                if block.get("type").and_then(|t| t.as_str()) == Some("tool_result") {
                    events.push(AgentEvent::ToolResult {
                        tool: str_field(block, "tool_use_id").unwrap_or_else(|| "unknown".into()),
                        output: block.get("content").cloned().unwrap_or_default(),
                        is_error: block
                            .get("is_error")
                            .and_then(|e| e.as_bool())
                            .unwrap_or(false),
                    });
                }
            }
        }

        "tool_use" => events.push(AgentEvent::ToolCall {
            tool: str_field(&v, "name")
                .or_else(|| str_field(&v, "tool"))
                .unwrap_or_else(|| "unknown".into()),
            input: v.get("input").cloned().unwrap_or_default(),
        }),

        "tool_result" => events.push(AgentEvent::ToolResult {
            tool: str_field(&v, "name")
                .or_else(|| str_field(&v, "tool"))
                .unwrap_or_else(|| "unknown".into()),
            output: v
                .get("output")
                .or_else(|| v.get("content"))
                .cloned()
                .unwrap_or_default(),
            is_error: v.get("is_error").and_then(|e| e.as_bool()).unwrap_or(false),
        }),

        "result" => {
            events.push(AgentEvent::Result {
                subtype: str_field(&v, "subtype").unwrap_or_else(|| "success".into()),
                is_error: v.get("is_error").and_then(|e| e.as_bool()).unwrap_or(false),
                num_turns: v
                    .get("num_turns")
                    .and_then(|n| n.as_u64())
                    .and_then(|n| u32::try_from(n).ok()),
                text: str_field(&v, "result"),
                total_cost_usd: v.get("total_cost_usd").and_then(|c| c.as_f64()),
            });
            if let Some(usage) = v.get("usage").and_then(usage_event) {
                events.push(usage);
            }
        }

        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error")
                .to_string();
            events.push(AgentEvent::Error { message });
        }

        other => {
            debug!(event_type = other, "ignoring unrecognised stream-json event type");
        }
    }

    Ok(events)
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn first_line(s: &str, max: usize) -> String {
    truncate_chars(s.trim().lines().next().unwrap_or(""), max)
}

/// One-line summary of a tool call for the progress log.
pub fn summarize_tool_input(tool: &str, input: &serde_json::Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str()).unwrap_or("");
    let len = |key: &str| field(key).chars().count();
    match tool {
        "Bash" => first_line(field("command"), 120),
        "Read" => field("file_path").to_string(),
        "Write" => format!("{} ({} chars)", field("file_path"), len("content")),
        "Edit" => format!("{} (replacing {} chars)", field("file_path"), len("old_string")),
        "Glob" => field("pattern").to_string(),
        "Grep" => {
            let path = input.get("path").and_then(|v| v.as_str()).unwrap_or(".");
            format!("'{}' in {path}", field("pattern"))
        }
        "NotebookEdit" => {
            let mode = input
                .get("edit_mode")
                .and_then(|v| v.as_str())
                .unwrap_or("replace");
            format!("{} ({mode})", field("notebook_path"))
        }
        "WebFetch" => truncate_chars(field("url"), 120),
        "WebSearch" => field("query").to_string(),
        "TodoWrite" => {
            let n = input
                .get("todos")
                .and_then(|v| v.as_array())
                .map_or(0, Vec::len);
            format!("{n} todos")
        }
        "BashOutput" => format!("shell={}", field("bash_id")),
        "KillBash" => format!("shell={}", field("shell_id")),
        _ => truncate_chars(&input.to_string(), 100),
    }
}

fn log_event(instance_id: &str, turn: u32, event: &AgentEvent) {
    match event {
        AgentEvent::Message { role, content } if role == "assistant" => {
            info!(instance_id, turn, "TEXT: {}", first_line(content, 150));
        }
        AgentEvent::ToolCall { tool, input } => {
            info!(instance_id, turn, "TOOL: {tool}({})", summarize_tool_input(tool, input));
        }
        AgentEvent::ToolResult {
            output,
            is_error: true,
            ..
        } => {
            let preview = match output {
                serde_json::Value::String(s) => truncate_chars(s, 150),
                other => truncate_chars(&other.to_string(), 150),
            };
            warn!(instance_id, "TOOL_ERROR: {preview}");
        }
        AgentEvent::Error { message } => warn!(instance_id, "agent error: {message}"),
        _ => {}
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs >= 60.0 {
        let whole = elapsed.as_secs();
        format!("{}m{}s", whole / 60, whole % 60)
    } else {
        format!("{secs:.1}s")
    }
}
