//! Subprocess CLI adapter
//!
//! Wraps the `claude` CLI as the full-capability provider. The child is
//! spawned in its own process group with `--output-format stream-json`; this
//! adapter parses the line-delimited JSON events from stdout, mirrors the
//! assistant's text and one-line tool summaries into the live log, and
//! enforces both the abort flag (SIGTERM, then SIGKILL after a grace
//! period) and the execution deadline.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::gates::ProjectDir;

use super::{
    Availability, Capabilities, ExecutionContext, ExecutionResult, Pricing, ProviderAdapter, TokenUsage,
};

/// Model names accepted on the CLI command line
static MODEL_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._:/-]+$").expect("model name regex"));

/// How often the abort flag is polled while the child runs
const ABORT_POLL: Duration = Duration::from_secs(3);

/// Grace between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(5);

const MODELS: &[&str] = &["sonnet", "opus", "haiku"];

/// The `claude` CLI as a provider
pub struct ClaudeCliAdapter {
    binary: String,
}

impl ClaudeCliAdapter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Binary from `FOREMAN_CLAUDE_BIN`, default `claude`
    pub fn from_env() -> Self {
        Self::new(std::env::var("FOREMAN_CLAUDE_BIN").unwrap_or_else(|_| "claude".to_string()))
    }

    /// Write the MCP config for this execution: empty when tools are off,
    /// a project-scoped server command pointing at the tools transport
    /// otherwise. Returns the config path.
    fn write_mcp_config(&self, ctx: &ExecutionContext) -> std::io::Result<PathBuf> {
        let dir = ProjectDir::for_project(&ctx.project_id);
        std::fs::create_dir_all(dir.root())?;
        let path = dir.root().join("mcp.json");

        let config = if ctx.enable_tools {
            let exe = std::env::current_exe()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "fm".to_string());
            serde_json::json!({
                "mcpServers": {
                    "foreman": {
                        "command": exe,
                        "args": ["tools-serve", &ctx.project_id],
                    }
                }
            })
        } else {
            serde_json::json!({ "mcpServers": {} })
        };

        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        Ok(path)
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeCliAdapter {
    fn id(&self) -> &'static str {
        "claude-cli"
    }

    fn name(&self) -> &'static str {
        "Claude CLI"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }

    fn models(&self) -> &[&'static str] {
        MODELS
    }

    fn pricing(&self, _model: &str) -> Pricing {
        // Alias models are billed through the CLI subscription
        Pricing::default()
    }

    async fn detect(&self) -> Availability {
        let probe = Command::new(&self.binary)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();

        match tokio::time::timeout(Duration::from_secs(5), probe).await {
            Ok(Ok(status)) if status.success() => Availability::up(),
            Ok(Ok(status)) => Availability::down(format!("{} exited with {}", self.binary, status)),
            Ok(Err(e)) => Availability::down(format!("{} not runnable: {}", self.binary, e)),
            Err(_) => Availability::down(format!("{} --version timed out", self.binary)),
        }
    }

    async fn execute(&self, ctx: &ExecutionContext) -> ExecutionResult {
        let start = Instant::now();

        if !MODEL_NAME.is_match(&ctx.model) {
            return ExecutionResult::failed(format!("invalid model name: {:?}", ctx.model), 0);
        }

        let mcp_config = match self.write_mcp_config(ctx) {
            Ok(path) => path,
            Err(e) => return ExecutionResult::failed(format!("failed to write MCP config: {}", e), 0),
        };

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(&ctx.prompt)
            .arg("--model")
            .arg(&ctx.model)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--mcp-config")
            .arg(&mcp_config);
        if !ctx.system_prompt.is_empty() {
            cmd.arg("--append-system-prompt").arg(&ctx.system_prompt);
        }
        if let Some(session) = &ctx.session_id {
            cmd.arg("--resume").arg(session);
        }
        if let Some(cwd) = &ctx.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::failed(
                    format!("failed to spawn {}: {}", self.binary, e),
                    start.elapsed().as_millis() as u64,
                );
            }
        };

        let pid = child.id();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return ExecutionResult::failed("no stdout pipe from CLI child", start.elapsed().as_millis() as u64);
        };
        let mut lines = BufReader::new(stdout).lines();

        let mut state = StreamState::default();
        let mut ticker = tokio::time::interval(ABORT_POLL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep(ctx.timeout);
        tokio::pin!(deadline);

        let mut termed_at: Option<Instant> = None;
        let mut aborted = false;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => handle_line(&line, &mut state, ctx),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "stdout read error from CLI child");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let abort_set = ctx.abort.as_ref().map(|a| a.is_set()).unwrap_or(false);
                    if abort_set && termed_at.is_none() {
                        warn!(?pid, "Abort flag set, terminating CLI child");
                        aborted = true;
                        kill_group(pid, nix::sys::signal::Signal::SIGTERM);
                        termed_at = Some(Instant::now());
                    }
                    if let Some(t) = termed_at
                        && t.elapsed() >= KILL_GRACE
                    {
                        kill_group(pid, nix::sys::signal::Signal::SIGKILL);
                    }
                }
                _ = &mut deadline => {
                    warn!(?pid, "Execution deadline reached, killing CLI child");
                    kill_group(pid, nix::sys::signal::Signal::SIGKILL);
                    let _ = child.wait().await;
                    return ExecutionResult::failed("timed out", start.elapsed().as_millis() as u64);
                }
            }
        }

        let status = child.wait().await;
        let duration_ms = start.elapsed().as_millis() as u64;

        if aborted {
            return ExecutionResult::failed("terminated by SIGTERM (abort requested)", duration_ms);
        }

        if let Some(error) = state.error {
            return ExecutionResult {
                success: false,
                output: state.output,
                error_kind: Some(super::classify(&error)),
                error: Some(error),
                duration_ms,
                usage: state.usage,
            };
        }

        match status {
            Ok(s) if s.success() => ExecutionResult {
                success: true,
                output: state.output,
                error: None,
                error_kind: None,
                duration_ms,
                usage: state.usage,
            },
            Ok(s) => ExecutionResult::failed(format!("{} exited with {}", self.binary, s), duration_ms),
            Err(e) => ExecutionResult::failed(format!("wait failed: {}", e), duration_ms),
        }
    }
}

/// Send a signal to the child's whole process group
fn kill_group(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::unistd::Pid;
        if let Err(e) = nix::sys::signal::killpg(Pid::from_raw(pid as i32), signal) {
            debug!(pid, ?signal, error = %e, "killpg failed");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}

/// Accumulated state from the stream-json events
#[derive(Debug, Default)]
struct StreamState {
    output: String,
    usage: Option<TokenUsage>,
    error: Option<String>,
}

/// Handle one line of stream-json output
fn handle_line(line: &str, state: &mut StreamState, ctx: &ExecutionContext) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let Ok(event) = serde_json::from_str::<Value>(line) else {
        debug!(line, "Non-JSON line from CLI child");
        return;
    };

    match event["type"].as_str() {
        Some("system") => {
            if event["subtype"].as_str() == Some("init") {
                let session = event["session_id"].as_str().unwrap_or("-");
                debug!(session, "CLI session initialized");
            }
            // Other system subtypes are noise; keep the log clean
        }
        Some("assistant") => {
            let blocks = event["message"]["content"].as_array();
            for block in blocks.into_iter().flatten() {
                match block["type"].as_str() {
                    Some("text") => {
                        if let Some(text) = block["text"].as_str() {
                            if !state.output.is_empty() {
                                state.output.push('\n');
                            }
                            state.output.push_str(text);
                            for rendered in text.lines().filter(|l| !l.trim().is_empty()) {
                                ctx.log_line(rendered);
                            }
                        }
                    }
                    Some("tool_use") => {
                        let name = block["name"].as_str().unwrap_or("tool");
                        ctx.log_line(&summarize_tool(name, &block["input"]));
                    }
                    _ => {}
                }
            }
        }
        Some("result") => {
            if let Some(usage) = event.get("usage").or_else(|| event["message"].get("usage")) {
                let input = usage["input_tokens"].as_u64().unwrap_or(0)
                    + usage["cache_creation_input_tokens"].as_u64().unwrap_or(0)
                    + usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
                state.usage = Some(TokenUsage {
                    input_tokens: input,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
                });
            }
            if event["is_error"].as_bool().unwrap_or(false) {
                let message = event["result"]
                    .as_str()
                    .or_else(|| event["error"].as_str())
                    .unwrap_or("CLI reported an error");
                state.error = Some(message.to_string());
            }
        }
        // tool results and unknown event types are deliberately ignored
        _ => {}
    }
}

/// One-line human-readable summary of a tool call for the live log
fn summarize_tool(name: &str, input: &Value) -> String {
    let path = input["file_path"].as_str().or_else(|| input["path"].as_str());
    match name {
        "Read" => format!("Read {}", path.unwrap_or("?")),
        "Write" => format!("Write {}", path.unwrap_or("?")),
        "Edit" => format!("Edit {}", path.unwrap_or("?")),
        "Bash" => {
            let cmd = input["command"].as_str().unwrap_or("?");
            let truncated: String = cmd.chars().take(80).collect();
            if cmd.chars().count() > 80 {
                format!("Bash: {}…", truncated)
            } else {
                format!("Bash: {}", truncated)
            }
        }
        "Glob" | "Grep" => format!("{} {}", name, input["pattern"].as_str().unwrap_or("?")),
        other => other.to_string(),
    }
}
