//! Spawns the AI-CLI subprocess and streams its JSON-lines output (§4.8).
//!
//! State machine: `spawned -> streaming -> {ended-ok | ended-error | timed-out | cancelled}`.
//! Cancellation and the wall-clock deadline race the subprocess's stdout
//! stream via `select!`, generalizing the teacher's single
//! `timeout(child.wait())` shape into SIGTERM-then-SIGKILL-after-grace.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::CliProvider;
use crate::flowlog::{FlowLogHandle, Stream as LogStream};

const STDERR_CAP_BYTES: usize = 64 * 1024;
const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("failed to spawn CLI process: {0}")]
    Spawn(std::io::Error),
    #[error("io error reading CLI output: {0}")]
    Io(#[from] std::io::Error),
    #[error("flow log error: {0}")]
    FlowLog(#[from] crate::flowlog::FlowLogError),
}

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    EndedOk,
    EndedError,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct CliResult {
    pub outcome: Option<Outcome>,
    pub success: bool,
    pub output_text: String,
    pub error_text: Option<String>,
    pub cost_usd: Decimal,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub model: Option<String>,
    /// Set once a terminal `result` event has been parsed off stdout; an
    /// exit code of 0 with no `result` event is not a success (§4.8).
    pub saw_result: bool,
}

/// One decoded line from the CLI's stdout stream (§4.8).
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum AgentEvent {
    SystemInit {
        #[serde(default)]
        model: Option<String>,
    },
    AssistantMessage {
        #[serde(default)]
        text: String,
    },
    ToolCall {
        #[serde(default)]
        name: String,
    },
    ToolResult {
        #[serde(default)]
        name: String,
    },
    Result {
        #[serde(default)]
        cost_usd: Decimal,
        #[serde(default)]
        input_tokens: i64,
        #[serde(default)]
        output_tokens: i64,
    },
}

pub struct RunRequest<'a> {
    pub prompt: &'a str,
    pub workspace: &'a Path,
    pub model: &'a str,
    pub allowed_tools: &'a [String],
    pub deadline: Duration,
}

/// Maps `(prompt, model, allowed_tools)` into an actual CLI invocation; one
/// implementation per supported backend, selected once at startup (§4.8 redesign note).
trait CommandBuilder: Send + Sync {
    fn build(&self, req: &RunRequest<'_>) -> Command;
}

struct ClaudeCommandBuilder;

impl CommandBuilder for ClaudeCommandBuilder {
    fn build(&self, req: &RunRequest<'_>) -> Command {
        let mut cmd = Command::new("claude");
        cmd.current_dir(req.workspace)
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--model")
            .arg(req.model);
        if !req.allowed_tools.is_empty() {
            cmd.arg("--allowed-tools").arg(req.allowed_tools.join(","));
        }
        cmd.arg(req.prompt);
        cmd
    }
}

struct CursorCommandBuilder;

impl CommandBuilder for CursorCommandBuilder {
    fn build(&self, req: &RunRequest<'_>) -> Command {
        let mut cmd = Command::new("cursor-agent");
        cmd.current_dir(req.workspace)
            .arg("run")
            .arg("--json")
            .arg("--model")
            .arg(req.model)
            .arg("--prompt")
            .arg(req.prompt);
        cmd
    }
}

pub struct CliDriver {
    builder: Box<dyn CommandBuilder>,
}

impl CliDriver {
    pub fn new(provider: CliProvider) -> Self {
        let builder: Box<dyn CommandBuilder> = match provider {
            CliProvider::Claude => Box::new(ClaudeCommandBuilder),
            CliProvider::Cursor => Box::new(CursorCommandBuilder),
        };
        Self { builder }
    }

    pub async fn run(
        &self,
        req: RunRequest<'_>,
        flow_log: &FlowLogHandle,
        cancel: CancellationToken,
    ) -> Result<CliResult> {
        let mut cmd = self.builder.build(&req);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(CliError::Spawn)?;
        let mut result = CliResult::default();

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();
        let deadline = tokio::time::sleep(req.deadline);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(raw)) => {
                            self.handle_line(&raw, &mut result, flow_log).await?;
                        }
                        Ok(None) => break self.await_exit(&mut child).await,
                        Err(e) => return Err(CliError::Io(e)),
                    }
                }
                _ = &mut deadline => {
                    terminate(&mut child).await;
                    break Outcome::TimedOut;
                }
                _ = cancel.cancelled() => {
                    terminate(&mut child).await;
                    break Outcome::Cancelled;
                }
            }
        };

        if let Outcome::EndedError | Outcome::TimedOut | Outcome::Cancelled = outcome {
            result.error_text = Some(self.read_stderr_tail(&mut child).await);
        }

        result.success = matches!(outcome, Outcome::EndedOk) && result.saw_result;
        result.outcome = Some(outcome);
        Ok(result)
    }

    async fn handle_line(
        &self,
        raw: &str,
        result: &mut CliResult,
        flow_log: &FlowLogHandle,
    ) -> Result<()> {
        match serde_json::from_str::<AgentEvent>(raw) {
            Ok(AgentEvent::SystemInit { model }) => {
                result.model = model;
                flow_log
                    .append(LogStream::AgentOutput, &serde_json::json!({"type": "system-init", "raw": raw}))
                    .await?;
            }
            Ok(AgentEvent::AssistantMessage { text }) => {
                result.output_text.push_str(&text);
                flow_log
                    .append(LogStream::AgentOutput, &serde_json::json!({"type": "assistant-message", "raw": raw}))
                    .await?;
            }
            Ok(event @ (AgentEvent::ToolCall { .. } | AgentEvent::ToolResult { .. })) => {
                flow_log
                    .append(LogStream::AgentOutput, &serde_json::json!({"type": "tool", "event": format!("{event:?}"), "raw": raw}))
                    .await?;
            }
            Ok(AgentEvent::Result {
                cost_usd,
                input_tokens,
                output_tokens,
            }) => {
                result.cost_usd = cost_usd;
                result.input_tokens = input_tokens;
                result.output_tokens = output_tokens;
                result.saw_result = true;
                flow_log
                    .append(LogStream::AgentOutput, &serde_json::json!({"type": "result", "raw": raw}))
                    .await?;
            }
            Err(_) => {
                // Unparseable line: preserve verbatim and keep streaming (§4.8).
                flow_log
                    .append(LogStream::AgentOutput, &serde_json::json!({"type": "raw", "raw": raw}))
                    .await?;
            }
        }
        Ok(())
    }

    async fn await_exit(&self, child: &mut Child) -> Outcome {
        match child.wait().await {
            Ok(status) if status.success() => Outcome::EndedOk,
            _ => Outcome::EndedError,
        }
    }

    async fn read_stderr_tail(&self, child: &mut Child) -> String {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        if let Some(mut stderr) = child.stderr.take() {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        truncate_tail(&buf, STDERR_CAP_BYTES)
    }
}

/// SIGTERM, then SIGKILL after a 10s grace period if the process hasn't exited.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
            let _ = child.kill().await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }
}

fn truncate_tail(bytes: &[u8], cap: usize) -> String {
    if bytes.len() <= cap {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let tail = &bytes[bytes.len() - cap..];
    format!(
        "[truncated {} bytes]{}",
        bytes.len() - cap,
        String::from_utf8_lossy(tail)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowlog::FlowLog;
    use uuid::Uuid;

    #[tokio::test]
    async fn result_event_is_required_for_success() {
        let dir = tempfile::tempdir().unwrap();
        let flow_log = FlowLog::new(dir.path());
        let handle = flow_log.get_or_create(Uuid::new_v4()).await.unwrap();
        let driver = CliDriver::new(crate::config::CliProvider::Claude);

        let mut result = CliResult::default();
        driver
            .handle_line(r#"{"type":"assistant-message","text":"hi"}"#, &mut result, &handle)
            .await
            .unwrap();
        assert!(!result.saw_result);

        driver
            .handle_line(
                r#"{"type":"result","cost_usd":"0.01","input_tokens":10,"output_tokens":20}"#,
                &mut result,
                &handle,
            )
            .await
            .unwrap();
        assert!(result.saw_result);
    }

    #[test]
    fn truncate_tail_leaves_marker_when_over_cap() {
        let data = vec![b'x'; 100];
        let out = truncate_tail(&data, 10);
        assert!(out.starts_with("[truncated 90 bytes]"));
        assert_eq!(out.len(), "[truncated 90 bytes]".len() + 10);
    }

    #[test]
    fn truncate_tail_passthrough_under_cap() {
        let out = truncate_tail(b"short", 100);
        assert_eq!(out, "short");
    }
}
