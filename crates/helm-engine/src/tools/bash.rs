use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use helm_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolResult};

use crate::process::{self, CommandOutput};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_TIMEOUT_MS: u64 = 600_000;
const MAX_STREAM_BYTES: usize = 1_000_000;

/// Runs a shell command in the session's working directory. Sequential:
/// shell commands mutate the filesystem, so they never overlap with
/// other tools.
pub struct BashTool {
    timeout: Duration,
    grace: Duration,
}

impl BashTool {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            grace: process::DEFAULT_GRACE,
        }
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Clip a stream to `MAX_STREAM_BYTES` at a char boundary, noting the
/// original size. The marker counts against the budget, so clipped
/// output never exceeds it.
fn clip(stream: &str) -> String {
    if stream.len() <= MAX_STREAM_BYTES {
        return stream.to_string();
    }
    let marker = format!("\n[clipped: {} bytes total]", stream.len());
    let budget = MAX_STREAM_BYTES.saturating_sub(marker.len());
    let cut = (0..=budget)
        .rev()
        .find(|i| stream.is_char_boundary(*i))
        .unwrap_or(0);
    format!("{}{marker}", &stream[..cut])
}

/// Combine stdout and stderr into a single transcript block, flagging
/// failures with the exit code up front.
fn render(output: &CommandOutput) -> (String, bool) {
    let mut text = clip(&output.stdout);
    if !output.stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str("STDERR:\n");
        text.push_str(&clip(&output.stderr));
    }
    if text.is_empty() {
        text = "(no output)".to_string();
    }

    if output.success() {
        (text, false)
    } else {
        (format!("Exit code: {}\n{text}", output.exit_code), true)
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in milliseconds (max 600000)"
                },
                "description": {
                    "type": "string",
                    "description": "Description of what this command does"
                }
            },
            "required": ["command"]
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let started = Instant::now();

        let command = args["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("command is required".into()))?;
        let timeout = match args["timeout"].as_u64() {
            Some(ms) => Duration::from_millis(ms.min(MAX_TIMEOUT_MS)),
            None => self.timeout,
        };

        let output = process::run_shell(
            command,
            &ctx.working_directory,
            timeout,
            self.grace,
            &ctx.abort_signal,
        )
        .await?;

        let (content, is_error) = render(&output);
        Ok(ToolResult {
            content,
            is_error,
            duration: started.elapsed(),
        })
    }
}
