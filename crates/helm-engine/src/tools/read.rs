use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use helm_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolResult};

const DEFAULT_LINE_LIMIT: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;

/// Reads a file and returns a numbered window of its lines. Concurrent:
/// reads never conflict with each other.
pub struct ReadTool;

/// Render `content` as `cat -n` style numbered lines, honoring a 1-based
/// `offset` and a line `limit`. Overlong lines are cut at a char
/// boundary.
fn number_lines(content: &str, offset: usize, limit: usize) -> String {
    let mut out = String::new();
    let mut number = offset.max(1);
    for line in content.lines().skip(number - 1).take(limit) {
        let cut = (0..=MAX_LINE_LENGTH.min(line.len()))
            .rev()
            .find(|i| line.is_char_boundary(*i))
            .unwrap_or(0);
        out.push_str(&format!("{number:>6}\t{}\n", &line[..cut]));
        number += 1;
    }
    out
}

fn resolve(raw: &str, working_directory: &Path) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        working_directory.join(candidate)
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read file contents from the filesystem"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read, absolute or relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-based)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let started = Instant::now();

        let raw = args["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("path is required".into()))?;
        let path = resolve(raw, &ctx.working_directory);

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to read {}: {e}", path.display()))
        })?;

        let offset = args["offset"].as_u64().unwrap_or(1) as usize;
        let limit = args["limit"].as_u64().unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        let mut rendered = number_lines(&content, offset, limit);
        if rendered.is_empty() {
            rendered = "(empty file)".to_string();
        }

        Ok(ToolResult::ok(rendered, started.elapsed()))
    }
}
