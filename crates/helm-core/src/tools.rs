use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ids::{AgentId, SessionId};

/// Contract every tool implements.
///
/// `execute` receives arguments that already passed schema validation.
/// Implementations must honor `ctx.abort_signal`: cancellation may arrive
/// at any await point and must leave no orphaned work behind.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Whether calls to this tool may run alongside others in the same turn.
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().into(),
            description: self.description().into(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

/// Wire-facing description of a tool, sent to providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// Ambient state handed to every execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub working_directory: PathBuf,
    /// Raised on steering or external abort. Terminal for the turn.
    pub abort_signal: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Concurrent,
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            duration,
        }
    }

    pub fn error(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            duration,
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("killed: {0}")]
    Killed(String),

    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    /// Stable kind string used in structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::Timeout(_) => "timeout",
            Self::Killed(_) => "killed",
            Self::Cancelled => "cancelled",
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
