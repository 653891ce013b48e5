use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::messages::Message;
use crate::tools::ToolDefinition;

/// Everything a provider adapter needs to issue one model request.
#[derive(Debug, Clone)]
pub struct LlmContext {
    /// Active branch, oldest first.
    pub messages: Vec<Message>,
    pub system_blocks: Vec<SystemBlock>,
    pub tools: Vec<ToolDefinition>,
    pub working_directory: PathBuf,
}

impl LlmContext {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            system_blocks: Vec::new(),
            tools: Vec::new(),
            working_directory: PathBuf::from("."),
        }
    }
}

/// One system prompt segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    pub content: String,
    pub stability: Stability,
}

/// Whether a block changes between requests. Stable blocks come first so
/// providers with prefix caching get long-lived cache hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Stable,
    Volatile,
}
