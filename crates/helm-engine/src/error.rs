use std::time::Duration;

use helm_core::errors::ProviderError;
use helm_core::tools::ToolError;
use helm_llm::AccumulatorError;
use helm_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("stream protocol violated: {0}")]
    Protocol(#[from] AccumulatorError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session busy: {0}")]
    SessionBusy(String),

    #[error("agent aborted")]
    Aborted,

    #[error("max turns exceeded: {0}")]
    MaxTurnsExceeded(u32),

    #[error("run timeout after {0:?}")]
    RunTimeout(Duration),

    #[error("{0}")]
    Internal(String),
}
