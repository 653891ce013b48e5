use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::ids::ToolCallId;
use crate::messages::StopReason;
use crate::tokens::TokenUsage;

/// One event in the canonical normalized stream.
///
/// Every adapter, regardless of wire protocol, produces this sequence:
/// `Start`, then interleaved content block events in provider emission
/// order, then exactly one terminal `Done` or `Error`. The emission order
/// is authoritative downstream; nothing may reorder it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Response opened; the provider may include the response id.
    Start {
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },

    TextStart,
    TextDelta {
        delta: String,
    },
    TextEnd,

    ThinkingStart,
    ThinkingDelta {
        delta: String,
    },
    ThinkingEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    /// A tool call opened. Argument text follows as `ToolCallDelta`
    /// fragments keyed by the same id.
    ToolCallStart {
        id: ToolCallId,
        name: String,
    },
    ToolCallDelta {
        id: ToolCallId,
        /// Raw argument-JSON fragment. Not necessarily valid JSON on its
        /// own; only the concatenation of all fragments is parsed.
        fragment: String,
    },
    ToolCallEnd {
        id: ToolCallId,
    },

    /// Usage counters observed mid-stream (may repeat with growing values).
    Usage {
        usage: TokenUsage,
    },

    /// The adapter is about to retry after a retryable failure.
    Retry {
        attempt: u32,
        delay_ms: u64,
        error: RetryInfo,
    },

    /// Terminal: the response completed.
    Done {
        stop_reason: StopReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },

    /// Terminal: the response failed (retries, if any, exhausted).
    Error {
        kind: String,
        message: String,
    },
}

/// Structured description of the failure that triggered a retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryInfo {
    pub kind: String,
    pub message: String,
}

impl RetryInfo {
    pub fn from_error(err: &ProviderError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl StreamEvent {
    pub fn error(err: &ProviderError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    /// Terminal events end the sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Content-bearing deltas (for consumers that only render text).
    pub fn is_content_delta(&self) -> bool {
        matches!(
            self,
            Self::TextDelta { .. } | Self::ThinkingDelta { .. } | Self::ToolCallDelta { .. }
        )
    }
}

/// Which block kind is currently open while consuming a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveBlock {
    None,
    Text,
    Thinking,
    ToolCall(ToolCallId),
}
