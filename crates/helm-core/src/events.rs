use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, ToolCallId};
use crate::messages::StopReason;
use crate::tokens::TokenUsage;

/// Lifecycle events published on the loop's broadcast channel for UIs,
/// logging, and extensions. Sent best-effort: a send with no receivers is
/// not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStart {
        session_id: SessionId,
        turn: u32,
    },
    TextDelta {
        session_id: SessionId,
        delta: String,
    },
    ThinkingDelta {
        session_id: SessionId,
        delta: String,
    },
    ToolStart {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        name: String,
    },
    ToolEnd {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        is_error: bool,
        duration_ms: u64,
    },
    Retrying {
        session_id: SessionId,
        attempt: u32,
        delay_ms: u64,
        kind: String,
    },
    SteeringApplied {
        session_id: SessionId,
    },
    FollowUpStarted {
        session_id: SessionId,
    },
    TurnComplete {
        session_id: SessionId,
        turn: u32,
        stop_reason: StopReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    CompactionStarted {
        session_id: SessionId,
    },
    CompactionComplete {
        session_id: SessionId,
        summarized: usize,
        kept: usize,
        /// True when summarization failed and the prefix was truncated.
        truncated: bool,
    },
    /// The whole run finished (all turns, all follow-ups).
    AgentComplete {
        session_id: SessionId,
        turns: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl AgentEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::TurnStart { session_id, .. }
            | Self::TextDelta { session_id, .. }
            | Self::ThinkingDelta { session_id, .. }
            | Self::ToolStart { session_id, .. }
            | Self::ToolEnd { session_id, .. }
            | Self::Retrying { session_id, .. }
            | Self::SteeringApplied { session_id }
            | Self::FollowUpStarted { session_id }
            | Self::TurnComplete { session_id, .. }
            | Self::CompactionStarted { session_id }
            | Self::CompactionComplete { session_id, .. }
            | Self::AgentComplete { session_id, .. } => session_id,
        }
    }
}

/// Durable event-log record types. Stored as the `event_type` column; the
/// string form is part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceEventType {
    SessionStart,
    SessionFork,
    MessageUser,
    MessageAssistant,
    MessageToolResult,
    CompactBoundary,
    CompactSummary,
}

impl std::fmt::Display for PersistenceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // serde's snake_case string, without quotes
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

impl std::str::FromStr for PersistenceEventType {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(&format!("\"{s}\""))
    }
}
