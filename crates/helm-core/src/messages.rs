use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ToolCallId;
use crate::tokens::TokenUsage;

/// Why a model response ended. Fixed vocabulary shared by every adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural completion.
    EndTurn,
    /// Hit the output token limit.
    MaxTokens,
    /// The model requested one or more tool invocations.
    ToolCalls,
    /// The turn was cancelled (steering or external abort).
    Aborted,
    /// The stream ended in an error.
    Error,
}

/// A conversation message. Immutable once finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: Vec<UserContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContent {
    Text {
        text: String,
    },
    Image {
        mime_type: String,
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    /// Blocks in the order the model emitted them.
    pub content: Vec<AssistantContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantContent {
    Text {
        text: String,
    },
    Thinking {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolCall(ToolCallBlock),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallBlock {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: ToolCallId,
    pub content: Vec<ToolResultContent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultContent {
    Text {
        text: String,
    },
    Image {
        mime_type: String,
        data: String,
    },
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::User(UserMessage::text(text))
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::Assistant(AssistantMessage::text(text))
    }

    pub fn tool_result(id: ToolCallId, text: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult(ToolResultMessage {
            tool_call_id: id,
            content: vec![ToolResultContent::Text { text: text.into() }],
            is_error,
        })
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::ToolResult(_) => "tool_result",
        }
    }
}

impl UserMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![UserContent::Text { text: text.into() }],
        }
    }
}

impl AssistantMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![AssistantContent::Text { text: text.into() }],
            usage: None,
            stop_reason: None,
        }
    }

    /// All tool-call blocks, in emission order.
    pub fn tool_calls(&self) -> Vec<&ToolCallBlock> {
        let mut calls = Vec::new();
        for block in &self.content {
            if let AssistantContent::ToolCall(tc) = block {
                calls.push(tc);
            }
        }
        calls
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content.iter().any(|block| matches!(block, AssistantContent::ToolCall(_)))
    }

    /// Concatenated visible text (thinking excluded).
    pub fn text_content(&self) -> String {
        let mut text = String::new();
        for block in &self.content {
            if let AssistantContent::Text { text: t } = block {
                text.push_str(t);
            }
        }
        text
    }
}
