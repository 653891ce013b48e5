use helm_core::context::LlmContext;
use helm_core::messages::{AssistantContent, Message, ToolResultContent, UserContent};
use helm_core::tools::ToolDefinition;

/// Estimate tokens for plain text: roughly 4 characters per token,
/// rounded up. Deliberately pessimistic for short strings.
pub fn estimate_text_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Estimate tokens for a base64 image: decoded bytes / 750, with the
/// provider's floor of 85 tokens per image.
pub fn estimate_image_tokens(base64_data: &str) -> u64 {
    let decoded_bytes = (base64_data.len() as u64) * 3 / 4;
    (decoded_bytes / 750).max(85)
}

pub fn estimate_message_tokens(message: &Message) -> u64 {
    match message {
        Message::User(m) => m
            .content
            .iter()
            .map(|c| match c {
                UserContent::Text { text } => estimate_text_tokens(text),
                UserContent::Image { data, .. } => estimate_image_tokens(data),
            })
            .sum(),
        Message::Assistant(m) => m
            .content
            .iter()
            .map(|c| match c {
                AssistantContent::Text { text } => estimate_text_tokens(text),
                AssistantContent::Thinking { text, .. } => estimate_text_tokens(text),
                AssistantContent::ToolCall(tc) => {
                    estimate_text_tokens(&tc.name) + estimate_text_tokens(&tc.arguments.to_string())
                }
            })
            .sum(),
        Message::ToolResult(m) => m
            .content
            .iter()
            .map(|c| match c {
                ToolResultContent::Text { text } => estimate_text_tokens(text),
                ToolResultContent::Image { data, .. } => estimate_image_tokens(data),
            })
            .sum(),
    }
}

pub fn estimate_tool_tokens(defs: &[ToolDefinition]) -> u64 {
    defs.iter()
        .map(|d| {
            estimate_text_tokens(&d.name)
                + estimate_text_tokens(&d.description)
                + estimate_text_tokens(&d.parameters_schema.to_string())
        })
        .sum()
}

/// Estimate the full request size for a context.
pub fn estimate_context_tokens(ctx: &LlmContext) -> u64 {
    let system: u64 = ctx
        .system_blocks
        .iter()
        .map(|b| estimate_text_tokens(&b.content))
        .sum();
    let messages: u64 = ctx.messages.iter().map(estimate_message_tokens).sum();
    system + messages + estimate_tool_tokens(&ctx.tools)
}

/// Context pressure bands, by fraction of the model window used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThresholdLevel {
    Normal,
    Warning,
    Alert,
    Critical,
    Exceeded,
}

impl ThresholdLevel {
    pub fn from_tokens(used: u64, window: u64) -> Self {
        if window == 0 {
            return Self::Exceeded;
        }
        let pct = used as f64 / window as f64;
        if pct >= 1.0 {
            Self::Exceeded
        } else if pct >= 0.95 {
            Self::Critical
        } else if pct >= 0.85 {
            Self::Alert
        } else if pct >= 0.70 {
            Self::Warning
        } else {
            Self::Normal
        }
    }

    /// Compaction fires at `Alert` and above.
    pub fn should_compact(&self) -> bool {
        *self >= Self::Alert
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_tokens_round_up() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abc"), 1);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
    }

    #[test]
    fn image_tokens_have_floor() {
        assert_eq!(estimate_image_tokens("aaaa"), 85);
        // 100_000 base64 chars ≈ 75_000 bytes ≈ 100 tokens
        let big = "a".repeat(100_000);
        assert_eq!(estimate_image_tokens(&big), 100);
    }

    #[test]
    fn message_estimation_covers_tool_calls() {
        let msg: Message = serde_json::from_value(json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "running a command"},
                {"type": "tool_call", "id": "toolu_1", "name": "bash",
                 "arguments": {"command": "ls -la"}}
            ]
        }))
        .unwrap();
        assert!(estimate_message_tokens(&msg) > 0);
    }

    #[test]
    fn threshold_bands() {
        let w = 1000;
        assert_eq!(ThresholdLevel::from_tokens(100, w), ThresholdLevel::Normal);
        assert_eq!(ThresholdLevel::from_tokens(700, w), ThresholdLevel::Warning);
        assert_eq!(ThresholdLevel::from_tokens(850, w), ThresholdLevel::Alert);
        assert_eq!(ThresholdLevel::from_tokens(950, w), ThresholdLevel::Critical);
        assert_eq!(ThresholdLevel::from_tokens(1000, w), ThresholdLevel::Exceeded);
    }

    #[test]
    fn compaction_fires_at_alert() {
        assert!(!ThresholdLevel::Warning.should_compact());
        assert!(ThresholdLevel::Alert.should_compact());
        assert!(ThresholdLevel::Exceeded.should_compact());
    }

    #[test]
    fn zero_window_is_exceeded() {
        assert_eq!(ThresholdLevel::from_tokens(10, 0), ThresholdLevel::Exceeded);
    }
}
