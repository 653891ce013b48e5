use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tracing::debug;

use helm_core::context::LlmContext;
use helm_core::errors::ProviderError;
use helm_core::ids::ToolCallId;
use helm_core::messages::{
    AssistantContent, AssistantMessage, Message, StopReason, ToolResultContent, UserContent,
};
use helm_core::provider::{CredentialResolver, EventStream, Provider, StreamOptions};
use helm_core::stream::StreamEvent;
use helm_core::tokens::TokenUsage;

use crate::sse::{NormalizedStream, SseFrame, SseFrameStream, WireParser};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Adapter for OpenAI-compatible chat-completion endpoints (OpenAI,
/// OpenRouter, local inference servers). A genuinely different wire shape
/// from Anthropic: one untyped `data:` chunk stream, tool-call fragments
/// keyed by array index, a `[DONE]` sentinel instead of a stop frame.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialResolver>,
    provider_name: String,
    model: String,
    base_url: String,
    context_window: u64,
}

impl OpenAiCompatProvider {
    pub fn new(
        credentials: Arc<dyn CredentialResolver>,
        provider_name: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            credentials,
            provider_name: provider_name.into(),
            model: model.into(),
            base_url: base_url.into(),
            context_window: 128_000,
        }
    }

    pub fn with_context_window(mut self, tokens: u64) -> Self {
        self.context_window = tokens;
        self
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> u64 {
        self.context_window
    }

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, ProviderError> {
        let key = self
            .credentials
            .resolve(&self.provider_name)
            .ok_or_else(|| ProviderError::AuthenticationFailed("no credential resolved".into()))?;

        let body = build_request_body(context, options, &self.model);
        debug!(model = %self.model, messages = context.messages.len(), "opening chat-completions stream");

        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key.expose_secret())
            .header("content-type", "application/json")
            .json(&body);

        let response = tokio::select! {
            result = request.send() => {
                result.map_err(|e| {
                    if e.is_timeout() {
                        ProviderError::Timeout(CONNECT_TIMEOUT)
                    } else {
                        ProviderError::Network(e.to_string())
                    }
                })?
            }
            _ = options.cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, text));
        }

        let bytes = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| ProviderError::Network(e.to_string())),
        );
        let frames = SseFrameStream::new(bytes, SSE_IDLE_TIMEOUT, options.cancel.clone());
        Ok(Box::pin(NormalizedStream::new(frames, OpenAiParser::new())))
    }
}

/// Maps chat-completion chunks to canonical events.
pub struct OpenAiParser {
    started: bool,
    text_open: bool,
    thinking_open: bool,
    /// Wire index → call id, in index order for deterministic closing.
    tool_calls: BTreeMap<u64, ToolCallId>,
    usage: TokenUsage,
    stop_reason: Option<StopReason>,
}

impl OpenAiParser {
    pub fn new() -> Self {
        Self {
            started: false,
            text_open: false,
            thinking_open: false,
            tool_calls: BTreeMap::new(),
            usage: TokenUsage::default(),
            stop_reason: None,
        }
    }

    /// Close whatever is open, in a fixed order: thinking, text, tools.
    fn close_open_blocks(&mut self, out: &mut Vec<StreamEvent>) {
        if self.thinking_open {
            self.thinking_open = false;
            out.push(StreamEvent::ThinkingEnd { signature: None });
        }
        if self.text_open {
            self.text_open = false;
            out.push(StreamEvent::TextEnd);
        }
        for (_, id) in std::mem::take(&mut self.tool_calls) {
            out.push(StreamEvent::ToolCallEnd { id });
        }
    }
}

impl Default for OpenAiParser {
    fn default() -> Self {
        Self::new()
    }
}

impl WireParser for OpenAiParser {
    fn parse_frame(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        if frame.data == "[DONE]" {
            let mut out = Vec::new();
            self.close_open_blocks(&mut out);
            out.push(StreamEvent::Done {
                stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                usage: Some(self.usage),
            });
            return out;
        }

        let data: Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(_) if frame.data.is_empty() => return vec![],
            Err(e) => {
                return vec![StreamEvent::error(&ProviderError::StreamInterrupted(
                    format!("malformed chunk: {e}"),
                ))]
            }
        };

        if let Some(err) = data.get("error") {
            let message = err["message"].as_str().unwrap_or_default().to_string();
            let code = err["code"].as_u64().unwrap_or(500) as u16;
            return vec![StreamEvent::error(&ProviderError::from_status(code, message))];
        }

        let mut out = Vec::new();

        if !self.started {
            self.started = true;
            out.push(StreamEvent::Start {
                response_id: data["id"].as_str().map(str::to_string),
            });
        }

        if let Some(usage) = data.get("usage").filter(|u| !u.is_null()) {
            let reported = TokenUsage {
                input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
                output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
                cache_read_tokens: usage["prompt_tokens_details"]["cached_tokens"]
                    .as_u64()
                    .unwrap_or(0),
                cache_creation_tokens: 0,
            };
            self.usage.merge_max(&reported);
            out.push(StreamEvent::Usage { usage: self.usage });
        }

        let Some(choice) = data["choices"].get(0) else {
            return out;
        };
        let delta = &choice["delta"];

        // Some gateways stream reasoning under either key.
        let reasoning = delta["reasoning"]
            .as_str()
            .or_else(|| delta["reasoning_content"].as_str());
        if let Some(text) = reasoning {
            if !text.is_empty() {
                if !self.thinking_open {
                    self.thinking_open = true;
                    out.push(StreamEvent::ThinkingStart);
                }
                out.push(StreamEvent::ThinkingDelta { delta: text.to_string() });
            }
        }

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                if self.thinking_open {
                    self.thinking_open = false;
                    out.push(StreamEvent::ThinkingEnd { signature: None });
                }
                if !self.text_open {
                    self.text_open = true;
                    out.push(StreamEvent::TextStart);
                }
                out.push(StreamEvent::TextDelta { delta: text.to_string() });
            }
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0);
                if let Some(id) = call["id"].as_str() {
                    // New call at this index.
                    let id = ToolCallId::from_raw(id);
                    let name = call["function"]["name"].as_str().unwrap_or_default();
                    self.tool_calls.insert(index, id.clone());
                    out.push(StreamEvent::ToolCallStart { id, name: name.to_string() });
                }
                if let Some(fragment) = call["function"]["arguments"].as_str() {
                    if !fragment.is_empty() {
                        if let Some(id) = self.tool_calls.get(&index) {
                            out.push(StreamEvent::ToolCallDelta {
                                id: id.clone(),
                                fragment: fragment.to_string(),
                            });
                        }
                    }
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.stop_reason = Some(map_finish_reason(reason));
            self.close_open_blocks(&mut out);
        }

        out
    }
}

fn map_finish_reason(raw: &str) -> StopReason {
    match raw {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolCalls,
        _ => StopReason::EndTurn,
    }
}

/// Request body in chat-completions shape.
pub fn build_request_body(context: &LlmContext, options: &StreamOptions, model: &str) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    if !context.system_blocks.is_empty() {
        let system: String = context
            .system_blocks
            .iter()
            .map(|b| b.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        messages.push(json!({"role": "system", "content": system}));
    }

    for msg in &context.messages {
        match msg {
            Message::User(user) => {
                let text: String = user
                    .content
                    .iter()
                    .filter_map(|c| match c {
                        UserContent::Text { text } => Some(text.as_str()),
                        UserContent::Image { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                messages.push(json!({"role": "user", "content": text}));
            }
            Message::Assistant(asst) => messages.push(convert_assistant(asst)),
            Message::ToolResult(tr) => {
                let text: String = tr
                    .content
                    .iter()
                    .filter_map(|c| match c {
                        ToolResultContent::Text { text } => Some(text.as_str()),
                        ToolResultContent::Image { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": tr.tool_call_id.as_str(),
                    "content": text,
                }));
            }
        }
    }

    let mut body = json!({
        "model": model,
        "stream": true,
        "stream_options": {"include_usage": true},
        "messages": messages,
    });

    if let Some(max) = options.max_tokens {
        body["max_tokens"] = json!(max);
    }
    if let Some(temp) = options.temperature {
        body["temperature"] = json!(temp);
    }
    if !options.stop_sequences.is_empty() {
        body["stop"] = json!(options.stop_sequences);
    }

    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

fn convert_assistant(msg: &AssistantMessage) -> Value {
    let text = msg.text_content();
    let tool_calls: Vec<Value> = msg
        .content
        .iter()
        .filter_map(|c| match c {
            AssistantContent::ToolCall(tc) => Some(json!({
                "id": tc.id.as_str(),
                "type": "function",
                "function": {
                    "name": tc.name,
                    "arguments": tc.arguments.to_string(),
                }
            })),
            _ => None,
        })
        .collect();

    let mut out = json!({"role": "assistant"});
    out["content"] = if text.is_empty() { Value::Null } else { json!(text) };
    if !tool_calls.is_empty() {
        out["tool_calls"] = json!(tool_calls);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: Value) -> SseFrame {
        SseFrame { event: String::new(), data: data.to_string() }
    }

    fn done() -> SseFrame {
        SseFrame { event: String::new(), data: "[DONE]".to_string() }
    }

    fn parse_all(frames: Vec<SseFrame>) -> Vec<StreamEvent> {
        let mut parser = OpenAiParser::new();
        frames
            .into_iter()
            .flat_map(|f| parser.parse_frame(&f))
            .collect()
    }

    #[test]
    fn text_chunks_normalize() {
        let events = parse_all(vec![
            chunk(json!({"id": "chatcmpl-1", "choices": [{"delta": {"content": "Hel"}}]})),
            chunk(json!({"choices": [{"delta": {"content": "lo"}}]})),
            chunk(json!({"choices": [{"delta": {}, "finish_reason": "stop"}]})),
            chunk(json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2}})),
            done(),
        ]);

        assert!(matches!(&events[0], StreamEvent::Start { response_id: Some(id) } if id == "chatcmpl-1"));
        assert!(matches!(events[1], StreamEvent::TextStart));
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { delta } => Some(delta.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        match events.last().unwrap() {
            StreamEvent::Done { stop_reason, usage } => {
                assert_eq!(*stop_reason, StopReason::EndTurn);
                assert_eq!(usage.unwrap().input_tokens, 5);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn indexed_tool_call_fragments() {
        let events = parse_all(vec![
            chunk(json!({"id": "c", "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "function": {"name": "read", "arguments": ""}}
            ]}}]})),
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"path\""}}
            ]}}]})),
            chunk(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": ": \"/a\"}"}}
            ]}}]})),
            chunk(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})),
            done(),
        ]);

        assert!(matches!(
            &events[1],
            StreamEvent::ToolCallStart { id, name } if id.as_str() == "call_a" && name == "read"
        ));
        let fragments: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallDelta { fragment, .. } => Some(fragment.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(fragments, "{\"path\": \"/a\"}");
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolCallEnd { id } if id.as_str() == "call_a")));
        assert!(matches!(
            events.last().unwrap(),
            StreamEvent::Done { stop_reason: StopReason::ToolCalls, .. }
        ));
    }

    #[test]
    fn parallel_tool_calls_close_in_index_order() {
        let events = parse_all(vec![
            chunk(json!({"id": "c", "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "function": {"name": "read"}},
                {"index": 1, "id": "call_b", "function": {"name": "bash"}}
            ]}}]})),
            chunk(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})),
            done(),
        ]);

        let ends: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallEnd { id } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ends, vec!["call_a", "call_b"]);
    }

    #[test]
    fn reasoning_streams_as_thinking() {
        let events = parse_all(vec![
            chunk(json!({"id": "c", "choices": [{"delta": {"reasoning": "let me think"}}]})),
            chunk(json!({"choices": [{"delta": {"content": "answer"}}]})),
            chunk(json!({"choices": [{"delta": {}, "finish_reason": "stop"}]})),
            done(),
        ]);

        assert!(matches!(events[1], StreamEvent::ThinkingStart));
        assert!(matches!(events[2], StreamEvent::ThinkingDelta { .. }));
        // Thinking closes before text opens.
        assert!(matches!(events[3], StreamEvent::ThinkingEnd { .. }));
        assert!(matches!(events[4], StreamEvent::TextStart));
    }

    #[test]
    fn in_band_error_classified() {
        let events = parse_all(vec![chunk(
            json!({"error": {"message": "quota exceeded", "code": 429}}),
        )]);
        match &events[0] {
            StreamEvent::Error { kind, .. } => assert_eq!(kind, "rate_limited"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn finish_reason_vocabulary() {
        assert_eq!(map_finish_reason("stop"), StopReason::EndTurn);
        assert_eq!(map_finish_reason("length"), StopReason::MaxTokens);
        assert_eq!(map_finish_reason("tool_calls"), StopReason::ToolCalls);
    }

    #[test]
    fn request_body_shape() {
        use helm_core::messages::ToolResultMessage;

        let context = LlmContext::new(vec![
            Message::user_text("q"),
            Message::Assistant(AssistantMessage {
                content: vec![AssistantContent::ToolCall(helm_core::messages::ToolCallBlock {
                    id: ToolCallId::from_raw("call_1"),
                    name: "read".into(),
                    arguments: json!({"path": "/x"}),
                })],
                usage: None,
                stop_reason: Some(StopReason::ToolCalls),
            }),
            Message::ToolResult(ToolResultMessage {
                tool_call_id: ToolCallId::from_raw("call_1"),
                content: vec![ToolResultContent::Text { text: "data".into() }],
                is_error: false,
            }),
        ]);

        let body = build_request_body(&context, &StreamOptions::default(), "gpt-4o");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_1");
    }
}
