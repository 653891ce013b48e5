use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tracing::debug;

use helm_core::context::{LlmContext, SystemBlock};
use helm_core::errors::ProviderError;
use helm_core::ids::ToolCallId;
use helm_core::messages::{
    AssistantContent, AssistantMessage, Message, StopReason, ToolResultContent, ToolResultMessage,
    UserContent, UserMessage,
};
use helm_core::provider::{CredentialResolver, EventStream, Provider, StreamOptions, ThinkingConfig};
use helm_core::stream::StreamEvent;
use helm_core::tokens::TokenUsage;

use crate::sse::{NormalizedStream, SseFrame, SseFrameStream, WireParser};

const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Adapter for the Anthropic Messages API streaming protocol.
pub struct AnthropicProvider {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialResolver>,
    model: String,
    base_url: String,
    context_window: u64,
}

impl AnthropicProvider {
    pub fn new(credentials: Arc<dyn CredentialResolver>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            credentials,
            model: model.into(),
            base_url: "https://api.anthropic.com".to_string(),
            context_window: 200_000,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_context_window(mut self, tokens: u64) -> Self {
        self.context_window = tokens;
        self
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
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
            .resolve(self.name())
            .ok_or_else(|| ProviderError::AuthenticationFailed("no credential resolved".into()))?;

        let body = build_request_body(context, options, &self.model);
        debug!(model = %self.model, messages = context.messages.len(), "opening anthropic stream");

        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", API_VERSION)
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
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err(match ProviderError::from_status(status, text) {
                ProviderError::RateLimited { .. } => ProviderError::RateLimited { retry_after },
                other => other,
            });
        }

        let bytes = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| ProviderError::Network(e.to_string())),
        );
        let frames = SseFrameStream::new(bytes, SSE_IDLE_TIMEOUT, options.cancel.clone());
        Ok(Box::pin(NormalizedStream::new(frames, AnthropicParser::new())))
    }
}

/// Maps Anthropic SSE frames to canonical events.
///
/// Content blocks are keyed by index on the wire; the parser remembers
/// which kind each index opened so stop frames close the right block.
pub struct AnthropicParser {
    blocks: HashMap<u64, BlockKind>,
    pending_signature: Option<String>,
    usage: TokenUsage,
    stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolCall(ToolCallId),
}

impl AnthropicParser {
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            pending_signature: None,
            usage: TokenUsage::default(),
            stop_reason: None,
        }
    }

    fn merge_usage(&mut self, raw: &Value) {
        let reported = TokenUsage {
            input_tokens: raw["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: raw["output_tokens"].as_u64().unwrap_or(0),
            cache_read_tokens: raw["cache_read_input_tokens"].as_u64().unwrap_or(0),
            cache_creation_tokens: raw["cache_creation_input_tokens"].as_u64().unwrap_or(0),
        };
        self.usage.merge_max(&reported);
    }
}

impl Default for AnthropicParser {
    fn default() -> Self {
        Self::new()
    }
}

impl WireParser for AnthropicParser {
    fn parse_frame(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        let data: Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(_) if frame.event == "ping" || frame.data.is_empty() => return vec![],
            Err(e) => {
                return vec![StreamEvent::error(&ProviderError::StreamInterrupted(
                    format!("malformed frame: {e}"),
                ))]
            }
        };

        match frame.event.as_str() {
            "message_start" => {
                self.merge_usage(&data["message"]["usage"]);
                vec![
                    StreamEvent::Start {
                        response_id: data["message"]["id"].as_str().map(str::to_string),
                    },
                    StreamEvent::Usage { usage: self.usage },
                ]
            }
            "content_block_start" => {
                let index = data["index"].as_u64().unwrap_or(0);
                match data["content_block"]["type"].as_str() {
                    Some("text") => {
                        self.blocks.insert(index, BlockKind::Text);
                        vec![StreamEvent::TextStart]
                    }
                    Some("thinking") => {
                        self.blocks.insert(index, BlockKind::Thinking);
                        vec![StreamEvent::ThinkingStart]
                    }
                    Some("tool_use") => {
                        let id = ToolCallId::from_raw(
                            data["content_block"]["id"].as_str().unwrap_or_default(),
                        );
                        let name = data["content_block"]["name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        self.blocks.insert(index, BlockKind::ToolCall(id.clone()));
                        vec![StreamEvent::ToolCallStart { id, name }]
                    }
                    _ => vec![],
                }
            }
            "content_block_delta" => {
                let index = data["index"].as_u64().unwrap_or(0);
                match data["delta"]["type"].as_str() {
                    Some("text_delta") => vec![StreamEvent::TextDelta {
                        delta: data["delta"]["text"].as_str().unwrap_or_default().to_string(),
                    }],
                    Some("thinking_delta") => vec![StreamEvent::ThinkingDelta {
                        delta: data["delta"]["thinking"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    }],
                    Some("input_json_delta") => match self.blocks.get(&index) {
                        Some(BlockKind::ToolCall(id)) => vec![StreamEvent::ToolCallDelta {
                            id: id.clone(),
                            fragment: data["delta"]["partial_json"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string(),
                        }],
                        _ => vec![],
                    },
                    Some("signature_delta") => {
                        let sig = data["delta"]["signature"].as_str().unwrap_or_default();
                        self.pending_signature
                            .get_or_insert_with(String::new)
                            .push_str(sig);
                        vec![]
                    }
                    _ => vec![],
                }
            }
            "content_block_stop" => {
                let index = data["index"].as_u64().unwrap_or(0);
                match self.blocks.remove(&index) {
                    Some(BlockKind::Text) => vec![StreamEvent::TextEnd],
                    Some(BlockKind::Thinking) => vec![StreamEvent::ThinkingEnd {
                        signature: self.pending_signature.take(),
                    }],
                    Some(BlockKind::ToolCall(id)) => vec![StreamEvent::ToolCallEnd { id }],
                    None => vec![],
                }
            }
            "message_delta" => {
                if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(map_stop_reason(reason));
                }
                self.merge_usage(&data["usage"]);
                vec![StreamEvent::Usage { usage: self.usage }]
            }
            "message_stop" => vec![StreamEvent::Done {
                stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
                usage: Some(self.usage),
            }],
            "error" => {
                let err = classify_error_frame(&data);
                vec![StreamEvent::error(&err)]
            }
            // ping and unknown frame types carry nothing canonical
            _ => vec![],
        }
    }
}

fn map_stop_reason(raw: &str) -> StopReason {
    match raw {
        "end_turn" | "stop_sequence" => StopReason::EndTurn,
        "max_tokens" => StopReason::MaxTokens,
        "tool_use" => StopReason::ToolCalls,
        _ => StopReason::EndTurn,
    }
}

fn classify_error_frame(data: &Value) -> ProviderError {
    let error_type = data["error"]["type"].as_str().unwrap_or_default();
    let message = data["error"]["message"].as_str().unwrap_or_default().to_string();
    match error_type {
        "overloaded_error" => ProviderError::Overloaded,
        "rate_limit_error" => ProviderError::RateLimited { retry_after: None },
        "authentication_error" | "permission_error" => {
            ProviderError::AuthenticationFailed(message)
        }
        "invalid_request_error" => ProviderError::InvalidRequest(message),
        "api_error" => ProviderError::ServerError { status: 500, message },
        _ => ProviderError::StreamInterrupted(message),
    }
}

/// Full request body for one streaming call.
pub fn build_request_body(context: &LlmContext, options: &StreamOptions, model: &str) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
        "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    });

    if let Some(temp) = options.temperature {
        body["temperature"] = json!(temp);
    }
    if !options.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(options.stop_sequences);
    }
    match options.thinking {
        ThinkingConfig::Disabled => {}
        ThinkingConfig::Adaptive => {
            body["thinking"] = json!({"type": "enabled", "budget_tokens": 10_000});
        }
        ThinkingConfig::Budget { tokens } => {
            body["thinking"] = json!({"type": "enabled", "budget_tokens": tokens});
        }
    }

    if !context.system_blocks.is_empty() {
        body["system"] = json!(convert_system_blocks(&context.system_blocks));
    }
    body["messages"] = json!(convert_messages(&context.messages));

    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters_schema,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

fn convert_system_blocks(blocks: &[SystemBlock]) -> Vec<Value> {
    blocks
        .iter()
        .map(|b| json!({"type": "text", "text": b.content}))
        .collect()
}

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| match msg {
            Message::User(user) => convert_user(user),
            Message::Assistant(asst) => convert_assistant(asst),
            Message::ToolResult(tr) => convert_tool_result(tr),
        })
        .collect()
}

fn convert_user(msg: &UserMessage) -> Value {
    let content: Vec<Value> = msg
        .content
        .iter()
        .map(|c| match c {
            UserContent::Text { text } => json!({"type": "text", "text": text}),
            UserContent::Image { mime_type, data } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": mime_type, "data": data}
            }),
        })
        .collect();
    json!({"role": "user", "content": content})
}

fn convert_assistant(msg: &AssistantMessage) -> Value {
    let content: Vec<Value> = msg
        .content
        .iter()
        .filter_map(|c| match c {
            AssistantContent::Text { text } => Some(json!({"type": "text", "text": text})),
            // Unsigned thinking blocks cannot be replayed to the API.
            AssistantContent::Thinking { text, signature } => signature
                .as_ref()
                .map(|sig| json!({"type": "thinking", "thinking": text, "signature": sig})),
            AssistantContent::ToolCall(tc) => Some(json!({
                "type": "tool_use",
                "id": tc.id.as_str(),
                "name": tc.name,
                "input": tc.arguments,
            })),
        })
        .collect();
    json!({"role": "assistant", "content": content})
}

fn convert_tool_result(msg: &ToolResultMessage) -> Value {
    let content: Vec<Value> = msg
        .content
        .iter()
        .map(|c| match c {
            ToolResultContent::Text { text } => json!({"type": "text", "text": text}),
            ToolResultContent::Image { mime_type, data } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": mime_type, "data": data}
            }),
        })
        .collect();
    json!({
        "role": "user",
        "content": [{
            "type": "tool_result",
            "tool_use_id": msg.tool_call_id.as_str(),
            "is_error": msg.is_error,
            "content": content,
        }]
    })
}
