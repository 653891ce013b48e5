use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use helm_core::context::LlmContext;
use helm_core::errors::ProviderError;
use helm_core::ids::ToolCallId;
use helm_core::messages::StopReason;
use helm_core::provider::{EventStream, Provider, StreamOptions};
use helm_core::stream::StreamEvent;
use helm_core::tokens::TokenUsage;

/// One scripted reply for [`MockProvider`].
#[derive(Clone)]
pub enum MockResponse {
    /// Yield these events in order.
    Stream(Vec<StreamEvent>),
    /// Fail the `stream()` call itself.
    Error(ProviderError),
    /// Sleep, then act as the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A complete single-block text reply.
    pub fn stream_text(text: &str) -> Self {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: text.len() as u64,
            ..Default::default()
        };
        Self::Stream(vec![
            StreamEvent::Start { response_id: Some("mock_resp".into()) },
            StreamEvent::TextStart,
            StreamEvent::TextDelta { delta: text.to_string() },
            StreamEvent::TextEnd,
            StreamEvent::Done {
                stop_reason: StopReason::EndTurn,
                usage: Some(usage),
            },
        ])
    }

    /// A reply requesting one tool call, with the argument JSON split
    /// across two delta fragments.
    pub fn stream_tool_call(id: &str, name: &str, arguments: &str) -> Self {
        let id = ToolCallId::from_raw(id);
        // Split near the midpoint, backing up to a char boundary.
        let mid = (0..=arguments.len() / 2)
            .rev()
            .find(|i| arguments.is_char_boundary(*i))
            .unwrap_or(0);
        let (head, tail) = arguments.split_at(mid);
        Self::Stream(vec![
            StreamEvent::Start { response_id: Some("mock_resp".into()) },
            StreamEvent::ToolCallStart { id: id.clone(), name: name.to_string() },
            StreamEvent::ToolCallDelta { id: id.clone(), fragment: head.to_string() },
            StreamEvent::ToolCallDelta { id: id.clone(), fragment: tail.to_string() },
            StreamEvent::ToolCallEnd { id },
            StreamEvent::Done { stop_reason: StopReason::ToolCalls, usage: None },
        ])
    }

    /// A stream that opens, then fails in-band.
    pub fn stream_error(error: &ProviderError) -> Self {
        Self::Stream(vec![
            StreamEvent::Start { response_id: None },
            StreamEvent::error(error),
        ])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Serves a fixed script of responses, one per `stream()` call. Calls
/// past the end of the script fail.
pub struct MockProvider {
    script: Vec<MockResponse>,
    served: AtomicUsize,
}

impl MockProvider {
    pub fn new(script: Vec<MockResponse>) -> Self {
        Self {
            script,
            served: AtomicUsize::new(0),
        }
    }

    /// How many `stream()` calls have been made.
    pub fn call_count(&self) -> usize {
        self.served.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn context_window(&self) -> u64 {
        200_000
    }

    async fn stream(
        &self,
        _context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, ProviderError> {
        let turn = self.served.fetch_add(1, Ordering::Relaxed);
        let mut next = self.script.get(turn).ok_or_else(|| {
            ProviderError::InvalidRequest(format!("mock script has no entry for call {turn}"))
        })?;

        // Peel nested delays without recursing.
        while let MockResponse::Delay(wait, inner) = next {
            tokio::time::sleep(*wait).await;
            next = inner.as_ref();
        }

        match next {
            MockResponse::Error(e) => Err(e.clone()),
            MockResponse::Stream(_) if options.cancel.is_cancelled() => {
                Ok(Box::pin(stream::once(std::future::ready(
                    StreamEvent::Done {
                        stop_reason: StopReason::Aborted,
                        usage: None,
                    },
                ))))
            }
            MockResponse::Stream(events) => Ok(Box::pin(stream::iter(events.clone()))),
            MockResponse::Delay(..) => unreachable!("delays peeled above"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    async fn drain(mut events: EventStream) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(ev) = events.next().await {
            out.push(ev);
        }
        out
    }

    async fn open(provider: &MockProvider) -> Result<EventStream, ProviderError> {
        provider
            .stream(&LlmContext::new(vec![]), &StreamOptions::default())
            .await
    }

    #[tokio::test]
    async fn scripted_text_plays_all_five_events() {
        let provider = MockProvider::new(vec![MockResponse::stream_text("hello world")]);
        let events = drain(open(&provider).await.unwrap()).await;

        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], StreamEvent::Start { .. }));
        assert!(matches!(events[1], StreamEvent::TextStart));
        assert!(
            matches!(&events[2], StreamEvent::TextDelta { delta } if delta == "hello world")
        );
        assert!(matches!(
            events[4],
            StreamEvent::Done { stop_reason: StopReason::EndTurn, .. }
        ));
    }

    #[tokio::test]
    async fn tool_call_fragments_concatenate_to_the_arguments() {
        let args = "{\"path\": \"/tmp/file\"}";
        let provider =
            MockProvider::new(vec![MockResponse::stream_tool_call("toolu_1", "read", args)]);
        let events = drain(open(&provider).await.unwrap()).await;

        let joined: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallDelta { fragment, .. } => Some(fragment.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(joined, args);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done { stop_reason: StopReason::ToolCalls, .. })
        ));
    }

    #[tokio::test]
    async fn scripted_error_fails_the_open() {
        let provider = MockProvider::new(vec![MockResponse::Error(
            ProviderError::AuthenticationFailed("bad".into()),
        )]);
        assert!(open(&provider).await.is_err());
    }

    #[tokio::test]
    async fn script_advances_one_entry_per_call() {
        let provider = MockProvider::new(vec![
            MockResponse::stream_text("first"),
            MockResponse::stream_text("second"),
        ]);

        assert!(open(&provider).await.is_ok());
        assert_eq!(provider.call_count(), 1);
        assert!(open(&provider).await.is_ok());
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn calls_past_the_script_fail() {
        let provider = MockProvider::new(vec![MockResponse::stream_text("only one")]);
        let _ = open(&provider).await;
        assert!(open(&provider).await.is_err());
    }

    #[test]
    fn reports_fixed_identity() {
        let provider = MockProvider::new(vec![]);
        assert_eq!(provider.name(), "mock");
        assert_eq!(provider.model(), "mock-model");
        assert_eq!(provider.context_window(), 200_000);
    }

    #[tokio::test]
    async fn delay_wraps_the_inner_response() {
        let provider = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(50),
            MockResponse::stream_text("after delay"),
        )]);

        let begun = std::time::Instant::now();
        let events = drain(open(&provider).await.unwrap()).await;
        assert!(
            begun.elapsed() >= Duration::from_millis(40),
            "expected ~50ms of delay, got {:?}",
            begun.elapsed()
        );
        assert_eq!(events.len(), 5);
    }

    #[tokio::test]
    async fn cancelled_options_short_circuit_to_aborted() {
        let provider = MockProvider::new(vec![MockResponse::stream_text("never")]);
        let options = StreamOptions::default();
        options.cancel.cancel();

        let events = drain(
            provider
                .stream(&LlmContext::new(vec![]), &options)
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            StreamEvent::Done { stop_reason: StopReason::Aborted, .. }
        ));
    }
}
