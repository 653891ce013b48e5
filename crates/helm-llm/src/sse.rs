use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use helm_core::errors::ProviderError;
use helm_core::messages::StopReason;
use helm_core::stream::StreamEvent;

/// Raw bytes from the wire, with transport errors already mapped.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Extract complete frames from `buffer`, leaving any partial frame behind.
/// Frames are blocks separated by a blank line.
pub fn drain_frames(buffer: &mut String) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos + 2).collect();
        if let Some(frame) = parse_block(&block) {
            frames.push(frame);
        }
    }
    frames
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = String::new();
    let mut data_lines: Vec<&str> = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Comment lines (":") and unknown fields are ignored.
    }
    if event.is_empty() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

/// SSE frames from a byte stream, with an idle timeout and cancellation.
///
/// The idle deadline resets whenever bytes arrive; a stall longer than the
/// window surfaces as `StreamInterrupted`. Cancellation surfaces as
/// `Cancelled` and ends the stream.
pub struct SseFrameStream {
    inner: ByteStream,
    buffer: String,
    pending: VecDeque<SseFrame>,
    idle_timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    done: bool,
}

impl SseFrameStream {
    pub fn new(inner: ByteStream, idle_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            inner,
            buffer: String::new(),
            pending: VecDeque::new(),
            idle_timeout,
            deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            cancelled: Box::pin(cancel.cancelled_owned()),
            done: false,
        }
    }
}

impl Stream for SseFrameStream {
    type Item = Result<SseFrame, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }

            if self.cancelled.as_mut().poll(cx).is_ready() {
                self.done = true;
                return Poll::Ready(Some(Err(ProviderError::Cancelled)));
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    let next = Instant::now() + self.idle_timeout;
                    self.deadline.as_mut().reset(next);
                    let mut buffer = std::mem::take(&mut self.buffer);
                    self.pending.extend(drain_frames(&mut buffer));
                    self.buffer = buffer;
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    if self.deadline.as_mut().poll(cx).is_ready() {
                        self.done = true;
                        return Poll::Ready(Some(Err(ProviderError::StreamInterrupted(format!(
                            "no data for {}s",
                            self.idle_timeout.as_secs()
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Protocol-specific frame parser. Stateful: tracks open blocks, usage,
/// and stop reason across frames.
pub trait WireParser: Send {
    fn parse_frame(&mut self, frame: &SseFrame) -> Vec<StreamEvent>;
}

/// Canonical events from an SSE frame stream plus a wire parser.
///
/// Guarantees exactly one terminal event: transport failures become `Error`
/// events, cancellation becomes `Done { aborted }`, and a connection that
/// closes without a protocol-level terminal becomes a `StreamInterrupted`
/// error.
pub struct NormalizedStream<P> {
    frames: SseFrameStream,
    parser: P,
    pending: VecDeque<StreamEvent>,
    closed: bool,
    terminal_sent: bool,
}

impl<P: WireParser> NormalizedStream<P> {
    pub fn new(frames: SseFrameStream, parser: P) -> Self {
        Self {
            frames,
            parser,
            pending: VecDeque::new(),
            closed: false,
            terminal_sent: false,
        }
    }
}

impl<P: WireParser + Unpin> Stream for NormalizedStream<P> {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminal_sent {
            return Poll::Ready(None);
        }
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.is_terminal() {
                    self.terminal_sent = true;
                    self.pending.clear();
                }
                return Poll::Ready(Some(event));
            }

            if self.closed {
                // Inner exhausted without a protocol terminal.
                self.terminal_sent = true;
                return Poll::Ready(Some(StreamEvent::error(&ProviderError::StreamInterrupted(
                    "stream closed before completion".into(),
                ))));
            }

            match Pin::new(&mut self.frames).poll_next(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    let events = self.parser.parse_frame(&frame);
                    self.pending.extend(events);
                }
                Poll::Ready(Some(Err(ProviderError::Cancelled))) => {
                    self.closed = true;
                    self.pending.push_back(StreamEvent::Done {
                        stop_reason: StopReason::Aborted,
                        usage: None,
                    });
                }
                Poll::Ready(Some(Err(e))) => {
                    self.closed = true;
                    self.pending.push_back(StreamEvent::error(&e));
                }
                Poll::Ready(None) => {
                    self.closed = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn bytes_stream(chunks: Vec<&'static str>) -> ByteStream {
        Box::pin(futures::stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from(c))),
        ))
    }

    #[test]
    fn drain_frames_splits_blocks() {
        let mut buf = "event: ping\ndata: {}\n\ndata: partial".to_string();
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "ping");
        assert_eq!(frames[0].data, "{}");
        assert_eq!(buf, "data: partial");
    }

    #[test]
    fn multiline_data_joined() {
        let mut buf = "data: line1\ndata: line2\n\n".to_string();
        let frames = drain_frames(&mut buf);
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn comments_ignored() {
        let mut buf = ": keepalive\n\ndata: x\n\n".to_string();
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[tokio::test]
    async fn frames_across_chunk_boundaries() {
        let inner = bytes_stream(vec!["event: a\nda", "ta: 1\n\nevent: b\ndata: 2\n\n"]);
        let mut stream =
            SseFrameStream::new(inner, Duration::from_secs(30), CancellationToken::new());

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.event, "a");
        assert_eq!(first.data, "1");
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.event, "b");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_interrupts() {
        let inner: ByteStream = Box::pin(futures::stream::pending());
        let mut stream =
            SseFrameStream::new(inner, Duration::from_secs(5), CancellationToken::new());

        let next = tokio::spawn(async move { stream.next().await });
        tokio::time::advance(Duration::from_secs(6)).await;
        let result = next.await.unwrap().unwrap();
        assert!(matches!(result, Err(ProviderError::StreamInterrupted(_))));
    }

    #[tokio::test]
    async fn cancellation_surfaces() {
        let inner: ByteStream = Box::pin(futures::stream::pending());
        let token = CancellationToken::new();
        let mut stream = SseFrameStream::new(inner, Duration::from_secs(30), token.clone());
        token.cancel();
        let result = stream.next().await.unwrap();
        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert!(stream.next().await.is_none());
    }

    struct EchoParser;
    impl WireParser for EchoParser {
        fn parse_frame(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
            if frame.event == "stop" {
                vec![StreamEvent::Done { stop_reason: StopReason::EndTurn, usage: None }]
            } else {
                vec![StreamEvent::TextDelta { delta: frame.data.clone() }]
            }
        }
    }

    #[tokio::test]
    async fn normalized_stream_ends_at_terminal() {
        let inner = bytes_stream(vec!["data: hi\n\nevent: stop\ndata: {}\n\ndata: after\n\n"]);
        let frames = SseFrameStream::new(inner, Duration::from_secs(30), CancellationToken::new());
        let events: Vec<_> = NormalizedStream::new(frames, EchoParser).collect().await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::TextDelta { .. }));
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn close_without_terminal_is_interrupted() {
        let inner = bytes_stream(vec!["data: hi\n\n"]);
        let frames = SseFrameStream::new(inner, Duration::from_secs(30), CancellationToken::new());
        let events: Vec<_> = NormalizedStream::new(frames, EchoParser).collect().await;

        assert_eq!(events.len(), 2);
        match &events[1] {
            StreamEvent::Error { kind, .. } => assert_eq!(kind, "stream_interrupted"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_becomes_aborted_stop() {
        let inner: ByteStream = Box::pin(futures::stream::pending());
        let token = CancellationToken::new();
        let frames = SseFrameStream::new(inner, Duration::from_secs(30), token.clone());
        let mut stream = NormalizedStream::new(frames, EchoParser);
        token.cancel();

        let event = stream.next().await.unwrap();
        assert!(matches!(
            event,
            StreamEvent::Done { stop_reason: StopReason::Aborted, .. }
        ));
        assert!(stream.next().await.is_none());
    }
}
