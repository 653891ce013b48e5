use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use helm_core::context::LlmContext;
use helm_core::events::{AgentEvent, PersistenceEventType};
use helm_core::ids::SessionId;
use helm_core::messages::Message;
use helm_core::provider::{Provider, StreamOptions};
use helm_core::stream::StreamEvent;
use helm_store::events::{CompactBoundary, CompactSummary, EventRepo};

use crate::error::EngineError;
use crate::tokens::{estimate_context_tokens, ThresholdLevel};

const SUMMARY_INSTRUCTION: &str = "Summarize this conversation so far for your own future \
reference. Capture the user's goals, decisions made, work completed, and any unresolved \
items. Be specific about file paths, names, and values that later turns may need. Reply \
with the summary only.";

/// Compaction tuning.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Number of most-recent context messages kept verbatim.
    pub keep_recent: usize,
    /// Output budget for the summarization request.
    pub summary_max_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            keep_recent: 10,
            summary_max_tokens: 1024,
        }
    }
}

/// What a compaction pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionOutcome {
    pub summarized: usize,
    pub kept: usize,
    /// True when summarization failed and the prefix was dropped instead.
    pub truncated: bool,
}

/// Shrinks a session's context by summarizing its older messages.
///
/// The durable event log is never rewritten: compaction appends a boundary
/// event (and usually a summary event) that replay interprets. The last `K`
/// context messages stay verbatim; everything earlier is represented by the
/// summary, or dropped entirely if the summarization request fails.
pub struct Compactor {
    provider: Arc<dyn Provider>,
    events: EventRepo,
    event_tx: broadcast::Sender<AgentEvent>,
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(
        provider: Arc<dyn Provider>,
        events: EventRepo,
        event_tx: broadcast::Sender<AgentEvent>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            provider,
            events,
            event_tx,
            config,
        }
    }

    /// Whether the next request would cross the compaction threshold.
    pub fn should_compact(&self, ctx: &LlmContext) -> bool {
        let used = estimate_context_tokens(ctx);
        ThresholdLevel::from_tokens(used, self.provider.context_window()).should_compact()
    }

    /// Run one compaction pass. Returns `None` when there is nothing to
    /// compact (the context already fits in the kept window).
    pub async fn compact(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<CompactionOutcome>, EngineError> {
        let branch = self.events.active_branch(session_id)?;

        // Message events still visible under the current boundary.
        let visible = visible_message_rows(&branch)?;
        if visible.len() <= self.config.keep_recent {
            return Ok(None);
        }

        let _ = self.event_tx.send(AgentEvent::CompactionStarted {
            session_id: session_id.clone(),
        });

        let split = visible.len() - self.config.keep_recent;
        let keep_from = visible[split].id.clone();
        let keep_from_seq = visible[split].sequence;
        let summarized = split;
        let kept = self.config.keep_recent;

        // Replay everything below the split, prior summaries included, as
        // the input to summarization.
        let prefix_rows: Vec<helm_store::events::EventRow> = branch
            .iter()
            .filter(|e| e.sequence < keep_from_seq)
            .cloned()
            .collect();
        let prefix_messages = helm_store::events::reconstruct_from_events(&prefix_rows)?;

        let outcome = match self.summarize(prefix_messages).await {
            Ok(summary) => {
                self.events.append(
                    session_id,
                    PersistenceEventType::CompactBoundary,
                    serde_json::to_value(CompactBoundary {
                        keep_from: Some(keep_from),
                        truncated: false,
                    })
                    .map_err(|e| EngineError::Internal(e.to_string()))?,
                )?;
                self.events.append(
                    session_id,
                    PersistenceEventType::CompactSummary,
                    serde_json::to_value(CompactSummary { summary })
                        .map_err(|e| EngineError::Internal(e.to_string()))?,
                )?;
                info!(session_id = %session_id, summarized, kept, "context compacted");
                CompactionOutcome {
                    summarized,
                    kept,
                    truncated: false,
                }
            }
            Err(e) => {
                // Fallback: drop the prefix from context rather than fail
                // the turn. The log still holds every message.
                warn!(session_id = %session_id, error = %e, "summarization failed, truncating prefix");
                self.events.append(
                    session_id,
                    PersistenceEventType::CompactBoundary,
                    serde_json::to_value(CompactBoundary {
                        keep_from: Some(keep_from),
                        truncated: true,
                    })
                    .map_err(|e| EngineError::Internal(e.to_string()))?,
                )?;
                CompactionOutcome {
                    summarized,
                    kept,
                    truncated: true,
                }
            }
        };

        let _ = self.event_tx.send(AgentEvent::CompactionComplete {
            session_id: session_id.clone(),
            summarized: outcome.summarized,
            kept: outcome.kept,
            truncated: outcome.truncated,
        });

        Ok(Some(outcome))
    }

    /// One-shot summarization request over the prefix.
    async fn summarize(&self, mut messages: Vec<Message>) -> Result<String, EngineError> {
        messages.push(Message::user_text(SUMMARY_INSTRUCTION));
        let ctx = LlmContext::new(messages);
        let options = StreamOptions {
            max_tokens: Some(self.config.summary_max_tokens),
            ..Default::default()
        };

        let mut stream = self.provider.stream(&ctx, &options).await?;
        let mut summary = String::new();
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta { delta } => summary.push_str(&delta),
                StreamEvent::Error { kind, message } => {
                    return Err(EngineError::Internal(format!(
                        "summarization failed ({kind}): {message}"
                    )));
                }
                _ => {}
            }
        }

        if summary.trim().is_empty() {
            return Err(EngineError::Internal("empty summary".into()));
        }
        Ok(summary)
    }
}

/// Message rows a replay would include, given the current boundary.
fn visible_message_rows(
    branch: &[helm_store::events::EventRow],
) -> Result<Vec<helm_store::events::EventRow>, EngineError> {
    let boundary = branch
        .iter()
        .rev()
        .find(|e| e.event_type == PersistenceEventType::CompactBoundary);

    let (keep_from_seq, boundary_seq) = match boundary {
        Some(b) => {
            let payload: CompactBoundary = serde_json::from_value(b.payload.clone())
                .map_err(|e| EngineError::Internal(format!("compact_boundary payload: {e}")))?;
            let keep_seq = match payload.keep_from {
                Some(ref keep_id) => branch
                    .iter()
                    .find(|e| e.id == *keep_id)
                    .map(|e| e.sequence)
                    .unwrap_or(i64::MAX),
                None => i64::MAX,
            };
            (keep_seq, b.sequence)
        }
        None => (i64::MIN, i64::MIN),
    };

    Ok(branch
        .iter()
        .filter(|e| {
            matches!(
                e.event_type,
                PersistenceEventType::MessageUser
                    | PersistenceEventType::MessageAssistant
                    | PersistenceEventType::MessageToolResult
            ) && !(e.sequence < keep_from_seq && e.sequence < boundary_seq)
        })
        .cloned()
        .collect())
}
