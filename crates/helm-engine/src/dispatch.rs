use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use helm_core::events::AgentEvent;
use helm_core::ids::SessionId;
use helm_core::messages::{Message, ToolCallBlock};
use helm_core::tools::{ExecutionMode, Tool, ToolContext, ToolError};

use crate::error::EngineError;
use crate::registry::ToolRegistry;
use crate::sanitize;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Executes a turn's tool calls and produces tool-result messages.
///
/// Concurrent-mode calls run in parallel under a semaphore; sequential-mode
/// calls run one at a time after the concurrent group completes. Results are
/// re-inserted in the model's emission order regardless of completion order,
/// so every call id gets exactly one result in a stable position.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    event_tx: broadcast::Sender<AgentEvent>,
    tool_timeout: Duration,
    concurrency: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, event_tx: broadcast::Sender<AgentEvent>) -> Self {
        Self {
            registry,
            event_tx,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            concurrency: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
        }
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.concurrency = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    fn send_event(&self, event: AgentEvent) {
        // Best-effort: a send with no receivers is not an error.
        let _ = self.event_tx.send(event);
    }

    /// Execute all calls and return one result message per call, in the
    /// order the model emitted them.
    ///
    /// Cancellation aborts the whole batch: in-flight tools observe the
    /// token and results produced so far are discarded.
    pub async fn dispatch(
        &self,
        calls: &[ToolCallBlock],
        ctx: &ToolContext,
    ) -> Result<Vec<Message>, EngineError> {
        let mut slots: Vec<Option<Message>> = vec![None; calls.len()];
        let mut concurrent: Vec<(usize, &ToolCallBlock, Arc<dyn Tool>)> = Vec::new();
        let mut sequential: Vec<(usize, &ToolCallBlock, Arc<dyn Tool>)> = Vec::new();

        for (i, tc) in calls.iter().enumerate() {
            let Some(tool) = self.registry.get(&tc.name) else {
                slots[i] = Some(Message::tool_result(
                    tc.id.clone(),
                    format!("unknown tool: {}", tc.name),
                    true,
                ));
                continue;
            };
            match tool.execution_mode() {
                ExecutionMode::Concurrent => concurrent.push((i, tc, tool)),
                ExecutionMode::Sequential => sequential.push((i, tc, tool)),
            }
        }

        // Concurrent group: spawn in emission order, join in emission order.
        let mut handles = Vec::new();
        for (i, tc, tool) in &concurrent {
            let tc = (*tc).clone();
            let tool = Arc::clone(tool);
            let ctx = ctx.clone();
            let tx = self.event_tx.clone();
            let session_id = ctx.session_id.clone();
            let timeout = self.tool_timeout;
            let permit_source = Arc::clone(&self.concurrency);
            let index = *i;

            handles.push(tokio::spawn(async move {
                let _permit = permit_source.acquire_owned().await;
                let msg = run_one(&*tool, &tc, &ctx, &tx, &session_id, timeout).await;
                (index, msg)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((index, msg)) => slots[index] = Some(msg),
                Err(join_err) => {
                    error!(error = %join_err, "tool task failed to join");
                    return Err(EngineError::Internal(format!(
                        "tool task failed: {join_err}"
                    )));
                }
            }
        }

        if ctx.abort_signal.is_cancelled() {
            return Err(EngineError::Aborted);
        }

        // Sequential group, in emission order.
        for (i, tc, tool) in &sequential {
            if ctx.abort_signal.is_cancelled() {
                return Err(EngineError::Aborted);
            }
            let msg = run_one(
                &**tool,
                tc,
                ctx,
                &self.event_tx,
                &ctx.session_id,
                self.tool_timeout,
            )
            .await;
            slots[*i] = Some(msg);
        }

        if ctx.abort_signal.is_cancelled() {
            return Err(EngineError::Aborted);
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

/// Run one tool call to a result message: timeout, panic capture,
/// cancellation, then sanitize and cap the output.
async fn run_one(
    tool: &dyn Tool,
    tc: &ToolCallBlock,
    ctx: &ToolContext,
    tx: &broadcast::Sender<AgentEvent>,
    session_id: &SessionId,
    timeout: Duration,
) -> Message {
    let _ = tx.send(AgentEvent::ToolStart {
        session_id: session_id.clone(),
        tool_call_id: tc.id.clone(),
        name: tc.name.clone(),
    });

    let start = Instant::now();
    let execution = std::panic::AssertUnwindSafe(tool.execute(tc.arguments.clone(), ctx))
        .catch_unwind();

    let outcome = tokio::select! {
        _ = ctx.abort_signal.cancelled() => Err(ToolError::Cancelled),
        result = tokio::time::timeout(timeout, execution) => match result {
            Ok(Ok(Ok(r))) => Ok(r),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(panic)) => {
                error!(tool = %tc.name, panic = %panic_message(&panic), "tool panicked during execution");
                Err(ToolError::ExecutionFailed("internal error: tool crashed".into()))
            }
            Err(_) => {
                warn!(tool = %tc.name, timeout_secs = timeout.as_secs(), "tool timed out");
                Err(ToolError::Timeout(timeout))
            }
        },
    };
    let duration = start.elapsed();

    let (content, is_error) = match outcome {
        Ok(r) => (r.content, r.is_error),
        Err(e) => (e.to_string(), true),
    };
    let content = sanitize::clean_output(&tc.name, &content);

    let _ = tx.send(AgentEvent::ToolEnd {
        session_id: session_id.clone(),
        tool_call_id: tc.id.clone(),
        is_error,
        duration_ms: duration.as_millis() as u64,
    });

    Message::tool_result(tc.id.clone(), content, is_error)
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
