use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use helm_core::context::{LlmContext, Stability, SystemBlock};
use helm_core::events::{AgentEvent, PersistenceEventType};
use helm_core::ids::{AgentId, SessionId, ToolCallId};
use helm_core::messages::{
    AssistantContent, AssistantMessage, Message, StopReason, ToolCallBlock, ToolResultContent,
};
use helm_core::provider::{Provider, StreamOptions};
use helm_core::stream::StreamEvent;
use helm_core::tokens::TokenUsage;
use helm_core::tools::ToolContext;
use helm_llm::{ToolCallAccumulator, ToolCallState};
use helm_store::database::Database;
use helm_store::events::EventRepo;
use helm_store::sessions::SessionRepo;

use crate::compaction::Compactor;
use crate::dispatch::Dispatcher;
use crate::error::EngineError;
use crate::queue::{MessageQueue, QueueMode};
use crate::registry::ToolRegistry;

const DEFAULT_MAX_RUN_DURATION: Duration = Duration::from_secs(3600);

/// Configuration for the agent runner.
pub struct RunnerConfig {
    pub max_turns_per_prompt: u32,
    pub stream_options: StreamOptions,
    pub max_run_duration: Duration,
    pub queue_mode: QueueMode,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_turns_per_prompt: 50,
            stream_options: StreamOptions::default(),
            max_run_duration: DEFAULT_MAX_RUN_DURATION,
            queue_mode: QueueMode::All,
        }
    }
}

/// At most one loop per session. Guards are handed out here and released
/// on drop.
#[derive(Clone, Default)]
pub struct SessionGate {
    active: Arc<DashMap<String, ()>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, session_id: &SessionId) -> Result<SessionGuard, EngineError> {
        let key = session_id.as_str().to_string();
        match self.active.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(EngineError::SessionBusy(key))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(());
                Ok(SessionGuard {
                    active: Arc::clone(&self.active),
                    key,
                })
            }
        }
    }

    pub fn is_running(&self, session_id: &SessionId) -> bool {
        self.active.contains_key(session_id.as_str())
    }
}

pub struct SessionGuard {
    active: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.remove(&self.key);
    }
}

/// Result of a single turn.
#[derive(Debug)]
pub struct TurnResult {
    /// `None` when steering discarded the partial response.
    pub assistant_message: Option<AssistantMessage>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
    pub has_tool_calls: bool,
    /// Steering arrived mid-stream; the loop should apply it and go again.
    pub steered: bool,
}

pub struct TurnParams<'a> {
    pub messages: &'a mut Vec<Message>,
    pub session_id: &'a SessionId,
    pub agent_id: &'a AgentId,
    pub turn: u32,
    pub options: &'a StreamOptions,
    pub cancel: &'a CancellationToken,
    pub queue: &'a MessageQueue,
}

/// Runs a single agent turn: build context, stream, accumulate, persist,
/// dispatch tools.
pub struct TurnRunner {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    dispatcher: Dispatcher,
    event_repo: EventRepo,
    session_repo: SessionRepo,
    event_tx: broadcast::Sender<AgentEvent>,
    working_directory: PathBuf,
    system_prompt: Option<String>,
}

impl TurnRunner {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        db: Database,
        event_tx: broadcast::Sender<AgentEvent>,
        working_directory: PathBuf,
    ) -> Self {
        Self {
            provider,
            dispatcher: Dispatcher::new(Arc::clone(&registry), event_tx.clone()),
            registry,
            event_repo: EventRepo::new(db.clone()),
            session_repo: SessionRepo::new(db),
            event_tx,
            working_directory,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn build_context(&self, messages: Vec<Message>) -> LlmContext {
        let mut ctx = LlmContext::new(messages);
        if let Some(prompt) = &self.system_prompt {
            ctx.system_blocks.push(SystemBlock {
                content: prompt.clone(),
                stability: Stability::Stable,
            });
        }
        ctx.tools = self.registry.definitions();
        ctx.working_directory = self.working_directory.clone();
        ctx
    }

    fn send_event(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }

    #[instrument(skip(self, p), fields(session_id = %p.session_id, turn = p.turn))]
    pub async fn execute_turn(&self, p: TurnParams<'_>) -> Result<TurnResult, EngineError> {
        let TurnParams {
            messages,
            session_id,
            agent_id,
            turn,
            options,
            cancel,
            queue,
        } = p;

        self.send_event(AgentEvent::TurnStart {
            session_id: session_id.clone(),
            turn,
        });

        let ctx = self.build_context(messages.clone());

        // Child token: steering cancels this turn's stream without killing
        // the whole run.
        let turn_cancel = cancel.child_token();
        let turn_options = StreamOptions {
            cancel: turn_cancel.clone(),
            ..options.clone()
        };

        let mut stream = self.provider.stream(&ctx, &turn_options).await?;

        let mut content: Vec<AssistantContent> = Vec::new();
        let mut text_buf = String::new();
        let mut thinking_buf = String::new();
        let mut accumulator = ToolCallAccumulator::new(&ctx.tools);
        let mut usage = TokenUsage::default();
        let mut stop_reason: Option<StopReason> = None;
        let mut steered = false;

        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }

            match event {
                StreamEvent::Start { .. } | StreamEvent::TextStart | StreamEvent::ThinkingStart => {}
                StreamEvent::TextDelta { delta } => {
                    text_buf.push_str(&delta);
                    self.send_event(AgentEvent::TextDelta {
                        session_id: session_id.clone(),
                        delta,
                    });
                }
                StreamEvent::TextEnd => {
                    if !text_buf.is_empty() {
                        content.push(AssistantContent::Text {
                            text: std::mem::take(&mut text_buf),
                        });
                    }
                }
                StreamEvent::ThinkingDelta { delta } => {
                    thinking_buf.push_str(&delta);
                    self.send_event(AgentEvent::ThinkingDelta {
                        session_id: session_id.clone(),
                        delta,
                    });
                }
                StreamEvent::ThinkingEnd { signature } => {
                    if !thinking_buf.is_empty() {
                        content.push(AssistantContent::Thinking {
                            text: std::mem::take(&mut thinking_buf),
                            signature,
                        });
                    }
                }
                ev @ (StreamEvent::ToolCallStart { .. }
                | StreamEvent::ToolCallDelta { .. }
                | StreamEvent::ToolCallEnd { .. }) => {
                    accumulator.observe(&ev)?;
                }
                StreamEvent::Usage { usage: u } => usage.merge_max(&u),
                StreamEvent::Retry {
                    attempt,
                    delay_ms,
                    error,
                } => {
                    self.send_event(AgentEvent::Retrying {
                        session_id: session_id.clone(),
                        attempt,
                        delay_ms,
                        kind: error.kind,
                    });
                }
                StreamEvent::Done {
                    stop_reason: sr,
                    usage: u,
                } => {
                    if let Some(u) = u {
                        usage.merge_max(&u);
                    }
                    stop_reason = Some(sr);
                }
                StreamEvent::Error { kind, message } => {
                    return Err(EngineError::Internal(format!(
                        "stream failed ({kind}): {message}"
                    )));
                }
            }

            if stop_reason.is_none() && queue.has_steering() {
                // Steering interrupts the turn; open blocks never finalize.
                turn_cancel.cancel();
                steered = true;
                break;
            }
        }

        if steered {
            // Open blocks and half-streamed tool calls are dropped. Blocks
            // that already finalized stay in the session, with cancelled
            // results standing in for any finalized tool calls.
            let kept: Vec<_> = accumulator
                .calls()
                .iter()
                .filter(|c| c.state != ToolCallState::Pending)
                .collect();
            for call in &kept {
                content.push(AssistantContent::ToolCall(ToolCallBlock {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call
                        .arguments
                        .clone()
                        .unwrap_or(serde_json::Value::Object(Default::default())),
                }));
            }
            if content.is_empty() {
                return Ok(TurnResult {
                    assistant_message: None,
                    stop_reason: StopReason::Aborted,
                    usage,
                    has_tool_calls: false,
                    steered: true,
                });
            }

            let assistant_msg = AssistantMessage {
                content,
                usage: Some(usage.clone()),
                stop_reason: Some(StopReason::Aborted),
            };
            // Persist the role-tagged form; replay decodes payloads as
            // `Message`.
            let message = Message::Assistant(assistant_msg.clone());
            let payload = serde_json::to_value(&message)
                .map_err(|e| EngineError::Internal(format!("serialize assistant message: {e}")))?;
            self.event_repo
                .append(session_id, PersistenceEventType::MessageAssistant, payload)?;
            self.session_repo.add_usage(session_id, &usage)?;
            messages.push(message);

            for call in &kept {
                let result = Message::tool_result(call.id.clone(), "cancelled by user", true);
                let payload = serde_json::to_value(&result)
                    .map_err(|e| EngineError::Internal(format!("serialize tool result: {e}")))?;
                self.event_repo.append(
                    session_id,
                    PersistenceEventType::MessageToolResult,
                    payload,
                )?;
                messages.push(result);
            }

            self.send_event(AgentEvent::TurnComplete {
                session_id: session_id.clone(),
                turn,
                stop_reason: StopReason::Aborted,
                usage: Some(usage.clone()),
            });

            return Ok(TurnResult {
                assistant_message: Some(assistant_msg),
                stop_reason: StopReason::Aborted,
                usage,
                has_tool_calls: false,
                steered: true,
            });
        }

        let stop_reason = stop_reason
            .ok_or_else(|| EngineError::Internal("stream ended without terminal event".into()))?;

        // Completed tool calls join the assistant content in emission order.
        for call in accumulator.calls() {
            content.push(AssistantContent::ToolCall(ToolCallBlock {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call
                    .arguments
                    .clone()
                    .unwrap_or(serde_json::Value::Object(Default::default())),
            }));
        }

        let assistant_msg = AssistantMessage {
            content,
            usage: Some(usage.clone()),
            stop_reason: Some(stop_reason),
        };

        // Role-tagged for replay, same as the user-message path.
        let message = Message::Assistant(assistant_msg.clone());
        let payload = serde_json::to_value(&message)
            .map_err(|e| EngineError::Internal(format!("serialize assistant message: {e}")))?;
        self.event_repo
            .append(session_id, PersistenceEventType::MessageAssistant, payload)?;
        self.session_repo.add_usage(session_id, &usage)?;

        self.send_event(AgentEvent::TurnComplete {
            session_id: session_id.clone(),
            turn,
            stop_reason,
            usage: Some(usage.clone()),
        });

        messages.push(message);

        let has_tool_calls = !accumulator.calls().is_empty();
        let mut dispatch_steered = false;
        if has_tool_calls {
            let (results, was_steered) = self
                .run_tool_calls(&mut accumulator, session_id, agent_id, cancel, queue)
                .await?;
            dispatch_steered = was_steered;
            for result in results {
                let payload = serde_json::to_value(&result)
                    .map_err(|e| EngineError::Internal(format!("serialize tool result: {e}")))?;
                self.event_repo.append(
                    session_id,
                    PersistenceEventType::MessageToolResult,
                    payload,
                )?;
                messages.push(result);
            }
        }

        Ok(TurnResult {
            assistant_message: Some(assistant_msg),
            stop_reason,
            usage,
            has_tool_calls,
            steered: dispatch_steered,
        })
    }

    /// Execute the turn's calls: validated ones through the dispatcher,
    /// failed ones straight to error results. One result per call, in
    /// emission order. Each call's lifecycle is advanced as it happens:
    /// `Executing` on dispatch, then `Completed` or `Failed` from its
    /// result. Steering arriving mid-dispatch cancels in-flight
    /// executions; the discarded outputs are replaced with cancelled
    /// markers so every call still gets a result.
    async fn run_tool_calls(
        &self,
        accumulator: &mut ToolCallAccumulator,
        session_id: &SessionId,
        agent_id: &AgentId,
        cancel: &CancellationToken,
        queue: &MessageQueue,
    ) -> Result<(Vec<Message>, bool), EngineError> {
        let validated: Vec<ToolCallBlock> = accumulator
            .validated()
            .into_iter()
            .map(|c| ToolCallBlock {
                id: c.id.clone(),
                name: c.name.clone(),
                arguments: c
                    .arguments
                    .clone()
                    .unwrap_or(serde_json::Value::Object(Default::default())),
            })
            .collect();
        for block in &validated {
            accumulator.transition(&block.id, ToolCallState::Executing)?;
        }

        let tool_ctx = ToolContext {
            session_id: session_id.clone(),
            agent_id: agent_id.clone(),
            working_directory: self.working_directory.clone(),
            abort_signal: cancel.child_token(),
        };

        let dispatch_fut = self.dispatcher.dispatch(&validated, &tool_ctx);
        tokio::pin!(dispatch_fut);
        let mut steered = false;
        let outcome = loop {
            tokio::select! {
                res = &mut dispatch_fut => break res,
                _ = tokio::time::sleep(Duration::from_millis(25)), if !steered => {
                    if queue.has_steering() {
                        steered = true;
                        tool_ctx.abort_signal.cancel();
                    }
                }
            }
        };

        let mut dispatched = match outcome {
            Ok(msgs) => msgs.into_iter(),
            // Steering abandoned the batch; no output survives.
            Err(EngineError::Aborted) if steered => Vec::new().into_iter(),
            Err(e) => return Err(e),
        };

        let mut results = Vec::with_capacity(accumulator.calls().len());
        let snapshot: Vec<(ToolCallId, ToolCallState, Option<String>)> = accumulator
            .calls()
            .iter()
            .map(|c| (c.id.clone(), c.state.clone(), c.error.clone()))
            .collect();
        for (id, state, error) in snapshot {
            if state == ToolCallState::Executing {
                match dispatched.next() {
                    Some(msg) => {
                        match failure_detail(&msg) {
                            Some(detail) => accumulator.set_error(&id, detail)?,
                            None => accumulator.transition(&id, ToolCallState::Completed)?,
                        }
                        results.push(msg);
                    }
                    None => {
                        accumulator.set_error(&id, "cancelled by user".into())?;
                        results.push(Message::tool_result(id, "cancelled by user", true));
                    }
                }
            } else {
                let detail = error.unwrap_or_else(|| "invalid tool call".into());
                results.push(Message::tool_result(id, detail, true));
            }
        }
        Ok((results, steered))
    }
}

/// Failure text of an error tool result; `None` for a successful one.
fn failure_detail(msg: &Message) -> Option<String> {
    match msg {
        Message::ToolResult(r) if r.is_error => Some(
            r.content
                .iter()
                .find_map(|c| match c {
                    ToolResultContent::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "tool failed".into()),
        ),
        _ => None,
    }
}

/// The agent runner: the multi-turn loop for one prompt, plus steering and
/// follow-up handling.
pub struct AgentRunner {
    turn_runner: TurnRunner,
    compactor: Option<Compactor>,
    config: RunnerConfig,
    event_tx: broadcast::Sender<AgentEvent>,
    gate: SessionGate,
    event_repo: EventRepo,
}

impl AgentRunner {
    pub fn new(
        turn_runner: TurnRunner,
        config: RunnerConfig,
        db: Database,
        event_tx: broadcast::Sender<AgentEvent>,
    ) -> Self {
        Self {
            turn_runner,
            compactor: None,
            config,
            event_tx,
            gate: SessionGate::new(),
            event_repo: EventRepo::new(db),
        }
    }

    pub fn with_compactor(mut self, compactor: Compactor) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn gate(&self) -> SessionGate {
        self.gate.clone()
    }

    fn append_user(
        &self,
        session_id: &SessionId,
        messages: &mut Vec<Message>,
        text: String,
    ) -> Result<(), EngineError> {
        let msg = Message::user_text(text);
        let payload = serde_json::to_value(&msg)
            .map_err(|e| EngineError::Internal(format!("serialize user message: {e}")))?;
        self.event_repo
            .append(session_id, PersistenceEventType::MessageUser, payload)?;
        messages.push(msg);
        Ok(())
    }

    /// Run the loop for one prompt until the model stops, the queues drain,
    /// or a limit trips. Steering and follow-ups queued while running are
    /// consumed along the way.
    #[instrument(skip(self, prompt, queue, cancel), fields(session_id = %session_id))]
    pub async fn run(
        &self,
        session_id: &SessionId,
        prompt: String,
        queue: &MessageQueue,
        cancel: &CancellationToken,
    ) -> Result<u32, EngineError> {
        let _guard = self.gate.try_acquire(session_id)?;
        let agent_id = AgentId::new();
        let run_start = Instant::now();

        let mut messages = self.event_repo.reconstruct_messages(session_id)?;
        self.append_user(session_id, &mut messages, prompt)?;

        let mut turn = 1u32;
        let outcome: Result<(), EngineError> = loop {
            if cancel.is_cancelled() {
                break Err(EngineError::Aborted);
            }
            if turn > self.config.max_turns_per_prompt {
                break Err(EngineError::MaxTurnsExceeded(self.config.max_turns_per_prompt));
            }
            let elapsed = run_start.elapsed();
            if elapsed >= self.config.max_run_duration {
                warn!(
                    elapsed_secs = elapsed.as_secs(),
                    max_secs = self.config.max_run_duration.as_secs(),
                    "run exceeded max duration"
                );
                break Err(EngineError::RunTimeout(self.config.max_run_duration));
            }

            if let Some(compactor) = &self.compactor {
                let ctx = self.turn_runner.build_context(messages.clone());
                if compactor.should_compact(&ctx) && compactor.compact(session_id).await?.is_some()
                {
                    messages = self.event_repo.reconstruct_messages(session_id)?;
                }
            }

            let result = self
                .turn_runner
                .execute_turn(TurnParams {
                    messages: &mut messages,
                    session_id,
                    agent_id: &agent_id,
                    turn,
                    options: &self.config.stream_options,
                    cancel,
                    queue,
                })
                .await;

            let result = match result {
                Ok(r) => r,
                Err(e) => break Err(e),
            };

            if result.steered {
                let mut append_err = None;
                for queued in queue.take_steering(self.config.queue_mode) {
                    if let Err(e) = self.append_user(session_id, &mut messages, queued.text) {
                        append_err = Some(e);
                        break;
                    }
                }
                if let Some(e) = append_err {
                    break Err(e);
                }
                let _ = self.event_tx.send(AgentEvent::SteeringApplied {
                    session_id: session_id.clone(),
                });
                turn += 1;
                continue;
            }

            if result.has_tool_calls {
                turn += 1;
                continue;
            }

            // Steering that landed with the stream's terminal event missed
            // the in-flight check; it still wins over follow-ups and starts
            // a fresh exchange instead of stranding in the queue.
            let late_steering = queue.take_steering(self.config.queue_mode);
            if !late_steering.is_empty() {
                for queued in late_steering {
                    self.append_user(session_id, &mut messages, queued.text)?;
                }
                let _ = self.event_tx.send(AgentEvent::SteeringApplied {
                    session_id: session_id.clone(),
                });
                turn += 1;
                continue;
            }

            // Natural stop: follow-ups start a fresh exchange.
            let follow_ups = queue.take_follow_up(self.config.queue_mode);
            if follow_ups.is_empty() {
                break Ok(());
            }
            for queued in follow_ups {
                self.append_user(session_id, &mut messages, queued.text)?;
            }
            let _ = self.event_tx.send(AgentEvent::FollowUpStarted {
                session_id: session_id.clone(),
            });
            turn += 1;
        };

        let error = outcome.as_ref().err().map(|e| e.to_string());
        let _ = self.event_tx.send(AgentEvent::AgentComplete {
            session_id: session_id.clone(),
            turns: turn,
            error,
        });

        outcome.map(|_| turn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use helm_core::tools::{ExecutionMode, Tool, ToolError, ToolResult};
    use helm_llm::{MockProvider, MockResponse};
    use helm_store::sessions::SessionRepo;

    struct EchoTool {
        calls: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    impl EchoTool {
        fn new() -> (Self, Arc<Mutex<Vec<serde_json::Value>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (Self { calls: Arc::clone(&calls) }, calls)
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the value back"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": { "value": { "type": "string" } },
                "required": ["value"]
            })
        }

        fn execution_mode(&self) -> ExecutionMode {
            ExecutionMode::Concurrent
        }

        async fn execute(
            &self,
            args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolResult, ToolError> {
            self.calls.lock().push(args.clone());
            let value = args["value"].as_str().unwrap_or_default().to_string();
            Ok(ToolResult::ok(value, Duration::from_millis(1)))
        }
    }

    struct Harness {
        runner: AgentRunner,
        session_id: SessionId,
        event_repo: EventRepo,
        queue: MessageQueue,
        cancel: CancellationToken,
        rx: broadcast::Receiver<AgentEvent>,
    }

    fn harness(
        responses: Vec<MockResponse>,
        registry: ToolRegistry,
        config: RunnerConfig,
    ) -> Harness {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create("test session").unwrap();
        let (tx, rx) = broadcast::channel(512);
        let provider: Arc<dyn Provider> = Arc::new(MockProvider::new(responses));
        let turn_runner = TurnRunner::new(
            provider,
            Arc::new(registry),
            db.clone(),
            tx.clone(),
            std::env::temp_dir(),
        );
        Harness {
            runner: AgentRunner::new(turn_runner, config, db.clone(), tx),
            session_id: session.id,
            event_repo: EventRepo::new(db),
            queue: MessageQueue::new(),
            cancel: CancellationToken::new(),
            rx,
        }
    }

    fn drain_events(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn text_only_prompt_runs_one_turn() {
        let mut h = harness(
            vec![MockResponse::stream_text("hello there")],
            ToolRegistry::new(),
            RunnerConfig::default(),
        );

        let turns = h
            .runner
            .run(&h.session_id, "hi".into(), &h.queue, &h.cancel)
            .await
            .unwrap();
        assert_eq!(turns, 1);

        let messages = h.event_repo.reconstruct_messages(&h.session_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role(), "user");
        match &messages[1] {
            Message::Assistant(m) => {
                assert_eq!(m.text_content(), "hello there");
                assert_eq!(m.stop_reason, Some(StopReason::EndTurn));
            }
            other => panic!("expected assistant message, got {other:?}"),
        }

        let events = drain_events(&mut h.rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::AgentComplete { error: None, .. })));
    }

    #[tokio::test]
    async fn tool_call_turn_executes_and_continues() {
        let (tool, calls) = EchoTool::new();
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(tool));

        let h = harness(
            vec![
                MockResponse::stream_tool_call("toolu_1", "echo", r#"{"value":"ping"}"#),
                MockResponse::stream_text("done"),
            ],
            registry,
            RunnerConfig::default(),
        );

        let turns = h
            .runner
            .run(&h.session_id, "run echo".into(), &h.queue, &h.cancel)
            .await
            .unwrap();
        assert_eq!(turns, 2);
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(calls.lock()[0]["value"], "ping");

        let messages = h.event_repo.reconstruct_messages(&h.session_id).unwrap();
        // user, assistant(tool call), tool result, assistant(final)
        assert_eq!(messages.len(), 4);
        match &messages[2] {
            Message::ToolResult(r) => {
                assert!(!r.is_error);
                assert_eq!(r.tool_call_id.as_str(), "toolu_1");
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_arguments_report_error_without_running_the_tool() {
        let (tool, calls) = EchoTool::new();
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(tool));

        let h = harness(
            vec![
                MockResponse::stream_tool_call("toolu_1", "echo", r#"{"wrong":"field"}"#),
                MockResponse::stream_text("recovered"),
            ],
            registry,
            RunnerConfig::default(),
        );

        h.runner
            .run(&h.session_id, "run echo".into(), &h.queue, &h.cancel)
            .await
            .unwrap();
        assert!(calls.lock().is_empty());

        let messages = h.event_repo.reconstruct_messages(&h.session_id).unwrap();
        match &messages[2] {
            Message::ToolResult(r) => assert!(r.is_error),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn max_turns_limit_trips() {
        let (tool, _calls) = EchoTool::new();
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(tool));

        let responses = (0..5)
            .map(|i| {
                MockResponse::stream_tool_call(
                    &format!("toolu_{i}"),
                    "echo",
                    r#"{"value":"again"}"#,
                )
            })
            .collect();
        let h = harness(
            responses,
            registry,
            RunnerConfig {
                max_turns_per_prompt: 2,
                ..Default::default()
            },
        );

        let err = h
            .runner
            .run(&h.session_id, "loop forever".into(), &h.queue, &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MaxTurnsExceeded(2)));
    }

    #[tokio::test]
    async fn follow_up_starts_a_new_exchange() {
        let mut h = harness(
            vec![
                MockResponse::stream_text("first answer"),
                MockResponse::stream_text("second answer"),
            ],
            ToolRegistry::new(),
            RunnerConfig::default(),
        );
        h.queue.push(crate::queue::Lane::FollowUp, "and then?");

        let turns = h
            .runner
            .run(&h.session_id, "first question".into(), &h.queue, &h.cancel)
            .await
            .unwrap();
        assert_eq!(turns, 2);
        assert!(h.queue.is_empty());

        let messages = h.event_repo.reconstruct_messages(&h.session_id).unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].role(), "user");

        let events = drain_events(&mut h.rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::FollowUpStarted { .. })));
    }

    #[tokio::test]
    async fn steering_discards_the_partial_turn() {
        let mut h = harness(
            vec![
                MockResponse::stream_text("this response is thrown away"),
                MockResponse::stream_text("steered answer"),
            ],
            ToolRegistry::new(),
            RunnerConfig::default(),
        );
        h.queue.push(crate::queue::Lane::Steering, "actually, do this instead");

        let turns = h
            .runner
            .run(&h.session_id, "original ask".into(), &h.queue, &h.cancel)
            .await
            .unwrap();
        assert_eq!(turns, 2);

        let messages = h.event_repo.reconstruct_messages(&h.session_id).unwrap();
        // The interrupted turn persists nothing: user, steering user, assistant.
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role(), "user");
        match &messages[2] {
            Message::Assistant(m) => assert_eq!(m.text_content(), "steered answer"),
            other => panic!("expected assistant message, got {other:?}"),
        }

        let events = drain_events(&mut h.rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::SteeringApplied { .. })));
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Wait until aborted"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            json!({ "type": "object", "properties": {} })
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            ctx: &ToolContext,
        ) -> Result<ToolResult, ToolError> {
            tokio::select! {
                _ = ctx.abort_signal.cancelled() => Err(ToolError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    Ok(ToolResult::ok("done", Duration::from_millis(1)))
                }
            }
        }
    }

    #[tokio::test]
    async fn steering_during_dispatch_cancels_running_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool));

        let h = harness(
            vec![
                MockResponse::stream_tool_call("toolu_slow", "slow", "{}"),
                MockResponse::stream_text("after steering"),
            ],
            registry,
            RunnerConfig::default(),
        );

        let queue = Arc::new(MessageQueue::new());
        let q = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            q.push(crate::queue::Lane::Steering, "stop that");
        });

        let turns = h
            .runner
            .run(&h.session_id, "do the slow thing".into(), &queue, &h.cancel)
            .await
            .unwrap();
        assert_eq!(turns, 2);

        let messages = h.event_repo.reconstruct_messages(&h.session_id).unwrap();
        // user, assistant(tool call), cancelled result, steering user, assistant
        assert_eq!(messages.len(), 5);
        match &messages[2] {
            Message::ToolResult(r) => {
                assert!(r.is_error);
                assert_eq!(r.tool_call_id.as_str(), "toolu_slow");
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        assert_eq!(messages[3].role(), "user");
        match &messages[4] {
            Message::Assistant(m) => assert_eq!(m.text_content(), "after steering"),
            other => panic!("expected assistant message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_gate_rejects_second_run() {
        let gate = SessionGate::new();
        let sid = SessionId::from_raw("sess_gate");
        let guard = gate.try_acquire(&sid).unwrap();
        assert!(matches!(
            gate.try_acquire(&sid),
            Err(EngineError::SessionBusy(_))
        ));
        drop(guard);
        assert!(gate.try_acquire(&sid).is_ok());
    }

    #[tokio::test]
    async fn cancelled_run_aborts() {
        let h = harness(
            vec![MockResponse::stream_text("never used")],
            ToolRegistry::new(),
            RunnerConfig::default(),
        );
        h.cancel.cancel();

        let err = h
            .runner
            .run(&h.session_id, "hi".into(), &h.queue, &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Aborted));
    }

    #[tokio::test]
    async fn provider_error_surfaces_from_stream() {
        let h = harness(
            vec![MockResponse::stream_error(
                &helm_core::errors::ProviderError::Overloaded,
            )],
            ToolRegistry::new(),
            RunnerConfig::default(),
        );

        let err = h
            .runner
            .run(&h.session_id, "hi".into(), &h.queue, &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));

        let mut rx = h.rx;
        let events = drain_events(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::AgentComplete { error: Some(_), .. })));
    }

    #[tokio::test]
    async fn session_resumes_after_a_persisted_assistant_turn() {
        let h = harness(
            vec![
                MockResponse::stream_text("first answer"),
                MockResponse::stream_text("second answer"),
            ],
            ToolRegistry::new(),
            RunnerConfig::default(),
        );

        h.runner
            .run(&h.session_id, "first question".into(), &h.queue, &h.cancel)
            .await
            .unwrap();

        // The second run reconstructs the transcript, so the persisted
        // assistant payload has to decode as a role-tagged message.
        h.runner
            .run(&h.session_id, "second question".into(), &h.queue, &h.cancel)
            .await
            .unwrap();

        let messages = h.event_repo.reconstruct_messages(&h.session_id).unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].role(), "assistant");
        match &messages[3] {
            Message::Assistant(m) => assert_eq!(m.text_content(), "second answer"),
            other => panic!("expected assistant message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn steering_landing_with_the_terminal_event_still_applies() {
        let mut h = harness(
            vec![
                // A stream that is terminal from its first event: steering
                // queued now is only visible at the natural stop.
                MockResponse::Stream(vec![StreamEvent::Done {
                    stop_reason: StopReason::EndTurn,
                    usage: None,
                }]),
                MockResponse::stream_text("steered answer"),
                MockResponse::stream_text("follow-up answer"),
            ],
            ToolRegistry::new(),
            RunnerConfig::default(),
        );
        h.queue.push(crate::queue::Lane::Steering, "wait, change course");
        h.queue.push(crate::queue::Lane::FollowUp, "and afterwards?");

        let turns = h
            .runner
            .run(&h.session_id, "original ask".into(), &h.queue, &h.cancel)
            .await
            .unwrap();
        assert_eq!(turns, 3);
        assert!(h.queue.is_empty());

        let messages = h.event_repo.reconstruct_messages(&h.session_id).unwrap();
        assert_eq!(messages.len(), 6);
        match &messages[3] {
            Message::Assistant(m) => assert_eq!(m.text_content(), "steered answer"),
            other => panic!("expected assistant message, got {other:?}"),
        }
        match &messages[5] {
            Message::Assistant(m) => assert_eq!(m.text_content(), "follow-up answer"),
            other => panic!("expected assistant message, got {other:?}"),
        }

        let events = drain_events(&mut h.rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::SteeringApplied { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::FollowUpStarted { .. })));
    }

    #[tokio::test]
    async fn tool_call_lifecycle_reaches_a_terminal_state() {
        let (tool, _calls) = EchoTool::new();
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(tool));
        let registry = Arc::new(registry);

        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create("test session").unwrap();
        let (tx, _rx) = broadcast::channel(64);
        let provider: Arc<dyn Provider> = Arc::new(MockProvider::new(vec![]));
        let runner = TurnRunner::new(
            provider,
            Arc::clone(&registry),
            db,
            tx,
            std::env::temp_dir(),
        );

        let mut acc = ToolCallAccumulator::new(&registry.definitions());
        let ok_id = ToolCallId::from_raw("toolu_ok");
        acc.start(ok_id.clone(), "echo".into()).unwrap();
        acc.fragment(&ok_id, r#"{"value":"hi"}"#).unwrap();
        acc.complete(&ok_id).unwrap();
        let bad_id = ToolCallId::from_raw("toolu_bad");
        acc.start(bad_id.clone(), "echo".into()).unwrap();
        acc.fragment(&bad_id, r#"{"wrong":1}"#).unwrap();
        acc.complete(&bad_id).unwrap();

        let queue = MessageQueue::new();
        let cancel = CancellationToken::new();
        let (results, steered) = runner
            .run_tool_calls(&mut acc, &session.id, &AgentId::new(), &cancel, &queue)
            .await
            .unwrap();

        assert!(!steered);
        assert_eq!(results.len(), 2);
        assert_eq!(acc.get(&ok_id).unwrap().state, ToolCallState::Completed);
        let failed = acc.get(&bad_id).unwrap();
        assert_eq!(failed.state, ToolCallState::Failed);
        assert!(failed.error.is_some());
    }
}
