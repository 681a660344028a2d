//! The per-thread turn loop.
//!
//! One invocation appends the input, then alternates completion calls and
//! tool execution until the model answers in plain text, parks on an
//! external task, is stopped, or runs out of turns.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use atrium_core::errors::CompletionError;
use atrium_core::events::{NotificationChannel, NotificationEvent};
use atrium_core::launcher::PendingExternalTask;
use atrium_core::messages::{AssistantMessage, InputOrigin, Message, ToolCallBlock};
use atrium_core::provider::{CompletionProvider, CompletionRequest, ToolChoice};
use atrium_core::stream::StreamEvent;
use atrium_core::tokens::TokenUsage;
use atrium_core::tools::{ToolContext, ToolOutput, WAIT_TOOL_NAME};
use atrium_core::{RunId, RunMode, TenantKey, ThreadId};
use atrium_store::{ChatHistoryManager, SessionStateManager, ThreadHistory};

use crate::compaction::Compactor;
use crate::debounce::ChunkDebouncer;
use crate::error::EngineError;
use crate::registry::{ToolRegistry, ToolScope};
use crate::streaming::{StreamGuard, StreamingController};

const ENFORCEMENT_REMINDER: &str = "A workflow is running on this thread. Continue it by calling one of the \
available tools. Call wait_on_external_task if you are blocked on a launched task.";

#[derive(Clone, Debug)]
pub struct BrainConfig {
    pub max_turns: u32,
    pub token_budget: u64,
    pub tool_timeout: Duration,
    pub debounce: Duration,
    pub system_prompt: String,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            token_budget: 120_000,
            tool_timeout: Duration::from_secs(120),
            debounce: Duration::from_millis(75),
            system_prompt: String::new(),
        }
    }
}

/// Collaborators shared by every brain of an instance.
#[derive(Clone)]
pub struct BrainServices {
    pub provider: Arc<dyn CompletionProvider>,
    pub registry: Arc<ToolRegistry>,
    pub history: Arc<ChatHistoryManager>,
    pub sessions: Arc<SessionStateManager>,
    pub streams: Arc<StreamingController>,
    pub notifier: Arc<dyn NotificationChannel>,
    pub config: Arc<BrainConfig>,
}

/// One input to the turn loop.
#[derive(Clone, Debug)]
pub struct TurnInput {
    pub message: Message,
    pub mode: RunMode,
    pub scope: ToolScope,
    pub run_id: Option<RunId>,
    /// Re-derive `mode` from presence before every turn.
    pub follow_presence: bool,
}

impl TurnInput {
    /// A message typed by a user who is looking at the thread.
    pub fn conversation(text: impl Into<String>) -> Self {
        Self {
            message: Message::user_text(text),
            mode: RunMode::Ui,
            scope: ToolScope::Conversation,
            run_id: None,
            follow_presence: false,
        }
    }

    /// Input that drives a workflow run (kickoff, resume preamble, callback result).
    pub fn workflow(text: impl Into<String>, origin: InputOrigin, run_id: RunId, mode: RunMode) -> Self {
        Self {
            message: Message::input(text, origin),
            mode,
            scope: ToolScope::Workflow,
            run_id: Some(run_id),
            follow_presence: true,
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BrainOutcome {
    /// The model answered in plain text.
    Completed { text: String, turns: u32 },
    /// The loop parked on external work. `pending` lists tasks launched in this invocation.
    Waiting {
        pending: Vec<PendingExternalTask>,
        turns: u32,
    },
    /// Stopped by the user. Whatever streamed so far is kept in history.
    Stopped { partial: String },
}

impl BrainOutcome {
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Completed { text, .. } => Some(text),
            Self::Stopped { partial } => Some(partial),
            Self::Waiting { .. } => None,
        }
    }
}

enum Streamed {
    Done(AssistantMessage),
    Stopped(String),
}

/// Conversation state holder for one thread. Callers serialize invocations.
pub struct Brain {
    tenant: TenantKey,
    thread_id: ThreadId,
    services: BrainServices,
    compactor: Compactor,
    /// Business context appended to the system prompt.
    context: parking_lot::RwLock<Option<String>>,
}

impl Brain {
    pub fn new(tenant: TenantKey, thread_id: ThreadId, services: BrainServices) -> Self {
        let compactor = Compactor::new(services.provider.clone());
        Self {
            tenant,
            thread_id,
            services,
            compactor,
            context: parking_lot::RwLock::new(None),
        }
    }

    /// Replace the business context. Takes effect on the next turn.
    pub fn set_context(&self, context: Option<String>) {
        *self.context.write() = context;
    }

    fn system_prompt(&self) -> String {
        let base = &self.services.config.system_prompt;
        match self.context.read().as_deref() {
            Some(ctx) if !ctx.trim().is_empty() => {
                format!("{base}\n\n# Business context\n{ctx}")
            }
            _ => base.clone(),
        }
    }

    pub fn tenant(&self) -> &TenantKey {
        &self.tenant
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub async fn history(&self) -> ThreadHistory {
        self.services.history.load(&self.tenant, &self.thread_id).await
    }

    /// Run the loop for one input.
    #[instrument(skip(self, input), fields(tenant = %self.tenant, thread = %self.thread_id, scope = ?input.scope))]
    pub async fn run(&self, input: TurnInput) -> Result<BrainOutcome, EngineError> {
        let mut guard = self.services.streams.begin(&self.tenant, &self.thread_id).await;
        let result = self.run_loop(input, &mut guard).await;
        guard.finish().await;
        match &result {
            Ok(outcome) => debug!(?outcome, "brain run finished"),
            Err(e) => warn!(error = %e, code = e.code(), "brain run failed"),
        }
        result
    }

    async fn run_loop(&self, input: TurnInput, guard: &mut StreamGuard) -> Result<BrainOutcome, EngineError> {
        let config = self.services.config.clone();
        let TurnInput {
            message,
            mut mode,
            scope,
            run_id,
            follow_presence,
        } = input;

        self.record(vec![message], None).await;
        let mut nudged = false;

        for turn in 1..=config.max_turns {
            if guard.is_cancelled() {
                return Ok(self.stopped(mode, String::new()));
            }
            if follow_presence {
                mode = self.presence_mode().await;
            }

            let history = self.compact_if_needed(mode).await;
            let request = CompletionRequest {
                system_prompt: self.system_prompt(),
                history: history.messages,
                tools: self.services.registry.definitions(scope),
                tool_choice: match scope {
                    ToolScope::Workflow => ToolChoice::Required,
                    ToolScope::Conversation => ToolChoice::Auto,
                },
            };
            debug!(turn, %mode, messages = request.history.len(), "turn started");

            let message = match self.complete_with_retry(&request, mode, guard).await? {
                Streamed::Done(message) => message,
                Streamed::Stopped(partial) => {
                    if !partial.is_empty() {
                        self.record(vec![Message::assistant_text(partial.clone())], None).await;
                    }
                    return Ok(self.stopped(mode, partial));
                }
            };
            let usage = message.usage;

            if !message.has_tool_calls() {
                let text = message.text_content();
                self.record(vec![Message::Assistant(message)], usage).await;
                if scope == ToolScope::Workflow && !nudged {
                    nudged = true;
                    info!(turn, "workflow turn answered without a tool call, reminding");
                    self.record(vec![Message::input(ENFORCEMENT_REMINDER, InputOrigin::ToolEnforcement)], None)
                        .await;
                    continue;
                }
                self.publish(
                    mode,
                    NotificationEvent::MessageComplete {
                        thread_id: self.thread_id.clone(),
                        text: text.clone(),
                    },
                );
                return Ok(BrainOutcome::Completed { text, turns: turn });
            }

            let calls: Vec<ToolCallBlock> = message.tool_calls().into_iter().cloned().collect();
            self.record(vec![Message::Assistant(message)], usage).await;

            let mut results = Vec::with_capacity(calls.len());
            let mut pending = Vec::new();
            let mut wait_requested = false;
            for call in &calls {
                let output = self.execute_tool(call, scope, run_id.as_ref(), guard).await;
                if call.name == WAIT_TOOL_NAME && !output.is_error {
                    wait_requested = true;
                }
                if let Some(task) = output.launched.clone() {
                    self.publish(
                        mode,
                        NotificationEvent::ExternalTaskLaunched {
                            thread_id: self.thread_id.clone(),
                            correlation_id: task.correlation_id.clone(),
                            task_type: task.task_type.clone(),
                        },
                    );
                    pending.push(task);
                }
                results.push(Message::tool_result(call.id.clone(), output.content, output.is_error));
            }
            self.record(results, None).await;

            if wait_requested || !pending.is_empty() {
                self.publish(
                    mode,
                    NotificationEvent::AgentWaiting {
                        thread_id: self.thread_id.clone(),
                        correlation_id: pending.first().map(|t| t.correlation_id.clone()),
                    },
                );
                info!(turn, pending = pending.len(), "brain waiting on external work");
                return Ok(BrainOutcome::Waiting { pending, turns: turn });
            }
            if guard.should_stop().await {
                return Ok(self.stopped(mode, String::new()));
            }
        }

        error!(max_turns = config.max_turns, "turn limit reached");
        Err(EngineError::MaxTurnsExceeded(config.max_turns))
    }

    async fn presence_mode(&self) -> RunMode {
        if self
            .services
            .sessions
            .is_user_on_thread(&self.tenant, &self.thread_id)
            .await
        {
            RunMode::Ui
        } else {
            RunMode::Background
        }
    }

    async fn compact_if_needed(&self, mode: RunMode) -> ThreadHistory {
        let history = self.history().await;
        if !history.counters.exceeds(self.services.config.token_budget) {
            return history;
        }
        let (compacted, result) = self.compactor.compact(&history).await;
        if let Err(e) = self
            .services
            .history
            .replace(&self.tenant, &self.thread_id, compacted.clone())
            .await
        {
            warn!(error = %e, "compacted history not externalized");
        }
        self.publish(
            mode,
            NotificationEvent::CompactionComplete {
                thread_id: self.thread_id.clone(),
                tokens_before: result.tokens_before,
                tokens_after: result.tokens_after,
            },
        );
        compacted
    }

    /// One completion, retried once on a transient failure.
    async fn complete_with_retry(
        &self,
        request: &CompletionRequest,
        mode: RunMode,
        guard: &mut StreamGuard,
    ) -> Result<Streamed, EngineError> {
        match self.stream_once(request, mode, guard).await {
            Ok(streamed) => Ok(streamed),
            Err(e) if e.is_retryable() => {
                warn!(error = %e, kind = e.error_kind(), "completion failed, retrying once");
                if let Some(delay) = e.suggested_delay() {
                    tokio::time::sleep(delay).await;
                }
                Ok(self.stream_once(request, mode, guard).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stream_once(
        &self,
        request: &CompletionRequest,
        mode: RunMode,
        guard: &mut StreamGuard,
    ) -> Result<Streamed, CompletionError> {
        let mut stream = self.services.provider.stream(request).await?;
        let mut debouncer = ChunkDebouncer::new(self.services.config.debounce);
        let mut partial = String::new();

        while let Some(event) = stream.next().await {
            if guard.should_stop().await {
                self.flush(mode, &mut debouncer);
                return Ok(Streamed::Stopped(partial));
            }
            match event {
                StreamEvent::TextDelta { delta } => {
                    partial.push_str(&delta);
                    if mode.is_live() {
                        if let Some(batch) = debouncer.push(&delta) {
                            self.publish_delta(batch);
                        }
                    }
                }
                StreamEvent::ToolCall { .. } => {}
                StreamEvent::Done { message } => {
                    self.flush(mode, &mut debouncer);
                    return Ok(Streamed::Done(message));
                }
                StreamEvent::Error { error } => return Err(error),
            }
        }
        Err(CompletionError::StreamInterrupted("stream ended without Done event".into()))
    }

    async fn execute_tool(
        &self,
        call: &ToolCallBlock,
        scope: ToolScope,
        run_id: Option<&RunId>,
        guard: &StreamGuard,
    ) -> ToolOutput {
        let registry = &self.services.registry;
        let Some(tool) = registry.get(&call.name) else {
            warn!(tool = %call.name, "unknown tool requested");
            return ToolOutput::error(format!("Unknown tool: {}", call.name));
        };
        if !registry.allowed(&call.name, scope) {
            warn!(tool = %call.name, "workflow tool requested outside a running workflow");
            return ToolOutput::error(format!(
                "Tool {} is only available while a workflow is running.",
                call.name
            ));
        }

        let ctx = ToolContext {
            tenant: self.tenant.clone(),
            thread_id: self.thread_id.clone(),
            run_id: run_id.cloned(),
            abort_signal: guard.cancel_token(),
        };
        let timeout = self.services.config.tool_timeout;
        let start = Instant::now();
        let result = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(tool.execute(call.arguments.clone(), &ctx)).catch_unwind(),
        )
        .await;
        let duration = start.elapsed();

        match result {
            Ok(Ok(Ok(output))) => {
                debug!(tool = %call.name, ?duration, is_error = output.is_error, "tool finished");
                output
            }
            Ok(Ok(Err(e))) => {
                warn!(tool = %call.name, error = %e, "tool failed");
                ToolOutput::error(e.to_string())
            }
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %call.name, panic = %msg, "tool panicked");
                ToolOutput::error(format!("Tool {} crashed: {msg}", call.name))
            }
            Err(_) => {
                warn!(tool = %call.name, ?timeout, "tool timed out");
                ToolOutput::error(format!("Tool {} timed out after {}s", call.name, timeout.as_secs()))
            }
        }
    }

    /// History writes keep the local copy when the store rejects them.
    async fn record(&self, messages: Vec<Message>, usage: Option<TokenUsage>) {
        if let Err(e) = self
            .services
            .history
            .append(&self.tenant, &self.thread_id, messages, usage)
            .await
        {
            warn!(error = %e, "history append not externalized");
        }
    }

    fn stopped(&self, mode: RunMode, partial: String) -> BrainOutcome {
        self.publish(
            mode,
            NotificationEvent::StreamStopped {
                thread_id: self.thread_id.clone(),
            },
        );
        info!("brain run stopped");
        BrainOutcome::Stopped { partial }
    }

    fn flush(&self, mode: RunMode, debouncer: &mut ChunkDebouncer) {
        if !mode.is_live() {
            return;
        }
        if let Some(batch) = debouncer.flush() {
            self.publish_delta(batch);
        }
    }

    fn publish_delta(&self, delta: String) {
        self.services.notifier.publish(
            &self.tenant.user_id,
            NotificationEvent::TextDelta {
                thread_id: self.thread_id.clone(),
                delta,
            },
        );
    }

    fn publish(&self, mode: RunMode, event: NotificationEvent) {
        if mode.is_live() {
            self.services.notifier.publish(&self.tenant.user_id, event);
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockProvider, MockResponse};
    use crate::streaming::StopOutcome;
    use crate::workflow::WorkflowManager;
    use async_trait::async_trait;
    use atrium_core::events::NullChannel;
    use atrium_core::tools::{Tool, ToolError, ToolKind};
    use atrium_store::{MemoryStore, StateStore};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<NotificationEvent>>);

    impl NotificationChannel for Recorder {
        fn publish(&self, _user_id: &atrium_core::UserId, event: NotificationEvent) {
            self.0.lock().push(event);
        }
    }

    impl Recorder {
        fn types(&self) -> Vec<&'static str> {
            self.0.lock().iter().map(|e| e.event_type()).collect()
        }

        fn streamed_text(&self) -> String {
            self.0
                .lock()
                .iter()
                .filter_map(|e| match e {
                    NotificationEvent::TextDelta { delta, .. } => Some(delta.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, args: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text(format!("echo: {}", args["text"].as_str().unwrap_or(""))))
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "explode"
        }
        fn description(&self) -> &str {
            "panics"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            panic!("boom");
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(ToolOutput::text("late"))
        }
    }

    struct FakeLaunch;

    #[async_trait]
    impl Tool for FakeLaunch {
        fn name(&self) -> &str {
            "launch_external_task"
        }
        fn description(&self) -> &str {
            "launch"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn kind(&self) -> ToolKind {
            ToolKind::LongRunning
        }
        async fn execute(&self, _args: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::launched(
                "launched",
                PendingExternalTask::new("export", Some("collect".into())),
            ))
        }
    }

    struct Harness {
        brain: Arc<Brain>,
        provider: Arc<MockProvider>,
        recorder: Arc<Recorder>,
        services: BrainServices,
        workflows: Arc<WorkflowManager>,
    }

    fn harness(responses: Vec<MockResponse>, config: BrainConfig) -> Harness {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new(responses));
        let recorder = Arc::new(Recorder::default());
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(PanicTool));
        registry.register(Arc::new(SlowTool));
        registry.register(Arc::new(FakeLaunch));
        let workflows = Arc::new(WorkflowManager::new(
            store.clone(),
            "atrium",
            Duration::from_secs(3600),
            Arc::new(NullChannel),
        ));
        registry.register(Arc::new(crate::tools::wait::WaitOnExternalTaskTool::new(workflows.clone())));
        let services = BrainServices {
            provider: provider.clone(),
            registry: Arc::new(registry),
            history: Arc::new(ChatHistoryManager::new(store.clone(), "atrium", Duration::from_secs(3600))),
            sessions: Arc::new(SessionStateManager::new(store.clone(), "atrium", Duration::from_secs(3600))),
            streams: Arc::new(StreamingController::new(store, "atrium")),
            notifier: recorder.clone(),
            config: Arc::new(config),
        };
        let brain = Arc::new(Brain::new(
            TenantKey::new("alice", "acme"),
            ThreadId::from_raw("ops"),
            services.clone(),
        ));
        Harness {
            brain,
            provider,
            recorder,
            services,
            workflows,
        }
    }

    impl Harness {
        /// Running workflow on the harness thread with one launched task.
        async fn run_with_pending_task(&self) -> RunId {
            let tenant = TenantKey::new("alice", "acme");
            let thread = ThreadId::from_raw("ops");
            let step = crate::workflow::ChecklistStep::new("collect", "Collect");
            let t = self.workflows.start(&tenant, &thread, "report", "", vec![step], false).await.unwrap();
            let task = PendingExternalTask::new("export", Some("collect".into()));
            self.workflows.track_launch(&tenant, &thread, Some(&t.run.run_id), &task).await.unwrap();
            t.run.run_id
        }
    }

    fn quick() -> BrainConfig {
        BrainConfig {
            debounce: Duration::ZERO,
            ..BrainConfig::default()
        }
    }

    #[tokio::test]
    async fn plain_text_completes_and_streams_in_ui_mode() {
        let h = harness(vec![MockResponse::text("hi there")], quick());
        let outcome = h.brain.run(TurnInput::conversation("hello")).await.unwrap();

        assert_eq!(
            outcome,
            BrainOutcome::Completed {
                text: "hi there".into(),
                turns: 1
            }
        );
        assert_eq!(h.recorder.types(), vec!["text_delta", "message_complete"]);
        let history = h.brain.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history.counters.used(), 15);
        assert_eq!(h.provider.last_request().unwrap().tool_choice, ToolChoice::Auto);
    }

    #[tokio::test]
    async fn background_mode_publishes_nothing() {
        let h = harness(vec![MockResponse::text("done")], quick());
        let input = TurnInput::conversation("go").with_mode(RunMode::Background);
        h.brain.run(input).await.unwrap();
        assert!(h.recorder.types().is_empty());
        assert_eq!(h.brain.history().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_are_debounced() {
        let config = BrainConfig {
            debounce: Duration::from_millis(100),
            ..BrainConfig::default()
        };
        let h = harness(
            vec![MockResponse::chunks(&["a", "b", "c", "d"], Duration::from_millis(30))],
            config,
        );
        h.brain.run(TurnInput::conversation("x")).await.unwrap();
        let deltas = h.recorder.types().iter().filter(|t| **t == "text_delta").count();
        assert!(deltas < 4, "expected batching, got {deltas} deltas");
        assert_eq!(h.recorder.streamed_text(), "abcd");
    }

    #[tokio::test]
    async fn fast_tool_result_feeds_next_turn() {
        let h = harness(
            vec![
                MockResponse::tool_call("echo", serde_json::json!({"text": "ping"})),
                MockResponse::text("pong"),
            ],
            quick(),
        );
        let outcome = h.brain.run(TurnInput::conversation("call echo")).await.unwrap();
        assert_eq!(outcome.text(), Some("pong"));

        let second = &h.provider.requests()[1];
        assert!(second
            .history
            .iter()
            .any(|m| matches!(m, Message::ToolResult(r) if r.content == "echo: ping")));
    }

    #[tokio::test]
    async fn wait_tool_parks_the_loop() {
        let h = harness(
            vec![MockResponse::tool_call(WAIT_TOOL_NAME, serde_json::json!({}))],
            quick(),
        );
        let run_id = h.run_with_pending_task().await;
        let input = TurnInput::workflow("kickoff", InputOrigin::ScheduledTask, run_id, RunMode::Background);
        let outcome = h.brain.run(input).await.unwrap();
        assert_eq!(
            outcome,
            BrainOutcome::Waiting {
                pending: vec![],
                turns: 1
            }
        );
        assert_eq!(h.provider.call_count(), 1);
    }

    #[tokio::test]
    async fn wait_with_nothing_pending_is_reported_to_the_model() {
        let h = harness(
            vec![
                MockResponse::tool_call(WAIT_TOOL_NAME, serde_json::json!({})),
                MockResponse::text("nothing to wait on"),
                MockResponse::text("giving up"),
            ],
            quick(),
        );
        let input = TurnInput::workflow("kickoff", InputOrigin::ScheduledTask, RunId::new(), RunMode::Background);
        let outcome = h.brain.run(input).await.unwrap();

        assert!(!outcome.is_waiting());
        let second = &h.provider.requests()[1];
        assert!(second.history.iter().any(
            |m| matches!(m, Message::ToolResult(r) if r.is_error && r.content.starts_with("Nothing to wait for"))
        ));
    }

    #[tokio::test]
    async fn long_running_tool_returns_pending_task() {
        let h = harness(
            vec![MockResponse::tool_call("launch_external_task", serde_json::json!({}))],
            quick(),
        );
        let outcome = h.brain.run(TurnInput::conversation("export")).await.unwrap();
        match outcome {
            BrainOutcome::Waiting { pending, .. } => assert_eq!(pending[0].task_type, "export"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.recorder.types(), vec!["external_task_launched", "agent_waiting"]);
    }

    #[tokio::test]
    async fn workflow_text_answer_gets_one_reminder() {
        let h = harness(vec![MockResponse::text("thinking"), MockResponse::text("still thinking")], quick());
        let input = TurnInput::workflow("kickoff", InputOrigin::ScheduledTask, RunId::new(), RunMode::Background);
        let outcome = h.brain.run(input).await.unwrap();

        assert_eq!(outcome.text(), Some("still thinking"));
        let requests = h.provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tool_choice, ToolChoice::Required);
        assert!(requests[1].history.iter().any(
            |m| matches!(m, Message::User(u) if u.origin == InputOrigin::ToolEnforcement)
        ));
    }

    #[tokio::test]
    async fn conversation_scope_hides_and_rejects_workflow_tools() {
        let h = harness(
            vec![MockResponse::tool_call(WAIT_TOOL_NAME, serde_json::json!({})), MockResponse::text("ok")],
            quick(),
        );
        let outcome = h.brain.run(TurnInput::conversation("hello")).await.unwrap();
        assert_eq!(outcome.text(), Some("ok"));

        let first = &h.provider.requests()[0];
        assert!(first.tools.iter().all(|t| t.name != WAIT_TOOL_NAME));
        let second = &h.provider.requests()[1];
        assert!(second
            .history
            .iter()
            .any(|m| matches!(m, Message::ToolResult(r) if r.is_error)));
    }

    #[tokio::test]
    async fn transient_failure_retried_once() {
        let h = harness(
            vec![
                MockResponse::Error(CompletionError::ServerError {
                    status: 503,
                    body: "busy".into(),
                }),
                MockResponse::text("recovered"),
            ],
            quick(),
        );
        let outcome = h.brain.run(TurnInput::conversation("hi")).await.unwrap();
        assert_eq!(outcome.text(), Some("recovered"));
        assert_eq!(h.provider.call_count(), 2);
    }

    #[tokio::test]
    async fn second_transient_failure_surfaces() {
        let h = harness(
            vec![
                MockResponse::stream_error(CompletionError::NetworkError("reset".into())),
                MockResponse::stream_error(CompletionError::NetworkError("reset".into())),
            ],
            quick(),
        );
        let err = h.brain.run(TurnInput::conversation("hi")).await.unwrap_err();
        assert_eq!(err.code(), "completion_unavailable");
        // The input survives the failure.
        assert_eq!(h.brain.history().await.len(), 1);
    }

    #[tokio::test]
    async fn fatal_failure_not_retried() {
        let h = harness(
            vec![MockResponse::Error(CompletionError::AuthenticationFailed("key".into()))],
            quick(),
        );
        assert!(h.brain.run(TurnInput::conversation("hi")).await.is_err());
        assert_eq!(h.provider.call_count(), 1);
    }

    #[tokio::test]
    async fn turn_limit() {
        let config = BrainConfig {
            max_turns: 2,
            ..quick()
        };
        let h = harness(
            vec![
                MockResponse::tool_call("echo", serde_json::json!({})),
                MockResponse::tool_call("echo", serde_json::json!({})),
                MockResponse::text("never"),
            ],
            config,
        );
        let err = h.brain.run(TurnInput::conversation("loop")).await.unwrap_err();
        assert!(matches!(err, EngineError::MaxTurnsExceeded(2)));
    }

    #[tokio::test]
    async fn tool_panic_becomes_error_result() {
        let h = harness(
            vec![MockResponse::tool_call("explode", serde_json::json!({})), MockResponse::text("sorry")],
            quick(),
        );
        let outcome = h.brain.run(TurnInput::conversation("go")).await.unwrap();
        assert_eq!(outcome.text(), Some("sorry"));
        let history = h.brain.history().await;
        assert!(history
            .messages
            .iter()
            .any(|m| matches!(m, Message::ToolResult(r) if r.is_error && r.content.contains("boom"))));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_timeout_becomes_error_result() {
        let config = BrainConfig {
            tool_timeout: Duration::from_secs(1),
            ..quick()
        };
        let h = harness(
            vec![MockResponse::tool_call("slow", serde_json::json!({})), MockResponse::text("gave up")],
            config,
        );
        let outcome = h.brain.run(TurnInput::conversation("go")).await.unwrap();
        assert_eq!(outcome.text(), Some("gave up"));
        let history = h.brain.history().await;
        assert!(history
            .messages
            .iter()
            .any(|m| matches!(m, Message::ToolResult(r) if r.content.contains("timed out"))));
    }

    #[tokio::test]
    async fn over_budget_history_is_compacted_first() {
        let config = BrainConfig {
            token_budget: 100,
            ..quick()
        };
        let h = harness(vec![MockResponse::text("summary of it all"), MockResponse::text("fresh answer")], config);
        let tenant = h.brain.tenant().clone();
        let thread = h.brain.thread_id().clone();
        h.services
            .history
            .append(
                &tenant,
                &thread,
                vec![Message::user_text("old q"), Message::assistant_text("old a")],
                Some(TokenUsage::new(500, 100)),
            )
            .await
            .unwrap();

        let outcome = h.brain.run(TurnInput::conversation("new q")).await.unwrap();
        assert_eq!(outcome.text(), Some("fresh answer"));

        let answer_request = &h.provider.requests()[1];
        assert!(matches!(&answer_request.history[0], Message::Summary(_)));
        assert_eq!(answer_request.history.last().unwrap().text(), "new q");
        assert!(h.recorder.types().contains(&"compaction_complete"));
        assert_eq!(h.brain.history().await.counters.compactions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_stream_keeps_partial() {
        let h = harness(
            vec![MockResponse::chunks(&["one ", "two ", "three"], Duration::from_millis(10))],
            quick(),
        );
        let brain = h.brain.clone();
        let run = tokio::spawn(async move { brain.run(TurnInput::conversation("count")).await });

        tokio::time::sleep(Duration::from_millis(15)).await;
        let outcome = h
            .services
            .streams
            .stop(h.brain.tenant(), h.brain.thread_id())
            .await;
        assert_eq!(outcome, StopOutcome::Local);

        match run.await.unwrap().unwrap() {
            BrainOutcome::Stopped { partial } => assert_eq!(partial, "one "),
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.recorder.types().contains(&"stream_stopped"));
        let history = h.brain.history().await;
        assert_eq!(history.messages.last().unwrap().text(), "one ");
        assert!(!h.services.streams.is_streaming(h.brain.tenant(), h.brain.thread_id()).await);
    }

    #[tokio::test]
    async fn follow_presence_switches_to_ui() {
        let h = harness(vec![MockResponse::text("visible")], quick());
        h.services
            .sessions
            .enter_thread(h.brain.tenant(), h.brain.thread_id())
            .await
            .unwrap();
        let mut input = TurnInput::conversation("x").with_mode(RunMode::Background);
        input.follow_presence = true;
        h.brain.run(input).await.unwrap();
        assert_eq!(h.recorder.types(), vec!["text_delta", "message_complete"]);
    }

    #[tokio::test]
    async fn business_context_joins_system_prompt() {
        let config = BrainConfig {
            system_prompt: "You are helpful.".into(),
            ..quick()
        };
        let h = harness(vec![MockResponse::text("a"), MockResponse::text("b")], config);
        h.brain.set_context(Some("Fiscal year ends in March.".into()));
        h.brain.run(TurnInput::conversation("x")).await.unwrap();
        let prompt = h.provider.last_request().unwrap().system_prompt;
        assert!(prompt.starts_with("You are helpful."));
        assert!(prompt.contains("Fiscal year ends in March."));

        h.brain.set_context(None);
        h.brain.run(TurnInput::conversation("y")).await.unwrap();
        assert_eq!(h.provider.last_request().unwrap().system_prompt, "You are helpful.");
    }
}
