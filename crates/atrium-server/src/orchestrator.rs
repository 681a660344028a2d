//! Tenant-scoped operations exposed to the outside world.
//!
//! Every public operation returns an [`ApiResponse`]; neither errors nor
//! panics cross this boundary. Callbacks are serialized per tenant through
//! [`TenantMailboxes`], turns are serialized per thread through the session's
//! turn locks, and scheduled ticks are serialized cluster-wide through the
//! distributed lock.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use atrium_core::events::{NotificationChannel, NotificationEvent};
use atrium_core::launcher::{TaskCallback, TaskLauncher};
use atrium_core::messages::{InputOrigin, Message};
use atrium_core::provider::CompletionProvider;
use atrium_core::tools::Tool;
use atrium_core::{CorrelationId, HolderId, RunId, RunMode, RunState, TenantKey, ThreadId};
use atrium_engine::workflow::preamble;
use atrium_engine::{
    create_default_registry, BrainConfig, BrainOutcome, BrainServices, ChecklistStep, EngineError, StopOutcome,
    StreamingController, ToolScope, Transition, TurnInput, WorkflowError, WorkflowEvent, WorkflowManager, WorkflowRun,
};
use atrium_settings::{AtriumSettings, ScheduledTaskSettings, WorkflowSettings};
use atrium_store::{namespace, ChatHistoryManager, DistributedLock, ExclusiveRun, SessionStateManager, StateStore};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::context::BusinessContextProvider;
use crate::error::ServerError;
use crate::mailbox::TenantMailboxes;
use crate::manager::SessionManager;
use crate::response::{guarded, ApiResponse};
use crate::session::TurnGuard;

const MAILBOX_IDLE: Duration = Duration::from_secs(60);

/// Collaborators an orchestrator is built from.
pub struct OrchestratorDeps {
    pub store: Arc<dyn StateStore>,
    pub provider: Arc<dyn CompletionProvider>,
    pub launcher: Arc<dyn TaskLauncher>,
    pub context: Arc<dyn BusinessContextProvider>,
    pub notifier: Arc<dyn NotificationChannel>,
    /// Registered next to the built-in workflow tools.
    pub extra_tools: Vec<Arc<dyn Tool>>,
    /// Identifies this instance as a lock holder.
    pub holder: HolderId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub run_id: RunId,
    pub task_name: String,
    pub state: RunState,
    pub mode: RunMode,
    pub pending_tasks: usize,
}

impl From<&WorkflowRun> for WorkflowSummary {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            task_name: run.task_name.clone(),
            state: run.state,
            mode: run.mode,
            pending_tasks: run.pending_tasks.len(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Completed,
    Waiting,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageReply {
    pub thread_id: ThreadId,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowSummary>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceReply {
    pub thread_id: ThreadId,
    pub on_thread: bool,
    /// Presence could not be written to the shared store; local state was kept.
    pub degraded: bool,
    /// A paused run on the thread was resumed in the background.
    pub resumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowSummary>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Stopped,
    Signalled,
    NotStreaming,
}

impl From<StopOutcome> for StopStatus {
    fn from(outcome: StopOutcome) -> Self {
        match outcome {
            StopOutcome::Local => Self::Stopped,
            StopOutcome::Signalled => Self::Signalled,
            StopOutcome::NotStreaming => Self::NotStreaming,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StopReply {
    pub thread_id: ThreadId,
    pub status: StopStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    /// The result was fed to the brain and a turn was started.
    Resumed,
    /// The result was appended to history; other tasks are still outstanding.
    Recorded,
    /// Already handled here or on another instance.
    Duplicate,
    /// No pending task matches the correlation id.
    Ignored,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackReply {
    pub correlation_id: CorrelationId,
    pub outcome: CallbackOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Started { run_id: RunId },
    /// The thread already has a non-terminal run.
    AlreadyActive,
    /// Another holder owns this tick.
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledStep {
    pub id: String,
    pub title: String,
}

/// One firing of a recurring task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub user_id: String,
    pub tenant_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub checklist: Vec<ScheduledStep>,
}

impl ScheduledTask {
    pub fn tenant(&self) -> TenantKey {
        TenantKey::new(self.user_id.as_str(), self.tenant_id.as_str())
    }

    pub fn thread_id(&self) -> ThreadId {
        ThreadId::from_raw(self.thread_id.as_str())
    }

    /// Lock resource shared by every instance firing this tick.
    pub fn lock_resource(&self) -> String {
        format!("schedule:{}:{}:{}:{}", self.name, self.user_id, self.tenant_id, self.thread_id)
    }
}

impl From<&ScheduledTaskSettings> for ScheduledTask {
    fn from(s: &ScheduledTaskSettings) -> Self {
        Self {
            name: s.name.clone(),
            user_id: s.user_id.clone(),
            tenant_id: s.tenant_id.clone(),
            thread_id: s.thread_id.clone(),
            instructions: s.instructions.clone(),
            checklist: s
                .checklist
                .iter()
                .map(|c| ScheduledStep {
                    id: c.id.clone(),
                    title: c.title.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResetReply {
    pub thread_id: ThreadId,
    pub brain_dropped: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReply {
    pub status: String,
    pub instance_id: HolderId,
    pub sessions: usize,
    pub active_streams: usize,
    pub mailboxes: usize,
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn NotificationChannel>,
    presence: Arc<SessionStateManager>,
    history: Arc<ChatHistoryManager>,
    workflows: Arc<WorkflowManager>,
    streams: Arc<StreamingController>,
    services: BrainServices,
    sessions: Arc<SessionManager>,
    lock: DistributedLock,
    mailboxes: TenantMailboxes,
    runs: TaskTracker,
    holder: HolderId,
    prefix: String,
    workflow: WorkflowSettings,
}

impl Orchestrator {
    pub fn new(settings: &AtriumSettings, deps: OrchestratorDeps) -> Arc<Self> {
        let prefix = settings.store.namespace_prefix.clone();
        let store = deps.store;

        let presence = Arc::new(SessionStateManager::new(store.clone(), &prefix, settings.session.record_ttl()));
        let history = Arc::new(ChatHistoryManager::new(store.clone(), &prefix, settings.history.ttl()));
        let workflows = Arc::new(WorkflowManager::new(
            store.clone(),
            &prefix,
            settings.workflow.run_ttl(),
            deps.notifier.clone(),
        ));
        let streams = Arc::new(
            StreamingController::new(store.clone(), &prefix).with_stop_ttl(settings.workflow.stop_signal_ttl()),
        );

        let mut registry = create_default_registry(workflows.clone(), deps.launcher);
        for tool in deps.extra_tools {
            registry.register(tool);
        }

        let config = BrainConfig {
            max_turns: settings.brain.max_turns,
            token_budget: settings.brain.token_budget,
            tool_timeout: Duration::from_secs(settings.brain.tool_timeout_secs),
            debounce: Duration::from_millis(settings.brain.stream_debounce_ms),
            system_prompt: settings.brain.system_prompt.clone(),
        };
        let services = BrainServices {
            provider: deps.provider,
            registry: Arc::new(registry),
            history: history.clone(),
            sessions: presence.clone(),
            streams: streams.clone(),
            notifier: deps.notifier.clone(),
            config: Arc::new(config),
        };

        let sessions = Arc::new(
            SessionManager::new(deps.context, presence.clone(), history.clone(), workflows.clone())
                .with_context_ttl(settings.session.context_ttl())
                .with_idle_ttl(settings.session.idle_ttl()),
        );

        info!(holder = %deps.holder, tools = services.registry.count(), "orchestrator ready");
        Arc::new(Self {
            lock: DistributedLock::new(store.clone(), &prefix),
            store,
            notifier: deps.notifier,
            presence,
            history,
            workflows,
            streams,
            services,
            sessions,
            mailboxes: TenantMailboxes::new(MAILBOX_IDLE),
            runs: TaskTracker::new(),
            holder: deps.holder,
            prefix,
            workflow: settings.workflow.clone(),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn workflows(&self) -> &Arc<WorkflowManager> {
        &self.workflows
    }

    pub fn history(&self) -> &Arc<ChatHistoryManager> {
        &self.history
    }

    pub fn presence(&self) -> &Arc<SessionStateManager> {
        &self.presence
    }

    pub fn streams(&self) -> &Arc<StreamingController> {
        &self.streams
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    // ── send_message ──

    /// Run one brain invocation for a user message and return its reply.
    #[instrument(skip(self, text), fields(tenant = %tenant, thread = %thread_id))]
    pub async fn send_message(
        self: &Arc<Self>,
        tenant: TenantKey,
        thread_id: ThreadId,
        text: String,
    ) -> ApiResponse<MessageReply> {
        guarded("send_message", self.handle_message(&tenant, &thread_id, text)).await
    }

    async fn handle_message(
        self: &Arc<Self>,
        tenant: &TenantKey,
        thread_id: &ThreadId,
        text: String,
    ) -> Result<MessageReply, ServerError> {
        if text.trim().is_empty() {
            return Err(ServerError::InvalidParams("message text is empty".into()));
        }
        let session = self.sessions.get_or_create_session(tenant).await?;
        self.touch_thread(tenant, thread_id).await;

        // Applied before queueing for the thread, so chatting pauses a
        // workflow turn that is still in flight.
        let is_resume = self.is_resume_keyword(&text);
        let transition = self
            .workflows
            .apply(tenant, thread_id, WorkflowEvent::UserMessage { is_resume })
            .await?;
        let turn = session.slot(thread_id, &self.services).acquire().await;

        let input = match &transition {
            Some(t) if t.wants_resume_preamble() => {
                self.record(tenant, thread_id, Message::user_text(text)).await;
                TurnInput::workflow(
                    preamble::resume_preamble(&t.run),
                    InputOrigin::ResumePreamble,
                    t.run.run_id.clone(),
                    t.mode(),
                )
            }
            Some(t) if t.run.tools_constrained() => {
                TurnInput::workflow(text, InputOrigin::User, t.run.run_id.clone(), t.mode())
            }
            _ => TurnInput::conversation(text),
        };
        debug!(scope = ?input.scope, is_resume, "running turn for user message");

        let run_id = input.run_id.clone();
        let result = turn.run(input).await;
        self.after_run(tenant, thread_id, run_id.as_ref(), result.as_ref()).await;
        drop(turn);
        let outcome = result?;

        let workflow = self.workflows.get(tenant, thread_id).await;
        Ok(MessageReply {
            thread_id: thread_id.clone(),
            status: match &outcome {
                BrainOutcome::Completed { .. } => ReplyStatus::Completed,
                BrainOutcome::Waiting { .. } => ReplyStatus::Waiting,
                BrainOutcome::Stopped { .. } => ReplyStatus::Stopped,
            },
            text: outcome.text().map(String::from),
            workflow: workflow.as_ref().map(WorkflowSummary::from),
        })
    }

    /// Whole-message, case-insensitive match against the configured keywords.
    fn is_resume_keyword(&self, text: &str) -> bool {
        let normalized = text.trim().trim_end_matches(['.', '!']).trim().to_lowercase();
        self.workflow
            .resume_keywords
            .iter()
            .any(|k| k.trim().to_lowercase() == normalized)
    }

    // ── presence ──

    #[instrument(skip(self), fields(tenant = %tenant, thread = %thread_id))]
    pub async fn enter_thread(self: &Arc<Self>, tenant: TenantKey, thread_id: ThreadId) -> ApiResponse<PresenceReply> {
        guarded("enter_thread", self.handle_enter(&tenant, &thread_id)).await
    }

    async fn handle_enter(self: &Arc<Self>, tenant: &TenantKey, thread_id: &ThreadId) -> Result<PresenceReply, ServerError> {
        self.sessions.get_or_create_session(tenant).await?;
        let degraded = match self.presence.enter_thread(tenant, thread_id).await {
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "presence not externalized, continuing with local state");
                true
            }
        };

        // Entering one thread means leaving every other one.
        for other in self.workflows.active_threads(tenant).await {
            if &other == thread_id {
                continue;
            }
            if let Err(e) = self.user_left(tenant, &other).await {
                warn!(other = %other, error = %e, "could not apply leave to other run");
            }
        }

        let transition = self.workflows.apply(tenant, thread_id, WorkflowEvent::UserEntered).await?;
        Ok(PresenceReply {
            thread_id: thread_id.clone(),
            on_thread: true,
            degraded,
            resumed: false,
            workflow: transition.as_ref().map(|t| WorkflowSummary::from(&t.run)),
        })
    }

    #[instrument(skip(self), fields(tenant = %tenant, thread = %thread_id))]
    pub async fn leave_thread(self: &Arc<Self>, tenant: TenantKey, thread_id: ThreadId) -> ApiResponse<PresenceReply> {
        guarded("leave_thread", self.handle_leave(&tenant, &thread_id)).await
    }

    async fn handle_leave(self: &Arc<Self>, tenant: &TenantKey, thread_id: &ThreadId) -> Result<PresenceReply, ServerError> {
        self.sessions.get_or_create_session(tenant).await?;
        let degraded = match self.presence.leave_thread(tenant, thread_id).await {
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "presence not externalized, continuing with local state");
                true
            }
        };
        let resumed = self.user_left(tenant, thread_id).await?;
        let workflow = self.workflows.get(tenant, thread_id).await;
        Ok(PresenceReply {
            thread_id: thread_id.clone(),
            on_thread: false,
            degraded,
            resumed,
            workflow: workflow.as_ref().map(WorkflowSummary::from),
        })
    }

    /// Apply a leave to the thread's run. A paused run picks up in the background.
    async fn user_left(self: &Arc<Self>, tenant: &TenantKey, thread_id: &ThreadId) -> Result<bool, ServerError> {
        let Some(t) = self.workflows.apply(tenant, thread_id, WorkflowEvent::UserLeft).await? else {
            return Ok(false);
        };
        if !t.wants_resume_preamble() {
            return Ok(false);
        }
        info!(run_id = %t.run.run_id, "user left paused run, resuming in background");
        let input = TurnInput::workflow(
            preamble::resume_preamble(&t.run),
            InputOrigin::ResumePreamble,
            t.run.run_id.clone(),
            RunMode::Background,
        );
        self.spawn_run(tenant.clone(), thread_id.clone(), input, None);
        Ok(true)
    }

    // ── stop_streaming ──

    #[instrument(skip(self), fields(tenant = %tenant, thread = %thread_id))]
    pub async fn stop_streaming(self: &Arc<Self>, tenant: TenantKey, thread_id: ThreadId) -> ApiResponse<StopReply> {
        guarded("stop_streaming", async {
            let outcome = self.streams.stop(&tenant, &thread_id).await;
            info!(?outcome, "stop requested");
            Ok(StopReply {
                thread_id: thread_id.clone(),
                status: outcome.into(),
            })
        })
        .await
    }

    // ── resolve_external_task_callback ──

    /// Deliver a launcher callback. Callbacks for one tenant are handled one
    /// at a time in arrival order.
    #[instrument(skip(self, callback), fields(correlation_id = %callback.correlation_id))]
    pub async fn resolve_external_task_callback(self: &Arc<Self>, callback: TaskCallback) -> ApiResponse<CallbackReply> {
        let tenant = callback.tenant();
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        let job = async move {
            let reply = guarded("resolve_external_task_callback", this.handle_callback(callback)).await;
            let _ = tx.send(reply);
        }
        .in_current_span()
        .boxed();
        self.mailboxes.submit(&tenant, job);

        rx.await
            .unwrap_or_else(|_| ApiResponse::failure("internal", "callback handler dropped its reply"))
    }

    fn dedup_key(&self, tenant: &TenantKey, correlation_id: &CorrelationId) -> String {
        tenant.scoped_key(&namespace(&self.prefix, "callback"), correlation_id.as_str())
    }

    async fn handle_callback(self: Arc<Self>, callback: TaskCallback) -> Result<CallbackReply, ServerError> {
        let tenant = callback.tenant();
        let correlation_id = callback.correlation_id.clone();
        let dedup_key = self.dedup_key(&tenant, &correlation_id);
        let reply = |outcome, thread_id: Option<ThreadId>| CallbackReply {
            correlation_id: correlation_id.clone(),
            outcome,
            thread_id,
        };

        let Some(route) = self.workflows.route(&tenant, &correlation_id).await else {
            let seen = matches!(self.store.get(&dedup_key).await, Ok(Some(_)));
            let outcome = if seen {
                CallbackOutcome::Duplicate
            } else {
                CallbackOutcome::Ignored
            };
            info!(?outcome, "callback has no pending route");
            return Ok(reply(outcome, None));
        };
        let thread_id = route.thread_id.clone();

        // Everything fallible before the claim runs first, so a retry after an
        // error is not mistaken for a duplicate.
        let session = self.sessions.get_or_create_session(&tenant).await?;

        let claimed = self
            .store
            .set_if_absent(
                &dedup_key,
                self.holder.as_str().as_bytes().to_vec(),
                self.workflow.callback_dedup_ttl(),
            )
            .await?;
        if !claimed {
            info!(thread = %thread_id, "callback already claimed, discarding");
            return Ok(reply(CallbackOutcome::Duplicate, Some(thread_id)));
        }

        // Bounded: past the deadline the callback proceeds regardless.
        let budget = self.workflow.stream_clear_timeout();
        let deadline = Instant::now() + budget;
        if !self.streams.wait_until_clear(&tenant, &thread_id, budget).await {
            warn!(thread = %thread_id, "thread still streaming after bounded wait, proceeding");
        }

        let slot = session.slot(&thread_id, &self.services);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let turn = match tokio::time::timeout(remaining, slot.acquire()).await {
            Ok(turn) => Some(turn),
            Err(_) => {
                warn!(thread = %thread_id, "thread busy after bounded wait, queueing the resume");
                None
            }
        };

        let active = self.workflows.active(&tenant, &thread_id).await;
        let owned_by_run = matches!((&route.run_id, &active), (Some(id), Some(run)) if *id == run.run_id);
        let transition: Option<Transition> = if owned_by_run {
            match self
                .workflows
                .apply(
                    &tenant,
                    &thread_id,
                    WorkflowEvent::CallbackResolved {
                        correlation_id: correlation_id.clone(),
                    },
                )
                .await
            {
                Ok(t) => t,
                Err(EngineError::Workflow(WorkflowError::UnknownCorrelation(_))) => {
                    info!(thread = %thread_id, "correlation no longer pending on the run");
                    self.workflows.clear_route(&tenant, &correlation_id).await;
                    return Ok(reply(CallbackOutcome::Duplicate, Some(thread_id)));
                }
                Err(e) => {
                    self.release_claim(&dedup_key).await;
                    return Err(e.into());
                }
            }
        } else {
            None
        };
        self.workflows.clear_route(&tenant, &correlation_id).await;

        let outcome = match transition {
            Some(t) => match t.callback_to_resume() {
                Some(task) => {
                    let input = TurnInput::workflow(
                        preamble::callback_input(task, &callback),
                        InputOrigin::TaskCallback,
                        t.run.run_id.clone(),
                        t.mode(),
                    );
                    self.spawn_run(tenant.clone(), thread_id.clone(), input, turn);
                    CallbackOutcome::Resumed
                }
                None => {
                    let task = t.callback_to_record().unwrap_or(&route.task);
                    let text = preamble::callback_input(task, &callback);
                    self.record(&tenant, &thread_id, Message::input(text, InputOrigin::TaskCallback))
                        .await;
                    CallbackOutcome::Recorded
                }
            },
            None => {
                // Launched from conversation, or the run it belonged to is gone.
                let input = TurnInput {
                    message: Message::input(
                        preamble::callback_input(&route.task, &callback),
                        InputOrigin::TaskCallback,
                    ),
                    mode: RunMode::Background,
                    scope: ToolScope::Conversation,
                    run_id: None,
                    follow_presence: true,
                };
                self.spawn_run(tenant.clone(), thread_id.clone(), input, turn);
                CallbackOutcome::Resumed
            }
        };

        self.publish_if_present(
            &tenant,
            &thread_id,
            NotificationEvent::ExternalTaskResolved {
                thread_id: thread_id.clone(),
                correlation_id: correlation_id.clone(),
            },
        )
        .await;
        info!(thread = %thread_id, ?outcome, "callback handled");
        Ok(reply(outcome, Some(thread_id)))
    }

    // ── run_scheduled_task_tick ──

    /// Start the task's run unless another instance owns this tick or the
    /// thread already has an active run.
    #[instrument(skip(self, task), fields(task = %task.name, thread = %task.thread_id))]
    pub async fn run_scheduled_task_tick(self: &Arc<Self>, task: ScheduledTask) -> ApiResponse<TickOutcome> {
        guarded("run_scheduled_task_tick", self.handle_tick(task)).await
    }

    async fn handle_tick(self: &Arc<Self>, task: ScheduledTask) -> Result<TickOutcome, ServerError> {
        if task.name.is_empty() || task.thread_id.is_empty() {
            return Err(ServerError::InvalidParams("scheduled task needs a name and a thread".into()));
        }
        let resource = task.lock_resource();
        let run = self
            .lock
            .run_exclusive(&resource, &self.holder, self.workflow.lock_ttl(), || {
                self.start_scheduled(&task)
            })
            .await?;
        match run {
            ExclusiveRun::Completed(result) => result,
            ExclusiveRun::Skipped => {
                debug!("tick owned by another holder");
                Ok(TickOutcome::Skipped)
            }
            ExclusiveRun::Panicked(msg) => Err(ServerError::Internal(format!("scheduled task panicked: {msg}"))),
        }
    }

    async fn start_scheduled(self: &Arc<Self>, task: &ScheduledTask) -> Result<TickOutcome, ServerError> {
        let tenant = task.tenant();
        let thread_id = task.thread_id();
        self.sessions.get_or_create_session(&tenant).await?;

        let on_thread = self.presence.is_user_on_thread(&tenant, &thread_id).await;
        let checklist = task
            .checklist
            .iter()
            .map(|s| ChecklistStep::new(s.id.as_str(), s.title.as_str()))
            .collect();
        let t = match self
            .workflows
            .start(&tenant, &thread_id, &task.name, &task.instructions, checklist, on_thread)
            .await
        {
            Ok(t) => t,
            Err(EngineError::Workflow(WorkflowError::AlreadyActive)) => {
                info!("thread already has an active run");
                return Ok(TickOutcome::AlreadyActive);
            }
            Err(e) => return Err(e.into()),
        };
        self.touch_thread(&tenant, &thread_id).await;

        let run_id = t.run.run_id.clone();
        let input = TurnInput::workflow(preamble::kickoff(&t.run), InputOrigin::ScheduledTask, run_id.clone(), t.mode());
        self.spawn_run(tenant, thread_id, input, None);
        Ok(TickOutcome::Started { run_id })
    }

    // ── reset_thread ──

    /// Drop the thread's brain and everything externalized for it.
    #[instrument(skip(self), fields(tenant = %tenant, thread = %thread_id))]
    pub async fn reset_thread(self: &Arc<Self>, tenant: TenantKey, thread_id: ThreadId) -> ApiResponse<ResetReply> {
        guarded("reset_thread", self.handle_reset(&tenant, &thread_id)).await
    }

    async fn handle_reset(&self, tenant: &TenantKey, thread_id: &ThreadId) -> Result<ResetReply, ServerError> {
        self.streams.stop(tenant, thread_id).await;

        let mut brain_dropped = false;
        if let Some(session) = self.sessions.get(tenant) {
            if let Some(slot) = session.existing_slot(thread_id) {
                // Let an in-flight turn wind down before its history is wiped.
                let _turn = slot.acquire().await;
                brain_dropped = session.drop_brain(thread_id);
            }
        }

        if let Some(run) = self.workflows.get(tenant, thread_id).await {
            for task in &run.pending_tasks {
                self.workflows.clear_route(tenant, &task.correlation_id).await;
            }
        }
        self.history.clear(tenant, thread_id).await?;
        self.workflows.remove(tenant, thread_id).await?;
        if let Err(e) = self.presence.forget_thread(tenant, thread_id).await {
            warn!(error = %e, "thread not removed from presence record");
        }
        info!(brain_dropped, "thread reset");
        Ok(ResetReply {
            thread_id: thread_id.clone(),
            brain_dropped,
        })
    }

    pub fn health(&self) -> ApiResponse<HealthReply> {
        ApiResponse::success(HealthReply {
            status: "ok".into(),
            instance_id: self.holder.clone(),
            sessions: self.sessions.session_count(),
            active_streams: self.streams.active_count(),
            mailboxes: self.mailboxes.active_count(),
        })
    }

    /// Wait for every background run started so far to finish.
    pub async fn wait_idle(&self) {
        self.runs.close();
        self.runs.wait().await;
        self.runs.reopen();
    }

    /// Stop accepting work and let in-flight callbacks and runs finish.
    pub async fn shutdown(&self) {
        self.mailboxes.drain().await;
        self.wait_idle().await;
        info!(holder = %self.holder, "orchestrator drained");
    }

    // ── helpers ──

    /// Run `input` on the thread in the background. A held turn guard is
    /// reused, otherwise the run waits for the thread's turn.
    fn spawn_run(self: &Arc<Self>, tenant: TenantKey, thread_id: ThreadId, input: TurnInput, turn: Option<TurnGuard>) {
        let this = Arc::clone(self);
        let span = tracing::info_span!("background_run", tenant = %tenant, thread = %thread_id);
        self.runs.spawn(
            async move {
                let result = AssertUnwindSafe(async {
                    let turn = match turn {
                        Some(turn) => turn,
                        None => {
                            let session = this.sessions.get_or_create_session(&tenant).await?;
                            session.slot(&thread_id, &this.services).acquire().await
                        }
                    };
                    let run_id = input.run_id.clone();
                    let result = turn.run(input).await;
                    this.after_run(&tenant, &thread_id, run_id.as_ref(), result.as_ref()).await;
                    Ok::<_, ServerError>(result?)
                })
                .catch_unwind()
                .await;
                match result {
                    Ok(Ok(outcome)) => debug!(waiting = outcome.is_waiting(), "background run finished"),
                    Ok(Err(e)) => warn!(code = e.code(), error = %e, "background run failed"),
                    Err(panic) => error!(panic = %panic_message(panic.as_ref()), "background run panicked"),
                }
            }
            .instrument(span),
        );
    }

    /// Settle a workflow run once its turn is over. A parked turn moves the
    /// run to waiting and a stopped one pauses it. Any other ending leaves
    /// nothing to drive a running run, so it fails and frees the thread.
    async fn after_run(
        &self,
        tenant: &TenantKey,
        thread_id: &ThreadId,
        run_id: Option<&RunId>,
        result: Result<&BrainOutcome, &EngineError>,
    ) {
        let Some(run_id) = run_id else {
            return;
        };
        let Some(run) = self.workflows.active(tenant, thread_id).await else {
            return;
        };
        if &run.run_id != run_id || run.state != RunState::Running {
            return;
        }
        let event = match result {
            Ok(BrainOutcome::Waiting { .. }) => WorkflowEvent::RequestWait,
            Ok(BrainOutcome::Stopped { .. }) => WorkflowEvent::Interrupted,
            Ok(BrainOutcome::Completed { turns, .. }) => WorkflowEvent::Abandon {
                reason: format!("turn ended with a text answer after {turns} model calls"),
            },
            Err(e) => WorkflowEvent::Abandon { reason: e.to_string() },
        };
        match self.workflows.apply(tenant, thread_id, event).await {
            Ok(Some(t)) if t.state() == RunState::Failed => {
                warn!(run_id = %run_id, reason = t.run.failure.as_deref().unwrap_or(""), "workflow run failed");
            }
            Ok(_) => {}
            Err(EngineError::Workflow(WorkflowError::NothingPending)) => {
                // A callback already resumed the run while the turn was finishing.
                debug!(run_id = %run_id, "no pending task left to wait on");
            }
            Err(e) => warn!(code = e.code(), error = %e, "workflow run not settled"),
        }
    }

    /// Give up a callback claim so the launcher's retry is delivered.
    async fn release_claim(&self, dedup_key: &str) {
        match self.store.delete_if_owner(dedup_key, self.holder.as_str().as_bytes()).await {
            Ok(_) => debug!("callback claim released"),
            Err(e) => warn!(error = %e, "callback claim not released, retries will read as duplicates"),
        }
    }

    async fn touch_thread(&self, tenant: &TenantKey, thread_id: &ThreadId) {
        if let Err(e) = self.presence.touch_thread(tenant, thread_id).await {
            warn!(error = %e, "thread registration not externalized");
        }
    }

    async fn record(&self, tenant: &TenantKey, thread_id: &ThreadId, message: Message) {
        if let Err(e) = self.history.append(tenant, thread_id, vec![message], None).await {
            warn!(error = %e, "history append not externalized");
        }
    }

    async fn publish_if_present(&self, tenant: &TenantKey, thread_id: &ThreadId, event: NotificationEvent) {
        if self.presence.is_user_on_thread(tenant, thread_id).await {
            self.notifier.publish(&tenant.user_id, event);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}
