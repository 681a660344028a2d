use std::sync::Arc;
use std::time::Duration;

use atrium_core::events::{NotificationChannel, NotificationEvent};
use atrium_core::launcher::PendingExternalTask;
use atrium_core::{CorrelationId, RunId, TenantKey, ThreadId};
use atrium_store::{namespace, CachedRecord, StateStore};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::machine::{self, Effect, Transition, WorkflowEvent};
use super::model::{ChecklistStep, StepStatus, WorkflowRun};
use super::WorkflowError;
use crate::error::EngineError;

/// Correlation index entry: where a callback for a launched task should go.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingRoute {
    pub thread_id: ThreadId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub task: PendingExternalTask,
}

/// Persists workflow runs, the correlation index and the per-tenant run index.
pub struct WorkflowManager {
    runs: CachedRecord<Option<WorkflowRun>>,
    routes: CachedRecord<Option<PendingRoute>>,
    index: CachedRecord<Vec<ThreadId>>,
    notifier: Arc<dyn NotificationChannel>,
}

impl WorkflowManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        prefix: &str,
        ttl: Duration,
        notifier: Arc<dyn NotificationChannel>,
    ) -> Self {
        Self {
            runs: CachedRecord::new(store.clone(), namespace(prefix, "workflow"), ttl),
            routes: CachedRecord::new(store.clone(), namespace(prefix, "pending"), ttl),
            index: CachedRecord::new(store, namespace(prefix, "workflows"), ttl),
            notifier,
        }
    }

    /// Latest run on the thread, terminal or not. Read from the store first.
    pub async fn get(&self, tenant: &TenantKey, thread_id: &ThreadId) -> Option<WorkflowRun> {
        self.runs.load_fresh(&self.runs.thread_key(tenant, thread_id)).await
    }

    /// The non-terminal run on the thread, if any.
    pub async fn active(&self, tenant: &TenantKey, thread_id: &ThreadId) -> Option<WorkflowRun> {
        self.get(tenant, thread_id).await.filter(|r| !r.state.is_terminal())
    }

    #[instrument(skip(self, instructions, checklist), fields(tenant = %tenant, thread = %thread_id))]
    pub async fn start(
        &self,
        tenant: &TenantKey,
        thread_id: &ThreadId,
        task_name: &str,
        instructions: &str,
        checklist: Vec<ChecklistStep>,
        user_on_thread: bool,
    ) -> Result<Transition, EngineError> {
        if self.active(tenant, thread_id).await.is_some() {
            return Err(WorkflowError::AlreadyActive.into());
        }
        let run = WorkflowRun::new(tenant.clone(), thread_id.clone(), task_name, instructions, checklist);
        let t = machine::start(run, user_on_thread);
        self.persist(tenant, &t.run).await;
        self.index_add(tenant, thread_id).await;
        info!(run_id = %t.run.run_id, mode = %t.run.mode, "workflow started");
        self.publish(&t);
        Ok(t)
    }

    /// Apply `event` to the active run. `Ok(None)` when the thread has no active run.
    #[instrument(skip(self), fields(tenant = %tenant, thread = %thread_id, event = event.name()))]
    pub async fn apply(
        &self,
        tenant: &TenantKey,
        thread_id: &ThreadId,
        event: WorkflowEvent,
    ) -> Result<Option<Transition>, EngineError> {
        let Some(run) = self.active(tenant, thread_id).await else {
            return Ok(None);
        };
        let t = machine::transition(&run, &event)?;
        if t.changed {
            self.persist(tenant, &t.run).await;
        }
        if t.state().is_terminal() {
            self.index_remove(tenant, thread_id).await;
            info!(run_id = %t.run.run_id, state = %t.state(), "workflow finished");
        }
        self.publish(&t);
        Ok(Some(t))
    }

    pub async fn update_step(
        &self,
        tenant: &TenantKey,
        thread_id: &ThreadId,
        step_id: &str,
        status: StepStatus,
        note: Option<String>,
    ) -> Result<WorkflowRun, EngineError> {
        let run = self.active(tenant, thread_id).await.ok_or(WorkflowError::NotFound)?;
        let next = machine::update_step(&run, step_id, status, note)?;
        self.persist(tenant, &next).await;
        Ok(next)
    }

    /// Record where the callback for `task` should be routed.
    pub async fn register_pending(
        &self,
        tenant: &TenantKey,
        thread_id: &ThreadId,
        run_id: Option<RunId>,
        task: PendingExternalTask,
    ) -> Result<(), EngineError> {
        let key = self.route_key(tenant, &task.correlation_id);
        let route = PendingRoute {
            thread_id: thread_id.clone(),
            run_id,
            task,
        };
        self.routes.save(&key, Some(route)).await?;
        Ok(())
    }

    /// Make a task resolvable before it is handed to the launcher: the
    /// correlation route is written and, for a workflow launch, the task joins
    /// the run's pending list.
    #[instrument(skip(self, task), fields(tenant = %tenant, thread = %thread_id, correlation_id = %task.correlation_id))]
    pub async fn track_launch(
        &self,
        tenant: &TenantKey,
        thread_id: &ThreadId,
        run_id: Option<&RunId>,
        task: &PendingExternalTask,
    ) -> Result<(), EngineError> {
        self.register_pending(tenant, thread_id, run_id.cloned(), task.clone()).await?;
        if self.owned_by(tenant, thread_id, run_id).await {
            self.apply(tenant, thread_id, WorkflowEvent::TaskLaunched { task: task.clone() })
                .await?;
        }
        Ok(())
    }

    /// Undo [`Self::track_launch`] for a task the launcher never accepted.
    pub async fn untrack_launch(
        &self,
        tenant: &TenantKey,
        thread_id: &ThreadId,
        run_id: Option<&RunId>,
        correlation_id: &CorrelationId,
    ) {
        self.clear_route(tenant, correlation_id).await;
        if self.owned_by(tenant, thread_id, run_id).await {
            let event = WorkflowEvent::LaunchAbandoned {
                correlation_id: correlation_id.clone(),
            };
            if let Err(e) = self.apply(tenant, thread_id, event).await {
                warn!(correlation_id = %correlation_id, error = %e, "abandoned launch still listed on run");
            }
        }
    }

    async fn owned_by(&self, tenant: &TenantKey, thread_id: &ThreadId, run_id: Option<&RunId>) -> bool {
        match run_id {
            Some(id) => self.active(tenant, thread_id).await.is_some_and(|run| &run.run_id == id),
            None => false,
        }
    }

    pub async fn route(&self, tenant: &TenantKey, correlation_id: &CorrelationId) -> Option<PendingRoute> {
        self.routes.load_fresh(&self.route_key(tenant, correlation_id)).await
    }

    pub async fn clear_route(&self, tenant: &TenantKey, correlation_id: &CorrelationId) {
        if let Err(e) = self.routes.remove(&self.route_key(tenant, correlation_id)).await {
            warn!(correlation_id = %correlation_id, error = %e, "failed to clear pending route");
        }
    }

    /// Threads with a non-terminal run for this tenant.
    pub async fn active_threads(&self, tenant: &TenantKey) -> Vec<ThreadId> {
        self.index.load_fresh(&self.index.tenant_key(tenant)).await
    }

    /// Forget the thread's run entirely.
    pub async fn remove(&self, tenant: &TenantKey, thread_id: &ThreadId) -> Result<(), EngineError> {
        self.runs.remove(&self.runs.thread_key(tenant, thread_id)).await?;
        self.index_remove(tenant, thread_id).await;
        Ok(())
    }

    pub fn evict_tenant(&self, tenant: &TenantKey) {
        let _ = self.runs.evict_scope(&self.runs.tenant_key(tenant));
        let _ = self.routes.evict_scope(&self.routes.tenant_key(tenant));
        self.index.evict(&self.index.tenant_key(tenant));
    }

    fn route_key(&self, tenant: &TenantKey, correlation_id: &CorrelationId) -> String {
        tenant.scoped_key(self.routes.namespace(), correlation_id.as_str())
    }

    /// Write failures keep the local copy and are logged; the run continues from it.
    async fn persist(&self, tenant: &TenantKey, run: &WorkflowRun) {
        let key = self.runs.thread_key(tenant, &run.thread_id);
        if let Err(e) = self.runs.save(&key, Some(run.clone())).await {
            warn!(run_id = %run.run_id, error = %e, "workflow run not externalized");
        }
    }

    async fn index_add(&self, tenant: &TenantKey, thread_id: &ThreadId) {
        let key = self.index.tenant_key(tenant);
        let result = self
            .index
            .update(&key, |threads| {
                if !threads.contains(thread_id) {
                    threads.push(thread_id.clone());
                }
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "workflow index not updated");
        }
    }

    async fn index_remove(&self, tenant: &TenantKey, thread_id: &ThreadId) {
        let key = self.index.tenant_key(tenant);
        if let Err(e) = self.index.update(&key, |threads| threads.retain(|t| t != thread_id)).await {
            warn!(error = %e, "workflow index not updated");
        }
    }

    fn publish(&self, t: &Transition) {
        let run = &t.run;
        for effect in &t.effects {
            let event = match effect {
                Effect::Started => NotificationEvent::WorkflowStarted {
                    thread_id: run.thread_id.clone(),
                    run_id: run.run_id.clone(),
                    task_name: run.task_name.clone(),
                    mode: run.mode,
                },
                Effect::UserJoined => NotificationEvent::UserJoined {
                    thread_id: run.thread_id.clone(),
                    run_id: run.run_id.clone(),
                },
                Effect::StateChanged { from, to } => NotificationEvent::WorkflowStateChanged {
                    thread_id: run.thread_id.clone(),
                    run_id: run.run_id.clone(),
                    from: *from,
                    to: *to,
                },
                Effect::ModeChanged(mode) => NotificationEvent::WorkflowModeChanged {
                    thread_id: run.thread_id.clone(),
                    run_id: run.run_id.clone(),
                    mode: *mode,
                },
                Effect::InjectResumePreamble | Effect::ResumeWithCallback(_) | Effect::RecordCallback(_) => continue,
            };
            self.notifier.publish(&run.tenant.user_id, event);
        }
    }
}
