//! Tenant session registry.
//!
//! The map lock is held only to find or insert a per-tenant cell. The slow
//! part of creating a session (fetching business context, rehydrating
//! presence) happens inside that cell after the map lock is gone, so other
//! tenants never wait on it and concurrent callers for the same tenant share
//! one initialization.

use std::sync::Arc;
use std::time::Duration;

use atrium_core::TenantKey;
use atrium_engine::WorkflowManager;
use atrium_store::{ChatHistoryManager, SessionStateManager};
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::context::{BusinessContextProvider, ContextError};
use crate::error::ServerError;
use crate::session::Session;

type SessionCell = Arc<OnceCell<Arc<Session>>>;

pub struct SessionManager {
    sessions: DashMap<TenantKey, SessionCell>,
    context: Arc<dyn BusinessContextProvider>,
    context_ttl: Duration,
    idle_ttl: Duration,
    presence: Arc<SessionStateManager>,
    history: Arc<ChatHistoryManager>,
    workflows: Arc<WorkflowManager>,
}

impl SessionManager {
    pub fn new(
        context: Arc<dyn BusinessContextProvider>,
        presence: Arc<SessionStateManager>,
        history: Arc<ChatHistoryManager>,
        workflows: Arc<WorkflowManager>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            context,
            context_ttl: Duration::from_secs(600),
            idle_ttl: Duration::from_secs(2 * 60 * 60),
            presence,
            history,
            workflows,
        }
    }

    pub fn with_context_ttl(mut self, ttl: Duration) -> Self {
        self.context_ttl = ttl;
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Existing sessions return at once; a stale context refreshes in the background.
    #[instrument(skip(self), fields(tenant = %tenant))]
    pub async fn get_or_create_session(&self, tenant: &TenantKey) -> Result<Arc<Session>, ServerError> {
        let cell = self.sessions.entry(tenant.clone()).or_default().clone();

        if let Some(session) = cell.get() {
            session.touch();
            self.refresh_in_background(session);
            return Ok(session.clone());
        }

        match cell.get_or_try_init(|| self.initialize(tenant)).await {
            Ok(session) => {
                session.touch();
                Ok(session.clone())
            }
            Err(e) => {
                // Only drop the cell this call saw, and only while it is still empty.
                self.sessions
                    .remove_if(tenant, |_, c| Arc::ptr_eq(c, &cell) && c.get().is_none());
                warn!(error = %e, "session initialization failed");
                Err(ServerError::Unavailable(e.to_string()))
            }
        }
    }

    async fn initialize(&self, tenant: &TenantKey) -> Result<Arc<Session>, ContextError> {
        let context = match self.context.fetch(tenant).await {
            Ok(ctx) => ctx,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "business context fetch failed, retrying once");
                self.context.fetch(tenant).await?
            }
            Err(e) => return Err(e),
        };
        let record = self.presence.refresh(tenant).await;
        info!(threads = record.threads.len(), on_page = record.on_page, "session created");
        Ok(Arc::new(Session::new(tenant.clone(), context.render())))
    }

    fn refresh_in_background(&self, session: &Arc<Session>) {
        if !session.context_is_stale(self.context_ttl) || !session.begin_refresh() {
            return;
        }
        let provider = self.context.clone();
        let session = session.clone();
        tokio::spawn(async move {
            match provider.fetch(session.tenant()).await {
                Ok(ctx) => {
                    session.set_context(ctx.render());
                    debug!(tenant = %session.tenant(), "business context refreshed");
                }
                Err(e) => warn!(tenant = %session.tenant(), error = %e, "context refresh failed, keeping cached copy"),
            }
            session.end_refresh();
        });
    }

    pub fn get(&self, tenant: &TenantKey) -> Option<Arc<Session>> {
        self.sessions.get(tenant).and_then(|c| c.get().cloned())
    }

    /// Initialized sessions only.
    pub fn session_count(&self) -> usize {
        self.sessions.iter().filter(|c| c.get().is_some()).count()
    }

    /// Evict sessions idle longer than the idle TTL. Memory only: the shared
    /// copies stay in the store and rehydrate the session on its next use.
    pub fn sweep_idle(&self) -> usize {
        let idle: Vec<TenantKey> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .get()
                    .is_some_and(|s| s.idle_for() >= self.idle_ttl && !s.is_busy())
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for tenant in idle {
            let removed = self.sessions.remove_if(&tenant, |_, c| {
                c.get()
                    .is_some_and(|s| s.idle_for() >= self.idle_ttl && !s.is_busy())
            });
            if removed.is_some() {
                self.presence.evict_local(&tenant);
                self.history.evict_tenant(&tenant);
                self.workflows.evict_tenant(&tenant);
                evicted += 1;
                info!(tenant = %tenant, "idle session evicted");
            }
        }
        evicted
    }

    /// Periodic [`Self::sweep_idle`].
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = manager.sweep_idle();
                if evicted > 0 {
                    info!(evicted, remaining = manager.session_count(), "idle session sweep");
                }
            }
        })
    }
}
