//! One tenant's in-memory session: cached business context and the brains
//! of the threads it has touched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atrium_core::{TenantKey, ThreadId};
use atrium_engine::{Brain, BrainOutcome, BrainServices, EngineError, TurnInput};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

/// A thread's brain plus the lock that keeps its turns single-flight.
pub struct BrainSlot {
    brain: Brain,
    turn: Arc<tokio::sync::Mutex<()>>,
}

impl BrainSlot {
    fn new(brain: Brain) -> Self {
        Self {
            brain,
            turn: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn brain(&self) -> &Brain {
        &self.brain
    }

    /// Wait for the thread's turn. The guard is owned so it can move into a spawned task.
    pub async fn acquire(self: Arc<Self>) -> TurnGuard {
        let turn = self.turn.clone().lock_owned().await;
        TurnGuard { slot: self, _turn: turn }
    }

    pub fn is_busy(&self) -> bool {
        self.turn.try_lock().is_err()
    }
}

/// Exclusive right to run the next invocation on a thread.
pub struct TurnGuard {
    slot: Arc<BrainSlot>,
    _turn: OwnedMutexGuard<()>,
}

impl TurnGuard {
    pub async fn run(&self, input: TurnInput) -> Result<BrainOutcome, EngineError> {
        self.slot.brain.run(input).await
    }

    pub fn brain(&self) -> &Brain {
        &self.slot.brain
    }
}

#[derive(Default)]
struct CachedContext {
    rendered: Option<String>,
    fetched_at: Option<Instant>,
}

pub struct Session {
    tenant: TenantKey,
    context: RwLock<CachedContext>,
    brains: DashMap<ThreadId, Arc<BrainSlot>>,
    last_active: Mutex<Instant>,
    refreshing: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(tenant: TenantKey, context: Option<String>) -> Self {
        let now = Instant::now();
        Self {
            tenant,
            context: RwLock::new(CachedContext {
                rendered: context,
                fetched_at: Some(now),
            }),
            brains: DashMap::new(),
            last_active: Mutex::new(now),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn tenant(&self) -> &TenantKey {
        &self.tenant
    }

    pub fn context(&self) -> Option<String> {
        self.context.read().rendered.clone()
    }

    pub fn context_is_stale(&self, ttl: Duration) -> bool {
        self.context.read().fetched_at.map_or(true, |at| at.elapsed() >= ttl)
    }

    /// Store a fresh context and hand it to every brain.
    pub fn set_context(&self, context: Option<String>) {
        {
            let mut cached = self.context.write();
            cached.rendered = context.clone();
            cached.fetched_at = Some(Instant::now());
        }
        for slot in self.brains.iter() {
            slot.brain().set_context(context.clone());
        }
    }

    /// Claim the background refresh. Only one caller wins until [`Self::end_refresh`].
    pub fn begin_refresh(&self) -> bool {
        self.refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_refresh(&self) {
        self.refreshing.store(false, Ordering::Release);
    }

    /// The thread's slot, created on first use. At most one per thread.
    pub fn slot(&self, thread_id: &ThreadId, services: &BrainServices) -> Arc<BrainSlot> {
        self.brains
            .entry(thread_id.clone())
            .or_insert_with(|| {
                let brain = Brain::new(self.tenant.clone(), thread_id.clone(), services.clone());
                brain.set_context(self.context());
                Arc::new(BrainSlot::new(brain))
            })
            .clone()
    }

    pub fn existing_slot(&self, thread_id: &ThreadId) -> Option<Arc<BrainSlot>> {
        self.brains.get(thread_id).map(|s| s.clone())
    }

    pub fn drop_brain(&self, thread_id: &ThreadId) -> bool {
        self.brains.remove(thread_id).is_some()
    }

    pub fn thread_count(&self) -> usize {
        self.brains.len()
    }

    /// Whether any thread is mid-invocation.
    pub fn is_busy(&self) -> bool {
        self.brains.iter().any(|s| s.is_busy())
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_core::events::NullChannel;
    use atrium_engine::mock::{MockProvider, MockResponse};
    use atrium_engine::{BrainConfig, StreamingController, ToolRegistry};
    use atrium_store::{ChatHistoryManager, MemoryStore, SessionStateManager, StateStore};

    fn services(responses: Vec<MockResponse>) -> (BrainServices, Arc<MockProvider>) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new(responses));
        let services = BrainServices {
            provider: provider.clone(),
            registry: Arc::new(ToolRegistry::new()),
            history: Arc::new(ChatHistoryManager::new(store.clone(), "atrium", Duration::from_secs(3600))),
            sessions: Arc::new(SessionStateManager::new(store.clone(), "atrium", Duration::from_secs(3600))),
            streams: Arc::new(StreamingController::new(store, "atrium")),
            notifier: Arc::new(NullChannel),
            config: Arc::new(BrainConfig {
                system_prompt: "base".into(),
                ..BrainConfig::default()
            }),
        };
        (services, provider)
    }

    #[test]
    fn one_slot_per_thread() {
        let (services, _) = services(vec![]);
        let session = Session::new(TenantKey::new("alice", "acme"), None);
        let thread = ThreadId::from_raw("ops");
        let a = session.slot(&thread, &services);
        let b = session.slot(&thread, &services);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(session.thread_count(), 1);
        assert!(session.drop_brain(&thread));
        assert!(session.existing_slot(&thread).is_none());
    }

    #[tokio::test]
    async fn context_reaches_existing_brains() {
        let (services, provider) = services(vec![MockResponse::text("ok")]);
        let session = Session::new(TenantKey::new("alice", "acme"), Some("old".into()));
        let slot = session.slot(&ThreadId::from_raw("ops"), &services);
        session.set_context(Some("new facts".into()));

        let turn = slot.acquire().await;
        turn.run(TurnInput::conversation("hi")).await.unwrap();
        let prompt = provider.last_request().unwrap().system_prompt;
        assert!(prompt.contains("new facts"));
        assert!(!prompt.contains("old"));
    }

    #[tokio::test]
    async fn turn_guard_marks_slot_busy() {
        let (services, _) = services(vec![]);
        let session = Session::new(TenantKey::new("alice", "acme"), None);
        let slot = session.slot(&ThreadId::from_raw("ops"), &services);
        assert!(!session.is_busy());
        let guard = slot.clone().acquire().await;
        assert!(slot.is_busy());
        assert!(session.is_busy());
        drop(guard);
        assert!(!session.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_and_idle_follow_the_clock() {
        let session = Session::new(TenantKey::new("alice", "acme"), None);
        assert!(!session.context_is_stale(Duration::from_secs(600)));
        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(session.context_is_stale(Duration::from_secs(600)));
        assert!(session.idle_for() >= Duration::from_secs(601));
        session.touch();
        assert!(session.idle_for() < Duration::from_secs(1));

        assert!(session.begin_refresh());
        assert!(!session.begin_refresh());
        session.end_refresh();
        assert!(session.begin_refresh());
    }
}
