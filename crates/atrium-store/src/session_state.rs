//! Externalized per-tenant session state: presence and known threads.

use std::sync::Arc;
use std::time::Duration;

use atrium_core::{TenantKey, ThreadId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::StoreError;
use crate::record::CachedRecord;
use crate::store::{namespace, StateStore};

/// Shared copy of a tenant session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Whether the user currently has the page open.
    pub on_page: bool,
    /// Thread the user is looking at, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_thread: Option<ThreadId>,
    /// Threads that have a conversation in this session.
    #[serde(default)]
    pub threads: Vec<ThreadId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn is_on_thread(&self, thread_id: &ThreadId) -> bool {
        self.on_page && self.active_thread.as_ref() == Some(thread_id)
    }

    fn register_thread(&mut self, thread_id: &ThreadId) {
        if !self.threads.contains(thread_id) {
            self.threads.push(thread_id.clone());
        }
    }
}

pub struct SessionStateManager {
    records: CachedRecord<SessionRecord>,
}

impl SessionStateManager {
    pub fn new(store: Arc<dyn StateStore>, prefix: &str, ttl: Duration) -> Self {
        Self {
            records: CachedRecord::new(store, namespace(prefix, "session"), ttl),
        }
    }

    pub fn key(&self, tenant: &TenantKey) -> String {
        self.records.tenant_key(tenant)
    }

    /// Local copy first; reconstructed from the store on a cold instance.
    pub async fn load(&self, tenant: &TenantKey) -> SessionRecord {
        self.records.load(&self.key(tenant)).await
    }

    /// Always read from the store, refreshing the local copy.
    pub async fn refresh(&self, tenant: &TenantKey) -> SessionRecord {
        self.records.load_fresh(&self.key(tenant)).await
    }

    /// Cluster-wide presence check. Served from the store, never local memory alone.
    #[instrument(skip(self), fields(tenant = %tenant, thread = %thread_id))]
    pub async fn is_user_on_thread(&self, tenant: &TenantKey, thread_id: &ThreadId) -> bool {
        self.refresh(tenant).await.is_on_thread(thread_id)
    }

    #[instrument(skip(self), fields(tenant = %tenant, thread = %thread_id))]
    pub async fn enter_thread(&self, tenant: &TenantKey, thread_id: &ThreadId) -> Result<SessionRecord, StoreError> {
        self.records
            .update(&self.key(tenant), |r| {
                r.on_page = true;
                r.active_thread = Some(thread_id.clone());
                r.register_thread(thread_id);
                r.updated_at = Some(Utc::now());
            })
            .await
    }

    /// Leaving a thread the user is not on only clears the page flag when nothing is active.
    #[instrument(skip(self), fields(tenant = %tenant, thread = %thread_id))]
    pub async fn leave_thread(&self, tenant: &TenantKey, thread_id: &ThreadId) -> Result<SessionRecord, StoreError> {
        self.records
            .update(&self.key(tenant), |r| {
                if r.active_thread.as_ref() == Some(thread_id) {
                    r.active_thread = None;
                    r.on_page = false;
                } else if r.active_thread.is_none() {
                    r.on_page = false;
                }
                r.updated_at = Some(Utc::now());
            })
            .await
    }

    /// Record that a conversation exists on `thread_id`. Refreshes the TTL.
    pub async fn touch_thread(&self, tenant: &TenantKey, thread_id: &ThreadId) -> Result<SessionRecord, StoreError> {
        self.records
            .update(&self.key(tenant), |r| {
                r.register_thread(thread_id);
                r.updated_at = Some(Utc::now());
            })
            .await
    }

    pub async fn forget_thread(&self, tenant: &TenantKey, thread_id: &ThreadId) -> Result<SessionRecord, StoreError> {
        self.records
            .update(&self.key(tenant), |r| {
                r.threads.retain(|t| t != thread_id);
                if r.active_thread.as_ref() == Some(thread_id) {
                    r.active_thread = None;
                }
                r.updated_at = Some(Utc::now());
            })
            .await
    }

    /// Drop the in-process copy. The shared copy expires on its own TTL.
    pub fn evict_local(&self, tenant: &TenantKey) {
        self.records.evict(&self.key(tenant));
    }

    pub fn cached(&self, tenant: &TenantKey) -> Option<SessionRecord> {
        self.records.cached(&self.key(tenant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faulty::FaultyStore;
    use crate::memory::MemoryStore;

    const TTL: Duration = Duration::from_secs(7200);

    fn tenant() -> TenantKey {
        TenantKey::new("alice", "acme")
    }

    #[tokio::test]
    async fn enter_sets_presence() {
        let mgr = SessionStateManager::new(Arc::new(MemoryStore::new()), "atrium", TTL);
        let thread = ThreadId::from_raw("ops");
        let record = mgr.enter_thread(&tenant(), &thread).await.unwrap();
        assert!(record.is_on_thread(&thread));
        assert_eq!(record.threads, vec![thread.clone()]);
        assert!(mgr.is_user_on_thread(&tenant(), &thread).await);
        assert!(!mgr.is_user_on_thread(&tenant(), &ThreadId::from_raw("other")).await);
    }

    #[tokio::test]
    async fn cold_instance_reads_identical_state() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let warm = SessionStateManager::new(store.clone(), "atrium", TTL);
        let thread = ThreadId::from_raw("ops");
        let written = warm.enter_thread(&tenant(), &thread).await.unwrap();

        let cold = SessionStateManager::new(store, "atrium", TTL);
        assert!(cold.cached(&tenant()).is_none());
        assert_eq!(cold.load(&tenant()).await, written);
    }

    #[tokio::test]
    async fn presence_check_sees_other_instance() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let a = SessionStateManager::new(store.clone(), "atrium", TTL);
        let b = SessionStateManager::new(store, "atrium", TTL);
        let thread = ThreadId::from_raw("ops");

        a.enter_thread(&tenant(), &thread).await.unwrap();
        assert!(b.is_user_on_thread(&tenant(), &thread).await);

        a.leave_thread(&tenant(), &thread).await.unwrap();
        assert!(!b.is_user_on_thread(&tenant(), &thread).await);
    }

    #[tokio::test]
    async fn leaving_other_thread_keeps_presence() {
        let mgr = SessionStateManager::new(Arc::new(MemoryStore::new()), "atrium", TTL);
        let ops = ThreadId::from_raw("ops");
        mgr.enter_thread(&tenant(), &ops).await.unwrap();
        let record = mgr.leave_thread(&tenant(), &ThreadId::from_raw("stale")).await.unwrap();
        assert!(record.is_on_thread(&ops));
    }

    #[tokio::test]
    async fn presence_check_falls_back_when_store_down() {
        let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
        let mgr = SessionStateManager::new(faulty.clone(), "atrium", TTL);
        let thread = ThreadId::from_raw("ops");
        mgr.enter_thread(&tenant(), &thread).await.unwrap();

        faulty.set_fail_reads(true);
        assert!(mgr.is_user_on_thread(&tenant(), &thread).await);
    }

    #[tokio::test]
    async fn evicted_state_rehydrates() {
        let mgr = SessionStateManager::new(Arc::new(MemoryStore::new()), "atrium", TTL);
        let thread = ThreadId::from_raw("ops");
        let written = mgr.enter_thread(&tenant(), &thread).await.unwrap();
        mgr.evict_local(&tenant());
        assert!(mgr.cached(&tenant()).is_none());
        assert_eq!(mgr.load(&tenant()).await, written);
    }

    #[tokio::test]
    async fn key_layout() {
        let mgr = SessionStateManager::new(Arc::new(MemoryStore::new()), "atrium", TTL);
        assert_eq!(mgr.key(&tenant()), "atrium:session:alice:acme");
    }
}
