//! Externalized per-thread conversation history.

use std::sync::Arc;
use std::time::Duration;

use atrium_core::messages::Message;
use atrium_core::tokens::{TokenCounters, TokenUsage};
use atrium_core::{TenantKey, ThreadId};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::record::CachedRecord;
use crate::store::{namespace, StateStore};

/// Ordered messages plus the token counters that drive compaction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadHistory {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub counters: TokenCounters,
}

impl ThreadHistory {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

pub struct ChatHistoryManager {
    records: CachedRecord<ThreadHistory>,
}

impl ChatHistoryManager {
    pub fn new(store: Arc<dyn StateStore>, prefix: &str, ttl: Duration) -> Self {
        Self {
            records: CachedRecord::new(store, namespace(prefix, "history"), ttl),
        }
    }

    pub fn key(&self, tenant: &TenantKey, thread_id: &ThreadId) -> String {
        self.records.thread_key(tenant, thread_id)
    }

    /// Read from the store so turns served elsewhere are seen. The local copy
    /// only answers while the store is failing.
    pub async fn load(&self, tenant: &TenantKey, thread_id: &ThreadId) -> ThreadHistory {
        self.records.load_fresh(&self.key(tenant, thread_id)).await
    }

    /// Append messages and fold in usage on top of the stored history. History only grows here.
    #[instrument(skip(self, messages), fields(tenant = %tenant, thread = %thread_id, count = messages.len()))]
    pub async fn append(
        &self,
        tenant: &TenantKey,
        thread_id: &ThreadId,
        messages: Vec<Message>,
        usage: Option<TokenUsage>,
    ) -> Result<ThreadHistory, StoreError> {
        self.records
            .update(&self.key(tenant, thread_id), |history| {
                history.messages.extend(messages);
                if let Some(usage) = usage {
                    history.counters.accumulate(&usage);
                }
            })
            .await
    }

    /// Compaction rewrite. Written through to the store immediately.
    #[instrument(skip(self, history), fields(tenant = %tenant, thread = %thread_id, count = history.len()))]
    pub async fn replace(
        &self,
        tenant: &TenantKey,
        thread_id: &ThreadId,
        history: ThreadHistory,
    ) -> Result<(), StoreError> {
        debug!("history replaced");
        self.records.save(&self.key(tenant, thread_id), history).await
    }

    pub async fn clear(&self, tenant: &TenantKey, thread_id: &ThreadId) -> Result<(), StoreError> {
        self.records.remove(&self.key(tenant, thread_id)).await
    }

    /// Drop every local copy for the tenant.
    pub fn evict_tenant(&self, tenant: &TenantKey) -> usize {
        self.records.evict_scope(&self.records.tenant_key(tenant))
    }

    pub fn cached(&self, tenant: &TenantKey, thread_id: &ThreadId) -> Option<ThreadHistory> {
        self.records.cached(&self.key(tenant, thread_id))
    }
}
