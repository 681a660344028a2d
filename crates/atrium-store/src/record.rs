//! Cache-then-source records.
//!
//! Reads prefer the local copy and fall back to the shared store, then to
//! `T::default()`. Writes land locally first, then remotely; a failed remote
//! write is logged and returned but the local copy is kept.

use std::sync::Arc;
use std::time::Duration;

use atrium_core::{TenantKey, ThreadId};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::StateStore;

const RETRY_DELAY: Duration = Duration::from_millis(25);

pub struct CachedRecord<T> {
    store: Arc<dyn StateStore>,
    namespace: String,
    ttl: Duration,
    local: DashMap<String, T>,
}

impl<T> CachedRecord<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn StateStore>, namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            ttl,
            local: DashMap::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `{namespace}:{user}:{tenant}`
    pub fn tenant_key(&self, tenant: &TenantKey) -> String {
        tenant.record_key(&self.namespace)
    }

    /// `{namespace}:{user}:{tenant}:{thread}`
    pub fn thread_key(&self, tenant: &TenantKey, thread_id: &ThreadId) -> String {
        tenant.thread_key(&self.namespace, thread_id)
    }

    /// Local copy only.
    pub fn cached(&self, key: &str) -> Option<T> {
        self.local.get(key).map(|v| v.value().clone())
    }

    /// Local copy, else the shared store, else a fresh default.
    pub async fn load(&self, key: &str) -> T {
        if let Some(hit) = self.cached(key) {
            return hit;
        }
        match self.fetch_remote(key).await {
            Ok(Some(remote)) => {
                let _ = self.local.insert(key.to_string(), remote.clone());
                remote
            }
            Ok(None) => T::default(),
            Err(e) => {
                warn!(key, error = %e, "record read failed, using default");
                T::default()
            }
        }
    }

    /// Shared store first. Falls back to the local copy only when the store fails;
    /// a record missing from the store also drops the local copy.
    pub async fn load_fresh(&self, key: &str) -> T {
        match self.fetch_remote(key).await {
            Ok(Some(remote)) => {
                let _ = self.local.insert(key.to_string(), remote.clone());
                remote
            }
            Ok(None) => {
                let _ = self.local.remove(key);
                T::default()
            }
            Err(e) => {
                warn!(key, error = %e, "record read failed, using local copy");
                self.cached(key).unwrap_or_default()
            }
        }
    }

    /// Read and decode from the shared store, retrying one transient failure.
    pub async fn fetch_remote(&self, key: &str) -> Result<Option<T>, StoreError> {
        let bytes = match self.store.get(key).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_transient() => {
                debug!(key, error = %e, "transient read failure, retrying once");
                tokio::time::sleep(RETRY_DELAY).await;
                self.store.get(key).await?
            }
            Err(e) => return Err(e),
        };
        match bytes {
            None => Ok(None),
            Some(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!(key, error = %e, "undecodable record ignored");
                    Ok(None)
                }
            },
        }
    }

    /// Write to both copies. The local copy stays even if the store write fails.
    pub async fn save(&self, key: &str, value: T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&value)?;
        let _ = self.local.insert(key.to_string(), value);
        if let Err(e) = self.store.set(key, bytes, self.ttl).await {
            warn!(key, error = %e, "record write failed, local copy kept");
            return Err(e);
        }
        Ok(())
    }

    /// Read (store first), mutate, write back. Last writer wins for the whole record.
    pub async fn update(&self, key: &str, f: impl FnOnce(&mut T)) -> Result<T, StoreError> {
        let mut value = self.load_fresh(key).await;
        f(&mut value);
        self.save(key, value.clone()).await?;
        Ok(value)
    }

    /// Delete both copies.
    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _ = self.local.remove(key);
        self.store.delete(key).await
    }

    /// Drop the local copy only; the shared copy expires on its own TTL.
    pub fn evict(&self, key: &str) {
        let _ = self.local.remove(key);
    }

    /// Drop the local copy of `scope` and of every key nested below it (`{scope}:...`).
    pub fn evict_scope(&self, scope: &str) -> usize {
        let nested = format!("{scope}:");
        let before = self.local.len();
        self.local.retain(|k, _| k != scope && !k.starts_with(&nested));
        before.saturating_sub(self.local.len())
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }
}
