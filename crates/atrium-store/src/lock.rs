//! Distributed lock built on the store's atomic primitives.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use atrium_core::HolderId;
use futures::FutureExt;
use tracing::{debug, error, instrument, warn};

use crate::error::StoreError;
use crate::store::{namespace, StateStore};

/// Result of [`DistributedLock::run_exclusive`].
#[derive(Debug, PartialEq, Eq)]
pub enum ExclusiveRun<T> {
    Completed(T),
    /// Another holder owns the resource. Not an error.
    Skipped,
    /// The body panicked. The lock was still released.
    Panicked(String),
}

impl<T> ExclusiveRun<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

pub struct DistributedLock {
    store: Arc<dyn StateStore>,
    namespace: String,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn StateStore>, prefix: &str) -> Self {
        Self {
            store,
            namespace: namespace(prefix, "lock"),
        }
    }

    fn key(&self, resource_id: &str) -> String {
        format!("{}:{resource_id}", self.namespace)
    }

    /// Non-blocking. Returns whether `holder` now owns `resource_id`.
    #[instrument(skip(self), fields(holder = %holder))]
    pub async fn acquire(&self, resource_id: &str, holder: &HolderId, ttl: Duration) -> Result<bool, StoreError> {
        let acquired = self
            .store
            .set_if_absent(&self.key(resource_id), holder.as_str().as_bytes().to_vec(), ttl)
            .await?;
        debug!(acquired, "lock acquire");
        Ok(acquired)
    }

    /// Compare-and-delete. Only the current holder can release.
    #[instrument(skip(self), fields(holder = %holder))]
    pub async fn release(&self, resource_id: &str, holder: &HolderId) -> Result<bool, StoreError> {
        let released = self
            .store
            .delete_if_owner(&self.key(resource_id), holder.as_str().as_bytes())
            .await?;
        if !released {
            warn!("lock not held at release, likely expired");
        }
        Ok(released)
    }

    /// Acquire, run `body`, release. Release happens even if `body` panics.
    pub async fn run_exclusive<F, Fut, T>(
        &self,
        resource_id: &str,
        holder: &HolderId,
        ttl: Duration,
        body: F,
    ) -> Result<ExclusiveRun<T>, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        if !self.acquire(resource_id, holder, ttl).await? {
            debug!(resource_id, "resource owned elsewhere, skipping");
            return Ok(ExclusiveRun::Skipped);
        }

        let outcome = AssertUnwindSafe(body()).catch_unwind().await;

        if let Err(e) = self.release(resource_id, holder).await {
            error!(resource_id, error = %e, "lock release failed, entry will expire");
        }

        Ok(match outcome {
            Ok(value) => ExclusiveRun::Completed(value),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                error!(resource_id, panic = %msg, "exclusive body panicked");
                ExclusiveRun::Panicked(msg)
            }
        })
    }
}
