use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// External key-value store with per-key expiry, shared by every instance.
///
/// Whole values are last-writer-wins. Only `set_if_absent` and
/// `delete_if_owner` are atomic, and the lock is built on those two.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Store `value` only if `key` is absent or expired. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `owner`. Returns whether it was deleted.
    async fn delete_if_owner(&self, key: &str, owner: &[u8]) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Join a deployment prefix and a record namespace: `atrium` + `session` → `atrium:session`.
pub fn namespace(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}:{name}")
    }
}
