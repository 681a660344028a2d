use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{TenantId, ThreadId, UserId};

/// Identity of a tenant session: one user acting inside one tenant.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TenantKey {
    pub user_id: UserId,
    pub tenant_id: TenantId,
}

impl TenantKey {
    pub fn new(user_id: impl Into<UserId>, tenant_id: impl Into<TenantId>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    /// Shared-store key `{namespace}:{user}:{tenant}`.
    pub fn record_key(&self, namespace: &str) -> String {
        format!("{namespace}:{}:{}", self.user_id, self.tenant_id)
    }

    /// Shared-store key `{namespace}:{user}:{tenant}:{thread}`.
    pub fn thread_key(&self, namespace: &str, thread_id: &ThreadId) -> String {
        format!("{namespace}:{}:{}:{thread_id}", self.user_id, self.tenant_id)
    }

    /// Shared-store key scoped below the tenant with an arbitrary suffix.
    pub fn scoped_key(&self, namespace: &str, suffix: &str) -> String {
        format!("{namespace}:{}:{}:{suffix}", self.user_id, self.tenant_id)
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_key_layout() {
        let key = TenantKey::new("u1", "t1");
        assert_eq!(key.record_key("session"), "session:u1:t1");
    }

    #[test]
    fn thread_key_layout() {
        let key = TenantKey::new("u1", "t1");
        let thread = ThreadId::from_raw("th9");
        assert_eq!(key.thread_key("history", &thread), "history:u1:t1:th9");
    }

    #[test]
    fn display_is_user_at_tenant() {
        assert_eq!(TenantKey::new("alice", "acme").to_string(), "alice@acme");
    }
}
