use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CorrelationId, TenantId, ThreadId, UserId};
use crate::tenant::TenantKey;

/// Bookkeeping for an in-flight asynchronous job awaiting a callback.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingExternalTask {
    pub correlation_id: CorrelationId,
    pub task_type: String,
    /// Checklist step that is blocked on this task, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl PendingExternalTask {
    pub fn new(task_type: impl Into<String>, step_id: Option<String>) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            task_type: task_type.into(),
            step_id,
            registered_at: Utc::now(),
        }
    }
}

/// What gets handed to the external launcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub correlation_id: CorrelationId,
    pub task_type: String,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub thread_id: ThreadId,
    pub payload: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("launcher unreachable: {0}")]
    Unreachable(String),
    #[error("launcher rejected task: {0}")]
    Rejected(String),
}

/// Starts long-running work whose completion arrives later as a [`TaskCallback`].
#[async_trait]
pub trait TaskLauncher: Send + Sync {
    async fn launch(&self, descriptor: &TaskDescriptor) -> Result<LaunchAck, LaunchError>;
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Succeeded,
    Failed,
}

/// Out-of-band completion notice for a launched task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskCallback {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    pub status: CallbackStatus,
    #[serde(default)]
    pub result: serde_json::Value,
}

impl TaskCallback {
    pub fn tenant(&self) -> TenantKey {
        TenantKey {
            user_id: self.user_id.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }
}
