use serde::{Deserialize, Serialize};

use crate::ids::{CorrelationId, RunId, ThreadId, UserId};
use crate::run::{RunMode, RunState};

/// Events pushed to a user over the notification channel.
/// Delivery is fire-and-forget; nothing here is replayed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum NotificationEvent {
    #[serde(rename = "text_delta")]
    TextDelta { thread_id: ThreadId, delta: String },

    #[serde(rename = "message_complete")]
    MessageComplete { thread_id: ThreadId, text: String },

    #[serde(rename = "stream_stopped")]
    StreamStopped { thread_id: ThreadId },

    #[serde(rename = "agent_waiting")]
    AgentWaiting {
        thread_id: ThreadId,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<CorrelationId>,
    },

    #[serde(rename = "workflow_started")]
    WorkflowStarted {
        thread_id: ThreadId,
        run_id: RunId,
        task_name: String,
        mode: RunMode,
    },

    #[serde(rename = "user_joined")]
    UserJoined { thread_id: ThreadId, run_id: RunId },

    #[serde(rename = "workflow_state_changed")]
    WorkflowStateChanged {
        thread_id: ThreadId,
        run_id: RunId,
        from: RunState,
        to: RunState,
    },

    #[serde(rename = "workflow_mode_changed")]
    WorkflowModeChanged {
        thread_id: ThreadId,
        run_id: RunId,
        mode: RunMode,
    },

    #[serde(rename = "external_task_launched")]
    ExternalTaskLaunched {
        thread_id: ThreadId,
        correlation_id: CorrelationId,
        task_type: String,
    },

    #[serde(rename = "external_task_resolved")]
    ExternalTaskResolved {
        thread_id: ThreadId,
        correlation_id: CorrelationId,
    },

    #[serde(rename = "compaction_complete")]
    CompactionComplete {
        thread_id: ThreadId,
        tokens_before: u64,
        tokens_after: u64,
    },
}

impl NotificationEvent {
    pub fn thread_id(&self) -> &ThreadId {
        match self {
            Self::TextDelta { thread_id, .. }
            | Self::MessageComplete { thread_id, .. }
            | Self::StreamStopped { thread_id }
            | Self::AgentWaiting { thread_id, .. }
            | Self::WorkflowStarted { thread_id, .. }
            | Self::UserJoined { thread_id, .. }
            | Self::WorkflowStateChanged { thread_id, .. }
            | Self::WorkflowModeChanged { thread_id, .. }
            | Self::ExternalTaskLaunched { thread_id, .. }
            | Self::ExternalTaskResolved { thread_id, .. }
            | Self::CompactionComplete { thread_id, .. } => thread_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::MessageComplete { .. } => "message_complete",
            Self::StreamStopped { .. } => "stream_stopped",
            Self::AgentWaiting { .. } => "agent_waiting",
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::UserJoined { .. } => "user_joined",
            Self::WorkflowStateChanged { .. } => "workflow_state_changed",
            Self::WorkflowModeChanged { .. } => "workflow_mode_changed",
            Self::ExternalTaskLaunched { .. } => "external_task_launched",
            Self::ExternalTaskResolved { .. } => "external_task_resolved",
            Self::CompactionComplete { .. } => "compaction_complete",
        }
    }
}

/// Outbound channel to a user's live connections. At-most-once, no replay.
pub trait NotificationChannel: Send + Sync {
    fn publish(&self, user_id: &UserId, event: NotificationEvent);
}

/// Channel that drops everything. Used where no user is listening.
pub struct NullChannel;

impl NotificationChannel for NullChannel {
    fn publish(&self, _user_id: &UserId, _event: NotificationEvent) {}
}
