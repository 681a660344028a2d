use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::{RunId, ThreadId};
use crate::launcher::PendingExternalTask;
use crate::tenant::TenantKey;

/// Name of the dedicated tool that parks a thread until an external task calls back.
pub const WAIT_TOOL_NAME: &str = "wait_on_external_task";

/// How a tool completes relative to the turn loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Runs inline; its result feeds straight back into the next turn.
    Fast,
    /// Returns a launch acknowledgment; the real result arrives by callback.
    LongRunning,
}

/// Context available to tools during execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub tenant: TenantKey,
    pub thread_id: ThreadId,
    pub run_id: Option<RunId>,
    pub abort_signal: CancellationToken,
}

/// Result returned by a tool execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    /// Set by long-running tools once the launcher accepted the task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launched: Option<PendingExternalTask>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            launched: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            launched: None,
        }
    }

    pub fn launched(content: impl Into<String>, pending: PendingExternalTask) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            launched: Some(pending),
        }
    }
}

/// Tool definition sent to the completion capability as part of the schema.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    fn kind(&self) -> ToolKind {
        ToolKind::Fast
    }

    /// Workflow-only tools are hidden while a run is paused for conversation.
    fn workflow_only(&self) -> bool {
        false
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// Pull a required string argument out of a tool-call payload.
pub fn require_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required argument: {key}")))
}
