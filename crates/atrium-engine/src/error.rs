use atrium_core::errors::CompletionError;
use atrium_core::tools::ToolError;
use atrium_store::StoreError;

use crate::workflow::WorkflowError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("run aborted")]
    Aborted,

    #[error("max turns exceeded: {0}")]
    MaxTurnsExceeded(u32),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code for error records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Completion(e) if e.is_retryable() => "completion_unavailable",
            Self::Completion(_) => "completion_failed",
            Self::Store(_) => "store_unavailable",
            Self::Tool(_) => "tool_failed",
            Self::Workflow(e) => e.code(),
            Self::Aborted => "aborted",
            Self::MaxTurnsExceeded(_) => "max_turns_exceeded",
            Self::Internal(_) => "internal",
        }
    }
}
