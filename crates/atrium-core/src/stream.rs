use crate::errors::CompletionError;
use crate::messages::{AssistantMessage, ToolCallBlock};

/// Events emitted while a completion streams. Ordering contract:
///
/// (TextDelta | ToolCall)* → Done
///
/// Error can appear at any point and is terminal.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    TextDelta { delta: String },
    ToolCall { tool_call: ToolCallBlock },
    Done { message: AssistantMessage },
    Error { error: CompletionError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn is_content_delta(&self) -> bool {
        matches!(self, Self::TextDelta { .. })
    }
}
