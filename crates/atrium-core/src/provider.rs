use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::errors::CompletionError;
use crate::messages::{AssistantMessage, Message, ToolCallBlock};
use crate::stream::StreamEvent;
use crate::tokens::TokenUsage;
use crate::tools::ToolDefinition;

/// How strongly the model is pushed towards calling tools.
///
/// A running workflow constrains the model to `Required`; a paused one relaxes
/// it to `Auto` so the agent can just talk.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    None,
}

/// Everything the completion capability sees for one call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub history: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
}

impl CompletionRequest {
    pub fn empty() -> Self {
        Self {
            system_prompt: String::new(),
            history: Vec::new(),
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
        }
    }
}

/// Final shape of one completion: plain text, or a request to call tools.
#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    Text {
        text: String,
        usage: TokenUsage,
    },
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCallBlock>,
        usage: TokenUsage,
    },
}

impl Completion {
    pub fn from_message(message: &AssistantMessage) -> Self {
        let usage = message.usage.unwrap_or_default();
        let text = message.text_content();
        if message.has_tool_calls() {
            Self::ToolCalls {
                text: (!text.is_empty()).then_some(text),
                calls: message.tool_calls().into_iter().cloned().collect(),
                usage,
            }
        } else {
            Self::Text { text, usage }
        }
    }

    pub fn usage(&self) -> TokenUsage {
        match self {
            Self::Text { usage, .. } | Self::ToolCalls { usage, .. } => *usage,
        }
    }
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// The opaque text/tool-calling completion capability.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, CompletionError>;

    /// Non-streaming convenience: drain the stream into a [`Completion`].
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let mut stream = self.stream(request).await?;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Done { message } => return Ok(Completion::from_message(&message)),
                StreamEvent::Error { error } => return Err(error),
                StreamEvent::TextDelta { .. } | StreamEvent::ToolCall { .. } => {}
            }
        }
        Err(CompletionError::StreamInterrupted("stream ended without Done event".into()))
    }
}
