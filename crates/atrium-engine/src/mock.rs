//! Scripted [`CompletionProvider`] for deterministic tests without a real model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use atrium_core::errors::CompletionError;
use atrium_core::messages::{AssistantMessage, ToolCallBlock};
use atrium_core::provider::{CompletionProvider, CompletionRequest, CompletionStream};
use atrium_core::stream::StreamEvent;
use atrium_core::tokens::TokenUsage;

/// Pre-programmed responses, consumed in order.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of StreamEvents.
    Stream(Vec<StreamEvent>),
    /// Yield events with a pause before each one.
    Paced(Duration, Vec<StreamEvent>),
    /// Return an error from the stream() call itself.
    Error(CompletionError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::text_with_usage(text, TokenUsage::new(10, 5))
    }

    pub fn text_with_usage(text: &str, usage: TokenUsage) -> Self {
        Self::Stream(vec![
            StreamEvent::TextDelta { delta: text.to_string() },
            StreamEvent::Done {
                message: AssistantMessage::text(text).with_usage(usage),
            },
        ])
    }

    /// Text delivered as several chunks, `pause` apart.
    pub fn chunks(chunks: &[&str], pause: Duration) -> Self {
        let full: String = chunks.concat();
        let mut events: Vec<StreamEvent> = chunks
            .iter()
            .map(|c| StreamEvent::TextDelta { delta: (*c).to_string() })
            .collect();
        events.push(StreamEvent::Done {
            message: AssistantMessage::text(full).with_usage(TokenUsage::new(10, 5)),
        });
        Self::Paced(pause, events)
    }

    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self::tool_calls(vec![ToolCallBlock::new(name, arguments)])
    }

    pub fn tool_calls(calls: Vec<ToolCallBlock>) -> Self {
        let mut events: Vec<StreamEvent> = calls
            .iter()
            .map(|c| StreamEvent::ToolCall { tool_call: c.clone() })
            .collect();
        events.push(StreamEvent::Done {
            message: AssistantMessage::with_tool_calls(None, calls).with_usage(TokenUsage::new(10, 5)),
        });
        Self::Stream(events)
    }

    /// A stream that fails after it started.
    pub fn stream_error(error: CompletionError) -> Self {
        Self::Stream(vec![StreamEvent::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records every request it saw.
pub struct MockProvider {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, CompletionError> {
        self.requests.lock().push(request.clone());
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        let response = self.responses.get(idx).cloned().ok_or_else(|| {
            CompletionError::InvalidRequest(format!("MockProvider: no response configured for call {idx}"))
        })?;
        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<CompletionStream, CompletionError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Paced(pause, events) => {
                return Ok(Box::pin(stream::iter(events).then(move |event| async move {
                    tokio::time::sleep(pause).await;
                    event
                })));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
