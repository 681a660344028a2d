//! Compaction: replaces a thread's history with a summary once the token
//! budget is exceeded.

use std::sync::Arc;

use atrium_core::messages::Message;
use atrium_core::provider::{Completion, CompletionProvider, CompletionRequest, ToolChoice};
use atrium_core::tokens::estimate_tokens;
use atrium_store::ThreadHistory;
use tracing::{info, warn};

const SUMMARY_PROMPT: &str = "You condense conversations between a business assistant and its user. \
Write a compact summary that keeps every decision, open question, identifier, number and \
outstanding task. Do not add commentary.";

const SUMMARY_REQUEST: &str = "Summarize the conversation above so it can replace the full history.";

/// Messages kept verbatim when no model summary could be produced.
const FALLBACK_KEEP: usize = 6;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionResult {
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub replaced_messages: usize,
    /// False when the summary call failed and the history was truncated instead.
    pub summarized: bool,
}

pub struct Compactor {
    provider: Arc<dyn CompletionProvider>,
}

impl Compactor {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }

    /// Compact `history`. Never fails: a failed summary call degrades to
    /// keeping the most recent messages.
    pub async fn compact(&self, history: &ThreadHistory) -> (ThreadHistory, CompactionResult) {
        let tokens_before = history.counters.used();
        let (head, tail) = split_tail(&history.messages);

        let (mut messages, summarized) = match self.summarize(head).await {
            Some(summary) => (vec![Message::summary(summary, head.len())], true),
            None => (fallback(head), false),
        };
        messages.extend_from_slice(tail);

        let tokens_after = estimate_tokens(&messages);
        let mut counters = history.counters.clone();
        counters.reset_after_compaction(tokens_after);

        let result = CompactionResult {
            tokens_before,
            tokens_after,
            replaced_messages: head.len(),
            summarized,
        };
        info!(tokens_before, tokens_after, summarized, "history compacted");
        (ThreadHistory { messages, counters }, result)
    }

    async fn summarize(&self, messages: &[Message]) -> Option<String> {
        if messages.is_empty() {
            return None;
        }
        let mut history = messages.to_vec();
        history.push(Message::user_text(SUMMARY_REQUEST));
        let request = CompletionRequest {
            system_prompt: SUMMARY_PROMPT.to_string(),
            history,
            tools: Vec::new(),
            tool_choice: ToolChoice::None,
        };

        let mut attempt = self.provider.complete(&request).await;
        if let Err(e) = &attempt {
            if e.is_retryable() {
                warn!(error = %e, "summary call failed, retrying once");
                attempt = self.provider.complete(&request).await;
            }
        }

        match attempt {
            Ok(Completion::Text { text, .. }) | Ok(Completion::ToolCalls { text: Some(text), .. })
                if !text.trim().is_empty() =>
            {
                Some(text)
            }
            Ok(_) => {
                warn!("summary call returned no text");
                None
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "summary call failed, truncating instead");
                None
            }
        }
    }
}

/// Split off the part of the history that must survive verbatim: the input
/// still awaiting an answer, or an unanswered tool-call exchange.
fn split_tail(messages: &[Message]) -> (&[Message], &[Message]) {
    let last_assistant = messages.iter().rposition(|m| matches!(m, Message::Assistant(_)));
    let cut = match last_assistant {
        Some(i) => match &messages[i] {
            Message::Assistant(a) if a.has_tool_calls() && i + 1 < messages.len() => i,
            _ => i + 1,
        },
        None => messages.len().saturating_sub(1),
    };
    messages.split_at(cut)
}

/// Keep the last few messages, starting on a user input so no tool result is orphaned.
fn fallback(head: &[Message]) -> Vec<Message> {
    let mut start = head.len().saturating_sub(FALLBACK_KEEP);
    while start < head.len() && !matches!(head[start], Message::User(_)) {
        start += 1;
    }
    let dropped = start;
    let mut kept = Vec::with_capacity(head.len() - start + 1);
    if dropped > 0 {
        kept.push(Message::summary(
            format!("{dropped} earlier messages were removed to stay within the context budget."),
            dropped,
        ));
    }
    kept.extend_from_slice(&head[start..]);
    kept
}
