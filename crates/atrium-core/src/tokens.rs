use serde::{Deserialize, Serialize};

use crate::messages::Message;

/// Per-call token usage as reported by the completion capability.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// Token-budget counters kept per thread. Reset by compaction.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCounters {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub last_input_tokens: u32,
    pub turn_count: u32,
    pub compactions: u32,
}

impl TokenCounters {
    pub fn accumulate(&mut self, usage: &TokenUsage) {
        self.total_input_tokens += u64::from(usage.input_tokens);
        self.total_output_tokens += u64::from(usage.output_tokens);
        self.last_input_tokens = usage.input_tokens;
        self.turn_count += 1;
    }

    /// Usage accumulated since the last compaction.
    pub fn used(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }

    pub fn exceeds(&self, budget: u64) -> bool {
        self.used() > budget
    }

    /// Start a fresh window after compaction, seeded with the compacted size.
    pub fn reset_after_compaction(&mut self, compacted_tokens: u64) {
        self.total_input_tokens = compacted_tokens;
        self.total_output_tokens = 0;
        self.last_input_tokens = u32::try_from(compacted_tokens).unwrap_or(u32::MAX);
        self.compactions += 1;
    }
}

/// Rough estimate (~4 chars per token) used when the provider reports nothing.
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    let chars: usize = messages.iter().map(|m| m.text().len()).sum();
    (chars as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_tracks_totals() {
        let mut c = TokenCounters::default();
        c.accumulate(&TokenUsage::new(100, 20));
        c.accumulate(&TokenUsage::new(150, 30));
        assert_eq!(c.used(), 300);
        assert_eq!(c.last_input_tokens, 150);
        assert_eq!(c.turn_count, 2);
        assert!(c.exceeds(299));
        assert!(!c.exceeds(300));
    }

    #[test]
    fn reset_after_compaction_counts() {
        let mut c = TokenCounters::default();
        c.accumulate(&TokenUsage::new(1000, 500));
        c.reset_after_compaction(80);
        assert_eq!(c.used(), 80);
        assert_eq!(c.compactions, 1);
        assert_eq!(c.turn_count, 1);
    }

    #[test]
    fn estimate_rounds_up() {
        let msgs = vec![Message::user_text("abcde")];
        assert_eq!(estimate_tokens(&msgs), 2);
        assert_eq!(estimate_tokens(&[]), 0);
    }
}
