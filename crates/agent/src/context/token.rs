//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token.
//! This approximation is accurate within ~10% for BPE tokenizers on English
//! text. Callers with access to an exact tokenizer implement [`TokenCounter`]
//! and inject it instead.

use agentloom_core::message::Message;
use agentloom_core::provider::ToolDefinition;

/// Per-message cost of role names, delimiters and formatting markers.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Per-call cost of the tool-call envelope (id, type, function wrapper).
pub const TOOL_CALL_OVERHEAD: usize = 10;

/// Counts tokens for budget enforcement.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> usize;

    fn count_message(&self, message: &Message) -> usize {
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|c| TOOL_CALL_OVERHEAD + self.count_text(&c.name) + self.count_text(&c.arguments))
            .sum();
        MESSAGE_OVERHEAD + self.count_text(message.text()) + calls
    }

    fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }
}

/// The 4-characters-per-token heuristic.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count_text(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimate tokens for a tool definition (serialized as JSON).
pub fn estimate_tool_tokens(tool: &ToolDefinition) -> usize {
    let json = serde_json::to_string(tool).unwrap_or_default();
    estimate_tokens(&json)
}
