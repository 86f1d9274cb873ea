//! Bounded context window over an append-only transcript.
//!
//! The manager keeps two views:
//!
//! - the **transcript**: every message ever appended, never rewritten;
//! - the **window**: what is rendered to the model, compacted to fit the
//!   token budget.
//!
//! Compaction works on *groups*: a message plus the Tool results that follow
//! it. An assistant tool-call turn and its results are always dropped or
//! summarized together, so a rendered window never contains a result without
//! its request or a request without its results.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

use agentloom_config::{CompactionPolicy, ContextConfig};
use agentloom_core::error::ContextError;
use agentloom_core::message::{Message, Role};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::summarize::{SUMMARY_HEADER, Summarizer};
use super::token::TokenCounter;

/// Messages at the tail that prioritization never drops.
const PRIORITY_RECENT: usize = 5;

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    tokens: usize,
}

/// What a compaction pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub strategy: &'static str,
    pub messages_removed: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// Tokens spent on summarization calls
    pub tokens_spent: u64,
}

/// Serializable snapshot of a [`ContextManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextCheckpoint {
    pub transcript: Vec<Message>,
    pub window: Vec<Message>,
    #[serde(default)]
    pub reserved_tokens: usize,
}

pub struct ContextManager {
    transcript: Vec<Message>,
    window: Vec<Entry>,
    requested: HashSet<String>,
    /// Unanswered call ids in request order
    pending: Vec<String>,
    answered: HashSet<String>,
    config: ContextConfig,
    reserved: usize,
    counter: Arc<dyn TokenCounter>,
}

impl ContextManager {
    pub fn new(config: ContextConfig, counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            transcript: Vec::new(),
            window: Vec::new(),
            requested: HashSet::new(),
            pending: Vec::new(),
            answered: HashSet::new(),
            config,
            reserved: 0,
            counter,
        }
    }

    /// Tokens set aside for content outside the transcript (tool catalog).
    pub fn with_reserved_tokens(mut self, tokens: usize) -> Self {
        self.reserved = tokens;
        self
    }

    /// Append a message to both the transcript and the window.
    ///
    /// Rejects a System message anywhere but first, Tool results that do not
    /// answer a pending call, and reused tool call ids.
    pub fn append(&mut self, message: Message) -> Result<(), ContextError> {
        match message.role {
            Role::System if !self.transcript.is_empty() => return Err(ContextError::SystemNotFirst),
            Role::Tool => {
                let id = message
                    .tool_call_id
                    .as_deref()
                    .ok_or(ContextError::MissingToolCallId)?;
                if self.answered.contains(id) {
                    return Err(ContextError::DuplicateToolResult(id.to_string()));
                }
                let Some(pos) = self.pending.iter().position(|p| p == id) else {
                    return Err(ContextError::OrphanToolResult(id.to_string()));
                };
                self.pending.remove(pos);
                self.answered.insert(id.to_string());
            }
            Role::Assistant => {
                let mut fresh = HashSet::new();
                for call in &message.tool_calls {
                    if self.requested.contains(&call.id) || !fresh.insert(call.id.as_str()) {
                        return Err(ContextError::DuplicateToolCall(call.id.clone()));
                    }
                }
                for call in &message.tool_calls {
                    self.requested.insert(call.id.clone());
                    self.pending.push(call.id.clone());
                }
            }
            _ => {}
        }

        let tokens = self.counter.count_message(&message);
        self.transcript.push(message.clone());
        self.window.push(Entry { message, tokens });
        Ok(())
    }

    /// Every message ever appended, oldest first.
    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    /// Tool call ids that have been requested but not answered yet, in
    /// request order.
    pub fn pending_calls(&self) -> &[String] {
        &self.pending
    }

    /// Token budget left for messages.
    pub fn budget(&self) -> usize {
        self.config.budget_tokens.saturating_sub(self.reserved)
    }

    pub fn window_tokens(&self) -> usize {
        self.window.iter().map(|e| e.tokens).sum()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Immutable snapshot for the model.
    ///
    /// A tool-call group whose results are not all present is left out, so
    /// the snapshot never ends on unanswered tool calls.
    pub fn render(&self) -> Vec<Message> {
        groups(&self.window)
            .into_iter()
            .filter(|g| self.is_complete(g))
            .flat_map(|g| self.window[g].iter().map(|e| e.message.clone()))
            .collect()
    }

    /// Bring the window back under budget according to the configured policy.
    ///
    /// Summarization failures fall back to trimming; compaction itself never
    /// fails the run.
    pub async fn compact(&mut self, summarizer: Option<&dyn Summarizer>) -> Option<CompactionReport> {
        let budget = self.budget();
        let before = self.window_tokens();
        let len_before = self.window.len();
        let mut spent = 0;

        let strategy = match self.config.policy {
            CompactionPolicy::Trim => {
                if before <= budget {
                    return None;
                }
                self.trim(budget);
                "trim"
            }
            CompactionPolicy::Summarize => {
                if before <= budget {
                    return None;
                }
                let strategy = match self.summarize(summarizer).await {
                    Some(tokens) => {
                        spent += tokens;
                        "summarize"
                    }
                    None => "trim",
                };
                self.trim(budget);
                strategy
            }
            CompactionPolicy::Adaptive => {
                let ratio = if budget == 0 {
                    f32::INFINITY
                } else {
                    before as f32 / budget as f32
                };
                let strategy = if ratio < self.config.prioritize_at {
                    return None;
                } else if ratio < self.config.summarize_at {
                    let target = (budget as f32 * self.config.prioritize_at) as usize;
                    self.prioritize(target);
                    "prioritize"
                } else {
                    match self.summarize(summarizer).await {
                        Some(tokens) => {
                            spent += tokens;
                            "summarize"
                        }
                        None => {
                            let target = (budget as f32 * self.config.prioritize_at) as usize;
                            self.prioritize(target);
                            "prioritize"
                        }
                    }
                };
                self.trim(budget);
                strategy
            }
        };

        let after = self.window_tokens();
        let report = CompactionReport {
            strategy,
            messages_removed: len_before.saturating_sub(self.window.len()),
            tokens_before: before,
            tokens_after: after,
            tokens_spent: spent,
        };
        if after > budget {
            warn!(budget, tokens = after, "Context still over budget after compaction");
        }
        info!(
            strategy,
            tokens_before = before,
            tokens_after = after,
            removed = report.messages_removed,
            "Context compacted"
        );
        Some(report)
    }

    /// Drop the oldest droppable groups until the window fits `target`.
    fn trim(&mut self, target: usize) {
        while self.window_tokens() > target {
            let groups = groups(&self.window);
            let Some(victim) = (0..groups.len())
                .find(|&i| !self.is_protected(i, &groups))
                .map(|i| groups[i].clone())
            else {
                break;
            };
            debug!(messages = victim.len(), "Trimming oldest message group");
            self.window.drain(victim);
        }
    }

    /// Drop plain exchanges first, keeping tool results, errors and the
    /// most recent messages.
    fn prioritize(&mut self, target: usize) {
        while self.window_tokens() > target {
            let groups = groups(&self.window);
            let recent_from = self.window.len().saturating_sub(PRIORITY_RECENT);
            let Some(victim) = (0..groups.len())
                .find(|&i| {
                    let g = &groups[i];
                    !self.is_protected(i, &groups) && g.end <= recent_from && !self.is_important(g)
                })
                .map(|i| groups[i].clone())
            else {
                break;
            };
            self.window.drain(victim);
        }
    }

    /// Replace the older prefix with one System summary.
    ///
    /// Returns the tokens spent, or `None` when nothing was summarized.
    async fn summarize(&mut self, summarizer: Option<&dyn Summarizer>) -> Option<u64> {
        let summarizer = summarizer?;
        let groups = groups(&self.window);
        if groups.is_empty() {
            return None;
        }

        let first = usize::from(self.is_original_system(0, &groups));
        let mut split = groups.len() - 1;
        let mut kept = groups[split].len();
        while split > first && kept < self.config.keep_recent {
            split -= 1;
            kept += groups[split].len();
        }
        if split <= first {
            return None;
        }

        let range = groups[first].start..groups[split - 1].end;
        let prefix: Vec<Message> = self.window[range.clone()]
            .iter()
            .map(|e| e.message.clone())
            .collect();

        match summarizer.summarize(&prefix).await {
            Ok(summary) => {
                let message = Message::system(format!("{SUMMARY_HEADER}\n{}", summary.text));
                let tokens = self.counter.count_message(&message);
                self.window
                    .splice(range, std::iter::once(Entry { message, tokens }));
                Some(summary.tokens)
            }
            Err(e) => {
                warn!(error = %e, "Summarization failed, falling back to trimming");
                None
            }
        }
    }

    fn is_original_system(&self, index: usize, groups: &[Range<usize>]) -> bool {
        index == 0
            && groups.first().is_some_and(|g| g.start == 0)
            && self.window.first().is_some_and(|e| {
                e.message.role == Role::System
                    && self.transcript.first().is_some_and(|t| t.id == e.message.id)
            })
    }

    fn is_protected(&self, index: usize, groups: &[Range<usize>]) -> bool {
        index + 1 == groups.len() || self.is_original_system(index, groups)
    }

    fn is_complete(&self, group: &Range<usize>) -> bool {
        let head = &self.window[group.start].message;
        if !head.has_tool_calls() {
            return true;
        }
        let answered: HashSet<&str> = self.window[group.clone()]
            .iter()
            .filter_map(|e| e.message.tool_call_id.as_deref())
            .collect();
        head.tool_calls.iter().all(|c| answered.contains(c.id.as_str()))
    }

    fn is_important(&self, group: &Range<usize>) -> bool {
        self.window[group.clone()].iter().any(|e| {
            e.message.role == Role::Tool
                || e.message.is_error
                || e.message.text().to_lowercase().contains("error")
        })
    }

    pub fn checkpoint(&self) -> ContextCheckpoint {
        ContextCheckpoint {
            transcript: self.transcript.clone(),
            window: self.window.iter().map(|e| e.message.clone()).collect(),
            reserved_tokens: self.reserved,
        }
    }

    /// Rebuild a manager from a checkpoint, re-checking transcript invariants.
    pub fn restore(
        checkpoint: ContextCheckpoint,
        config: ContextConfig,
        counter: Arc<dyn TokenCounter>,
    ) -> Result<Self, ContextError> {
        let mut manager = Self::new(config, counter).with_reserved_tokens(checkpoint.reserved_tokens);
        for message in checkpoint.transcript {
            manager.append(message)?;
        }
        manager.window = checkpoint
            .window
            .into_iter()
            .map(|message| {
                let tokens = manager.counter.count_message(&message);
                Entry { message, tokens }
            })
            .collect();
        Ok(manager)
    }
}

/// Split a window into groups: each non-Tool message starts a group and
/// owns the Tool messages that follow it.
fn groups(window: &[Entry]) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut start = 0;
    for i in 1..=window.len() {
        if i == window.len() || window[i].message.role != Role::Tool {
            if start < i {
                out.push(start..i);
            }
            start = i;
        }
    }
    out
}
