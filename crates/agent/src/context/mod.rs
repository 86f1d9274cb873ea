//! Context management for a single run.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`ContextManager`] | append-only transcript plus the bounded window sent to the model |
//! | [`Summarizer`] | folds an old transcript prefix into one System message |
//! | [`TokenCounter`] | cost estimate for messages and tool definitions |

pub mod manager;
pub mod summarize;
pub mod token;

pub use manager::{CompactionReport, ContextCheckpoint, ContextManager};
pub use summarize::{GatewaySummarizer, SUMMARY_HEADER, Summarizer, Summary};
pub use token::{HeuristicCounter, TokenCounter, estimate_tokens, estimate_tool_tokens};
