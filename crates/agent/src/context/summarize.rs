//! Summarization of older transcript prefixes.

use async_trait::async_trait;
use agentloom_core::error::ContextError;
use agentloom_core::message::{Message, Role};
use agentloom_core::provider::DecodingParams;
use tokio::time::Instant;

use crate::gateway::ModelGateway;

/// Prefix of every synthetic summary message.
pub const SUMMARY_HEADER: &str = "Summary of earlier conversation:";

const SUMMARY_INSTRUCTIONS: &str = "You compress agent transcripts. \
Summarize the conversation below, keeping only:\n\
1. Important decisions made\n\
2. Key facts discovered (including tool results and errors)\n\
3. Current state of the task\n\
Answer with the summary text only.";

/// A produced summary and the tokens it cost.
#[derive(Debug, Clone)]
pub struct Summary {
    pub text: String,
    pub tokens: u64,
}

/// Turns a run of messages into one short text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<Summary, ContextError>;
}

/// Summarizer backed by a secondary model call.
pub struct GatewaySummarizer<'a> {
    gateway: &'a ModelGateway,
    deadline: Option<Instant>,
}

impl<'a> GatewaySummarizer<'a> {
    pub fn new(gateway: &'a ModelGateway, deadline: Option<Instant>) -> Self {
        Self { gateway, deadline }
    }
}

#[async_trait]
impl Summarizer for GatewaySummarizer<'_> {
    async fn summarize(&self, messages: &[Message]) -> Result<Summary, ContextError> {
        let transcript = vec![
            Message::system(SUMMARY_INSTRUCTIONS),
            Message::user(format!("Conversation:\n{}", flatten(messages))),
        ];
        let params = DecodingParams {
            structured_output: false,
            ..DecodingParams::deterministic()
        };
        let response = self
            .gateway
            .complete(&transcript, &[], &params, self.deadline)
            .await
            .map_err(|e| ContextError::Summarization(e.to_string()))?;

        if response.message.has_tool_calls() {
            return Err(ContextError::Summarization(
                "model answered with tool calls instead of a summary".into(),
            ));
        }
        Ok(Summary {
            text: response.message.text().trim().to_string(),
            tokens: response.tokens,
        })
    }
}

/// Plain-text rendering of messages for the summarization prompt.
pub fn flatten(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool if m.is_error => "tool error",
            Role::Tool => "tool",
        };
        if m.has_tool_calls() {
            for call in &m.tool_calls {
                out.push_str(&format!("assistant called {}({})\n", call.name, call.arguments));
            }
        } else {
            out.push_str(&format!("{role}: {}\n", m.text()));
        }
    }
    out
}
