//! Message domain types.
//!
//! These are the value objects that flow through a run:
//! User asks → Gateway returns an Assistant turn → tools answer with Tool turns.
//! Once appended to a transcript a message is never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a message sender in a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions (always first when present)
    System,
    /// The end user
    User,
    /// The model
    Assistant,
    /// Tool execution result
    Tool,
}

/// A single message in a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content. `None` for assistant turns that only request tools.
    #[serde(default)]
    pub content: Option<String>,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool results only: whether the call failed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,

    /// User replies only: the pending tool call this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn base(role: Role, content: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
            reply_to: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, Some(content.into()))
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, Some(content.into()))
    }

    /// Create a user message that answers a specific pending tool call.
    pub fn user_reply(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        let mut msg = Self::base(Role::User, Some(content.into()));
        msg.reply_to = Some(tool_call_id.into());
        msg
    }

    /// Create a text-only assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, Some(content.into()))
    }

    /// Create an assistant message that requests tool calls.
    pub fn assistant_tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::base(Role::Assistant, None);
        msg.tool_calls = calls;
        msg
    }

    /// Create a tool result message.
    pub fn tool_result(result: ToolCallResult) -> Self {
        let mut msg = Self::base(Role::Tool, Some(result.content));
        msg.tool_call_id = Some(result.tool_call_id);
        msg.is_error = result.is_error;
        msg
    }

    /// The text content, or an empty string.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Whether this is an assistant turn that requests tools.
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// A tool call embedded in an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique ID for this tool call
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments exactly as the model produced them
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// The outcome of one tool call, appended as a Tool message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "Hello, agent!");
        assert!(msg.tool_calls.is_empty());
        assert!(msg.reply_to.is_none());
    }

    #[test]
    fn tool_call_message_has_no_content() {
        let msg = Message::assistant_tool_calls(vec![ToolCallRequest::new(
            "call_1",
            "check_status",
            r#"{"hostname":"web-01"}"#,
        )]);
        assert!(msg.content.is_none());
        assert!(msg.has_tool_calls());
    }

    #[test]
    fn tool_result_carries_error_flag() {
        let msg = Message::tool_result(ToolCallResult::error("call_1", "boom"));
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(msg.is_error);
    }

    #[test]
    fn message_serialization_roundtrip() {
        let msg = Message::user_reply("yes", "call_7");
        let json = serde_json::to_string(&msg).unwrap();
        let deserialized: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, msg);
        assert_eq!(deserialized.reply_to.as_deref(), Some("call_7"));
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }
}
