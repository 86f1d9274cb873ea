//! One-shot repair of tool arguments that failed schema validation.
//!
//! The repairer makes a single constrained model call asking for corrected
//! JSON, then re-validates the answer exactly once. It fails closed: any
//! problem with the answer means the tool is not executed.

use std::collections::BTreeSet;
use std::sync::Arc;

use agentloom_core::error::{SchemaError, ToolError};
use agentloom_core::message::{Message, ToolCallRequest};
use agentloom_core::provider::DecodingParams;
use agentloom_core::tool::{ParsedArguments, ToolRegistry};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::gateway::ModelGateway;

const REPAIR_INSTRUCTIONS: &str = "You fix JSON arguments for tool calls. \
Return ONLY a single JSON object that satisfies the given schema. \
Rename, restructure or retype fields as needed, but never change, drop or invent values: \
keep every value the original arguments carry. No prose, no code fences.";

/// Arguments that passed validation after repair.
#[derive(Debug, Clone)]
pub struct RepairedArguments {
    pub arguments: ParsedArguments,
    /// The repaired JSON as the model produced it
    pub raw: String,
    /// Tokens spent on the repair call
    pub tokens: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("argument repair failed: {reason}")]
pub struct RepairFailed {
    pub reason: String,
    /// Tokens spent before failing (zero if the model was never reached)
    pub tokens: u64,
}

impl RepairFailed {
    fn new(reason: impl Into<String>, tokens: u64) -> Self {
        Self { reason: reason.into(), tokens }
    }
}

pub struct ArgumentRepairer {
    gateway: Arc<ModelGateway>,
}

impl ArgumentRepairer {
    pub fn new(gateway: Arc<ModelGateway>) -> Self {
        Self { gateway }
    }

    pub async fn repair(
        &self,
        registry: &ToolRegistry,
        call: &ToolCallRequest,
        error: &SchemaError,
        deadline: Option<Instant>,
    ) -> Result<RepairedArguments, RepairFailed> {
        let schema = registry
            .definition(&call.name)
            .map(|d| d.parameters)
            .ok_or_else(|| RepairFailed::new(ToolError::UnknownTool(call.name.clone()).to_string(), 0))?;

        let transcript = vec![
            Message::system(REPAIR_INSTRUCTIONS),
            Message::user(format!(
                "Tool: {}\nSchema:\n{}\nOriginal arguments:\n{}\nProblems:\n- {}",
                call.name,
                schema,
                call.arguments,
                error.violations.join("\n- ")
            )),
        ];

        let response = self
            .gateway
            .complete(&transcript, &[], &DecodingParams::deterministic(), deadline)
            .await
            .map_err(|e| RepairFailed::new(format!("repair call failed: {e}"), 0))?;
        let tokens = response.tokens;

        if response.message.has_tool_calls() {
            return Err(RepairFailed::new("model answered with tool calls", tokens));
        }
        let raw = extract_json(response.message.text())
            .ok_or_else(|| RepairFailed::new("no JSON object in repair answer", tokens))?
            .to_string();

        if let Ok(original) = serde_json::from_str::<Value>(&call.arguments) {
            let repaired: Value = serde_json::from_str(&raw)
                .map_err(|e| RepairFailed::new(format!("repair answer is not JSON: {e}"), tokens))?;
            let before = scalar_leaves(&original);
            let after = scalar_leaves(&repaired);
            let lost: Vec<&String> = before.difference(&after).collect();
            let invented: Vec<&String> = after.difference(&before).collect();
            if !lost.is_empty() || !invented.is_empty() {
                warn!(tool = %call.name, ?lost, ?invented, "Repair changed argument values");
                return Err(RepairFailed::new(
                    format!("repair altered argument values (lost {lost:?}, added {invented:?})"),
                    tokens,
                ));
            }
        }

        let arguments = registry
            .validate(&call.name, &raw)
            .map_err(|e| RepairFailed::new(format!("repaired arguments still invalid: {e}"), tokens))?;

        debug!(tool = %call.name, call_id = %call.id, tokens, "Arguments repaired");
        Ok(RepairedArguments { arguments, raw, tokens })
    }
}

/// The first JSON object in `text`, unwrapping a ```json fence if present.
fn extract_json(text: &str) -> Option<&str> {
    let text = text.trim();
    let body = match text.find("```") {
        Some(start) => {
            let after = &text[start + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            match after.find("```") {
                Some(end) => &after[..end],
                None => after,
            }
        }
        None => text,
    };
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| body[start..=end].trim())
}

/// Every string, number and boolean in `value`, rendered as text.
fn scalar_leaves(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_leaves(value, &mut out);
    out
}

fn collect_leaves(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Null => {}
        Value::String(s) => {
            out.insert(s.clone());
        }
        Value::Number(n) => {
            out.insert(n.to_string());
        }
        Value::Bool(b) => {
            out.insert(b.to_string());
        }
        Value::Array(items) => items.iter().for_each(|v| collect_leaves(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_leaves(v, out)),
    }
}
