//! Task decomposition through the model gateway.
//!
//! The model proposes steps; the planner only checks structure. Answers may
//! be raw JSON or wrapped in a ```json / ```plan fence, and may be either
//! `{"steps": [...]}` or a bare array.

use std::sync::Arc;

use agentloom_agent::ModelGateway;
use agentloom_core::event::{AgentEvent, EventBus};
use agentloom_core::message::Message;
use agentloom_core::provider::DecodingParams;
use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PlanError;
use crate::model::{Plan, PlanStep};

const DECOMPOSE_INSTRUCTIONS: &str = "You are a planner. Break the user's task into small steps \
that can each be carried out on their own. Answer ONLY with JSON of the form \
{\"steps\": [{\"id\": \"1\", \"description\": \"...\", \"depends_on\": []}]}. \
A step may only depend on other steps in the same answer. Do not add commentary.";

pub struct Planner {
    gateway: Arc<ModelGateway>,
    event_bus: Option<Arc<EventBus>>,
}

impl Planner {
    pub fn new(gateway: Arc<ModelGateway>) -> Self {
        Self { gateway, event_bus: None }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Ask the model for a step list and turn it into a validated plan.
    ///
    /// The plan id is chosen before the model call so the call's event is
    /// keyed by the same id as the plan's step transitions.
    pub async fn decompose(&self, task: &str) -> Result<Plan, PlanError> {
        let plan_id = Uuid::new_v4().to_string();
        let transcript = vec![Message::system(DECOMPOSE_INSTRUCTIONS), Message::user(task)];
        let started = Instant::now();
        let result = self
            .gateway
            .complete(&transcript, &[], &DecodingParams::deterministic(), None)
            .await;

        if let Some(bus) = &self.event_bus {
            let (tokens, attempts) = match &result {
                Ok(r) => (r.tokens, r.attempts),
                Err(_) => (0, 0),
            };
            bus.publish(AgentEvent::ModelCallFinished {
                run_id: plan_id.clone(),
                purpose: "decompose".into(),
                tokens,
                attempts,
                duration_ms: started.elapsed().as_millis() as u64,
                success: result.is_ok(),
                timestamp: Utc::now(),
            });
        }

        let response = result.map_err(|e| PlanError::Gateway(e.to_string()))?;
        if response.message.has_tool_calls() {
            return Err(PlanError::InvalidDecomposition("model answered with tool calls".into()));
        }

        let steps = parse_steps(response.message.text())?;
        let plan = Plan::new(task, steps)
            .inspect_err(|e| {
                warn!(%plan_id, error = %e, "Decomposition rejected");
            })?
            .with_id(plan_id);
        info!(plan_id = %plan.id, steps = plan.steps.len(), tokens = response.tokens, "Task decomposed");
        Ok(plan)
    }
}

/// Parse the model's step list.
pub fn parse_steps(text: &str) -> Result<Vec<PlanStep>, PlanError> {
    let value = extract_json(text)
        .ok_or_else(|| PlanError::InvalidDecomposition("no JSON step list in answer".into()))?;

    let items = match &value {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get("steps")
            .or_else(|| map.get("tasks"))
            .and_then(Value::as_array)
            .ok_or_else(|| PlanError::InvalidDecomposition("missing \"steps\" array".into()))?,
        _ => return Err(PlanError::InvalidDecomposition("expected an object or array".into())),
    };

    let mut steps = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let id = item
            .get("id")
            .and_then(id_string)
            .unwrap_or_else(|| (index + 1).to_string());
        let description = item
            .get("description")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| PlanError::InvalidDecomposition(format!("step '{id}' has no description")))?;
        let dependencies = item
            .get("depends_on")
            .or_else(|| item.get("dependencies"))
            .and_then(Value::as_array)
            .map(|deps| deps.iter().filter_map(id_string).collect::<Vec<_>>())
            .unwrap_or_default();

        steps.push(PlanStep::new(id, description).with_dependencies(dependencies));
    }
    debug!(count = steps.len(), "Parsed plan steps");
    Ok(steps)
}

/// Ids may come back as strings or numbers.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_json(text: &str) -> Option<Value> {
    let mut in_block = false;
    let mut block = String::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if !in_block && matches!(trimmed, "```json" | "```plan" | "```") {
            in_block = true;
            block.clear();
        } else if in_block && trimmed == "```" {
            if let Ok(value) = serde_json::from_str(&block) {
                return Some(value);
            }
            in_block = false;
        } else if in_block {
            block.push_str(line);
            block.push('\n');
        }
    }

    if let Ok(value) = serde_json::from_str(text.trim()) {
        return Some(value);
    }

    // Prose around a bare object or array.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close))
            && end > start
            && let Ok(value) = serde_json::from_str(&text[start..=end])
        {
            return Some(value);
        }
    }
    None
}
