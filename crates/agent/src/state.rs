//! Run state for the agent loop.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use agentloom_core::budget::TokenBudget;
use agentloom_core::error::ContextError;
use agentloom_core::message::{Message, ToolCallRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{ContextCheckpoint, ContextManager};

/// Where a run is in the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    AwaitingModel,
    ExecutingTools,
    AwaitingConfirmation,
    AwaitingClarification,
    Terminal,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    #[error("token budget exceeded ({used}/{limit} tokens)")]
    BudgetExceeded { used: u64, limit: u64 },

    #[error("max iterations exceeded ({max})")]
    MaxIterationsExceeded { max: u32 },

    #[error("stuck: '{tool_name}' called {repetitions} times in a row with identical arguments")]
    Stuck { tool_name: String, repetitions: usize },

    #[error("run deadline exceeded")]
    DeadlineExceeded,

    #[error("model gateway failed: {message}")]
    Gateway { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TerminationReason {
    /// Stable category name for operators and dashboards.
    pub fn category(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => "budget",
            Self::MaxIterationsExceeded { .. } => "iterations",
            Self::Stuck { .. } => "stuck",
            Self::DeadlineExceeded => "deadline",
            Self::Gateway { .. } => "gateway",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<ContextError> for TerminationReason {
    fn from(e: ContextError) -> Self {
        Self::Internal { message: e.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionKind {
    Confirmation,
    Clarification,
}

/// A question handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspension {
    pub kind: SuspensionKind,
    /// The tool call the question is about
    pub call_id: String,
    pub tool_name: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
}

/// What `drive` and `resume` hand back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Answer { text: String },
    Suspended(Suspension),
    Failed(TerminationReason),
}

impl RunOutcome {
    pub fn answer(&self) -> Option<&str> {
        match self {
            Self::Answer { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }

    pub fn failure(&self) -> Option<&TerminationReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// A gated call waiting for the user's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AwaitingCall {
    pub call: ToolCallRequest,
    /// Validated (possibly repaired) arguments as JSON text
    pub arguments: String,
    #[serde(default)]
    pub reply: Option<Message>,
}

/// Fingerprints of the most recent tool calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StallWindow {
    recent: VecDeque<String>,
}

impl StallWindow {
    /// Record a call and return how many identical calls end the window.
    pub fn record(&mut self, call: &ToolCallRequest, threshold: usize) -> usize {
        self.recent.push_back(fingerprint(call));
        while self.recent.len() > threshold.max(1) {
            self.recent.pop_front();
        }
        let Some(last) = self.recent.back() else {
            return 0;
        };
        self.recent.iter().rev().take_while(|f| *f == last).count()
    }
}

/// Name plus canonical arguments: key order and whitespace do not matter.
fn fingerprint(call: &ToolCallRequest) -> String {
    let args = serde_json::from_str::<Value>(&call.arguments)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| call.arguments.trim().to_string());
    format!("{}:{}", call.name, args)
}

/// One agent run: transcript, budget and where the state machine stands.
pub struct AgentRun {
    pub(crate) id: String,
    pub(crate) context: ContextManager,
    pub(crate) budget: TokenBudget,
    pub(crate) iteration: u32,
    pub(crate) state: LoopState,
    pub(crate) queue: VecDeque<ToolCallRequest>,
    pub(crate) awaiting: Option<AwaitingCall>,
    pub(crate) deferred: Vec<Message>,
    pub(crate) stall: StallWindow,
    pub(crate) seen_call_ids: HashSet<String>,
    pub(crate) active_elapsed: Duration,
    pub(crate) outcome: Option<RunOutcome>,
}

impl AgentRun {
    pub(crate) fn new(context: ContextManager, token_limit: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            context,
            budget: TokenBudget::new(token_limit),
            iteration: 0,
            state: LoopState::AwaitingModel,
            queue: VecDeque::new(),
            awaiting: None,
            deferred: Vec::new(),
            stall: StallWindow::default(),
            seen_call_ids: HashSet::new(),
            active_elapsed: Duration::ZERO,
            outcome: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    /// The full append-only transcript.
    pub fn transcript(&self) -> &[Message] {
        self.context.transcript()
    }

    /// The compacted window the next model call would see.
    pub fn render(&self) -> Vec<Message> {
        self.context.render()
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    pub fn suspension(&self) -> Option<&Suspension> {
        match &self.outcome {
            Some(RunOutcome::Suspended(s)) => Some(s),
            _ => None,
        }
    }

    /// Time spent driving the run, excluding time suspended.
    pub fn active_elapsed(&self) -> Duration {
        self.active_elapsed
    }

    pub fn checkpoint(&self) -> RunCheckpoint {
        RunCheckpoint {
            id: self.id.clone(),
            context: self.context.checkpoint(),
            budget: self.budget,
            iteration: self.iteration,
            state: self.state,
            queue: self.queue.iter().cloned().collect(),
            awaiting: self.awaiting.clone(),
            deferred: self.deferred.clone(),
            stall: self.stall.clone(),
            seen_call_ids: self.seen_call_ids.iter().cloned().collect(),
            active_elapsed_ms: self.active_elapsed.as_millis() as u64,
            outcome: self.outcome.clone(),
        }
    }
}

/// Serialized form of an [`AgentRun`], restored with `AgentLoop::restore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub id: String,
    pub context: ContextCheckpoint,
    pub budget: TokenBudget,
    pub iteration: u32,
    pub state: LoopState,
    #[serde(default)]
    pub queue: Vec<ToolCallRequest>,
    #[serde(default)]
    pub(crate) awaiting: Option<AwaitingCall>,
    #[serde(default)]
    pub deferred: Vec<Message>,
    #[serde(default)]
    pub(crate) stall: StallWindow,
    #[serde(default)]
    pub seen_call_ids: Vec<String>,
    #[serde(default)]
    pub active_elapsed_ms: u64,
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
}
