//! The agentloom runtime: a bounded ReAct loop around a language model.
//!
//! A run alternates between asking the model for its next move and
//! executing the tool calls it requests:
//!
//! 1. **Render** the context window (compacted to budget)
//! 2. **Call** the model through the [`ModelGateway`] (retries, deadlines,
//!    output normalization)
//! 3. **If tool calls**: stall check → schema validation → one
//!    [`ArgumentRepairer`] attempt → [`RiskGate`] → execute, append results,
//!    go back to step 1
//! 4. **If text**: the run has its answer
//!
//! Dangerous or incomplete calls suspend the run until [`AgentLoop::resume`]
//! supplies the user's reply. Budget, iteration, stall and deadline limits end
//! the run with a named [`TerminationReason`].

pub mod context;
pub mod gateway;
pub mod loop_runner;
pub mod repair;
pub mod risk;
pub mod state;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use context::{
    CompactionReport, ContextCheckpoint, ContextManager, GatewaySummarizer, HeuristicCounter,
    Summarizer, Summary, TokenCounter,
};
pub use gateway::{GatewayError, GatewayResponse, ModelGateway, RetryPolicy};
pub use loop_runner::AgentLoop;
pub use repair::{ArgumentRepairer, RepairFailed, RepairedArguments};
pub use risk::{EscalationRule, RiskAction, RiskDecision, RiskGate, RuleError};
pub use state::{
    AgentRun, LoopState, RunCheckpoint, RunOutcome, Suspension, SuspensionKind, TerminationReason,
};
