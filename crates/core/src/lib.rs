//! # agentloom Core
//!
//! Domain types, traits, and error definitions for the agentloom
//! orchestration runtime. Everything here is framework-agnostic: the model
//! backend and every tool are reached through traits, and all other crates
//! depend inward on this one.
//!
//! ## Design Philosophy
//!
//! - The model is an opaque [`Provider`]; wire formats live outside.
//! - Tools are validated before they run and never crash the caller.
//! - Observability is a broadcast [`EventBus`] of [`AgentEvent`]s.

pub mod budget;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use budget::TokenBudget;
pub use error::{ContextError, Error, ProviderError, Result, SchemaError, ToolError};
pub use event::{AgentEvent, EventBus};
pub use message::{Message, Role, ToolCallRequest, ToolCallResult};
pub use provider::{DecodingParams, Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use tool::{FunctionTool, ParsedArguments, RiskLevel, Tool, ToolOutput, ToolRegistry, required_fields};
