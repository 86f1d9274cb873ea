//! Observability for agentloom.
//!
//! Everything here hangs off the [`EventBus`](agentloom_core::event::EventBus):
//! [`spawn_event_logger`] turns events into `tracing` records and
//! [`TraceCollector`] folds them into per-run [`RunTrace`]s.

pub mod collector;
pub mod model;
pub mod subscriber;

pub use collector::TraceCollector;
pub use model::{RiskRecord, RunTrace, Span, SpanKind};
pub use subscriber::{init_tracing, spawn_event_logger};

/// Errors from the telemetry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),

    #[error("unknown run id: {0}")]
    UnknownRun(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
