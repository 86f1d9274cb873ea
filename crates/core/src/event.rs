//! Agent event system: structured observability without coupling.
//!
//! The loop, the gateway and the planner publish events as they work.
//! Loggers and tracers subscribe and filter for what they care about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::tool::RiskLevel;

/// All events emitted by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    RunStarted {
        run_id: String,
        timestamp: DateTime<Utc>,
    },

    IterationStarted {
        run_id: String,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },

    /// A gateway call finished (agent turn, repair, summary or decomposition)
    ModelCallFinished {
        run_id: String,
        purpose: String,
        tokens: u64,
        attempts: u32,
        duration_ms: u64,
        success: bool,
        timestamp: DateTime<Utc>,
    },

    ToolCallStarted {
        run_id: String,
        call_id: String,
        tool_name: String,
        timestamp: DateTime<Utc>,
    },

    ToolCallFinished {
        run_id: String,
        call_id: String,
        tool_name: String,
        is_error: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    RiskAssessed {
        run_id: String,
        call_id: String,
        tool_name: String,
        level: RiskLevel,
        decision: String,
        timestamp: DateTime<Utc>,
    },

    ArgumentsRepaired {
        run_id: String,
        call_id: String,
        tool_name: String,
        success: bool,
        timestamp: DateTime<Utc>,
    },

    ContextCompacted {
        run_id: String,
        strategy: String,
        messages_removed: usize,
        tokens_before: usize,
        tokens_after: usize,
        timestamp: DateTime<Utc>,
    },

    /// The run is waiting for a user reply
    RunSuspended {
        run_id: String,
        call_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    RunTerminated {
        run_id: String,
        outcome: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        iterations: u32,
        tokens_used: u64,
        timestamp: DateTime<Utc>,
    },

    PlanStepTransition {
        plan_id: String,
        step_id: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },
}

impl AgentEvent {
    /// Short machine name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::IterationStarted { .. } => "iteration_started",
            Self::ModelCallFinished { .. } => "model_call_finished",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallFinished { .. } => "tool_call_finished",
            Self::RiskAssessed { .. } => "risk_assessed",
            Self::ArgumentsRepaired { .. } => "arguments_repaired",
            Self::ContextCompacted { .. } => "context_compacted",
            Self::RunSuspended { .. } => "run_suspended",
            Self::RunTerminated { .. } => "run_terminated",
            Self::PlanStepTransition { .. } => "plan_step_transition",
        }
    }

    /// The run this event belongs to, if any.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::IterationStarted { run_id, .. }
            | Self::ModelCallFinished { run_id, .. }
            | Self::ToolCallStarted { run_id, .. }
            | Self::ToolCallFinished { run_id, .. }
            | Self::RiskAssessed { run_id, .. }
            | Self::ArgumentsRepaired { run_id, .. }
            | Self::ContextCompacted { run_id, .. }
            | Self::RunSuspended { run_id, .. }
            | Self::RunTerminated { run_id, .. } => Some(run_id),
            Self::PlanStepTransition { .. } => None,
        }
    }
}

/// A broadcast-based event bus for agent events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<AgentEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: AgentEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AgentEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(AgentEvent::ToolCallFinished {
            run_id: "run-1".into(),
            call_id: "call_1".into(),
            tool_name: "check_status".into(),
            is_error: false,
            duration_ms: 42,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "tool_call_finished");
        assert_eq!(event.run_id(), Some("run-1"));
        match event.as_ref() {
            AgentEvent::ToolCallFinished { tool_name, is_error, .. } => {
                assert_eq!(tool_name, "check_status");
                assert!(!is_error);
            }
            _ => panic!("Expected ToolCallFinished event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(AgentEvent::RunStarted {
            run_id: "run-1".into(),
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = AgentEvent::PlanStepTransition {
            plan_id: "p".into(),
            step_id: "A".into(),
            from: "ready".into(),
            to: "running".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "plan_step_transition");
        assert!(event.run_id().is_none());
    }
}
