//! Log output: the global `tracing` subscriber and a bus-to-log bridge.

use agentloom_config::TelemetryConfig;
use agentloom_core::event::{AgentEvent, EventBus};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::TelemetryError;

/// Install the global subscriber. `RUST_LOG` wins over `log_level`.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// Log every bus event until the bus is dropped.
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &AgentEvent) {
    match event {
        AgentEvent::RunStarted { run_id, .. } => info!(%run_id, "Run started"),
        AgentEvent::IterationStarted { run_id, iteration, .. } => {
            debug!(%run_id, iteration, "Iteration started")
        }
        AgentEvent::ModelCallFinished {
            run_id,
            purpose,
            tokens,
            attempts,
            duration_ms,
            success,
            ..
        } => debug!(%run_id, %purpose, tokens, attempts, duration_ms, success, "Model call finished"),
        AgentEvent::ToolCallStarted { run_id, call_id, tool_name, .. } => {
            debug!(%run_id, %call_id, tool = %tool_name, "Tool call started")
        }
        AgentEvent::ToolCallFinished {
            run_id,
            call_id,
            tool_name,
            is_error,
            duration_ms,
            ..
        } => {
            if *is_error {
                warn!(%run_id, %call_id, tool = %tool_name, duration_ms, "Tool call failed");
            } else {
                info!(%run_id, %call_id, tool = %tool_name, duration_ms, "Tool call finished");
            }
        }
        AgentEvent::RiskAssessed {
            run_id,
            call_id,
            tool_name,
            level,
            decision,
            ..
        } => info!(%run_id, %call_id, tool = %tool_name, %level, %decision, "Risk assessed"),
        AgentEvent::ArgumentsRepaired { run_id, call_id, tool_name, success, .. } => {
            info!(%run_id, %call_id, tool = %tool_name, success, "Arguments repaired")
        }
        AgentEvent::ContextCompacted {
            run_id,
            strategy,
            messages_removed,
            tokens_before,
            tokens_after,
            ..
        } => info!(%run_id, %strategy, messages_removed, tokens_before, tokens_after, "Context compacted"),
        AgentEvent::RunSuspended { run_id, call_id, reason, .. } => {
            info!(%run_id, %call_id, %reason, "Run suspended")
        }
        AgentEvent::RunTerminated {
            run_id,
            outcome,
            reason,
            iterations,
            tokens_used,
            ..
        } => match reason {
            Some(reason) => warn!(%run_id, %outcome, %reason, iterations, tokens_used, "Run terminated"),
            None => info!(%run_id, %outcome, iterations, tokens_used, "Run terminated"),
        },
        AgentEvent::PlanStepTransition { plan_id, step_id, from, to, .. } => {
            info!(%plan_id, step = %step_id, %from, %to, "Plan step transition")
        }
    }
}
