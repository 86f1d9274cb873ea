//! Builds [`RunTrace`]s from the event bus.
//!
//! The collector is a passive subscriber: the agent loop and the plan runner
//! never call it directly. Traces are kept in memory, oldest evicted first
//! once `max_traces` is reached.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use agentloom_core::event::{AgentEvent, EventBus};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::TelemetryError;
use crate::model::{RiskRecord, RunTrace, Span, SpanKind};

const DEFAULT_MAX_TRACES: usize = 1000;

pub struct TraceCollector {
    traces: RwLock<HashMap<String, RunTrace>>,
    /// Insertion order, for eviction
    order: RwLock<VecDeque<String>>,
    max_traces: usize,
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_TRACES)
    }

    pub fn with_capacity(max_traces: usize) -> Self {
        Self {
            traces: RwLock::new(HashMap::new()),
            order: RwLock::new(VecDeque::new()),
            max_traces: max_traces.max(1),
        }
    }

    /// Subscribe to `bus` and record every event until the bus is dropped.
    pub fn spawn(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let collector = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => collector.record(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Trace collector lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Fold one event into the matching trace.
    pub fn record(&self, event: &AgentEvent) {
        match event {
            AgentEvent::RunStarted { run_id, timestamp } => {
                self.with_trace(run_id, *timestamp, |_| {});
            }
            AgentEvent::IterationStarted { run_id, iteration, timestamp } => {
                self.with_trace(run_id, *timestamp, |t| t.iterations = *iteration);
            }
            AgentEvent::ModelCallFinished {
                run_id,
                purpose,
                tokens,
                attempts,
                duration_ms,
                success,
                timestamp,
            } => {
                self.with_trace(run_id, *timestamp, |t| {
                    let mut span = Span::completed(SpanKind::ModelCall, purpose.clone(), *timestamp, *duration_ms)
                        .with_metadata("attempts", *attempts);
                    span.tokens = Some(*tokens);
                    span.success = Some(*success);
                    t.tokens_used += tokens;
                    t.spans.push(span);
                });
            }
            AgentEvent::ToolCallStarted { run_id, call_id, tool_name, timestamp } => {
                self.with_trace(run_id, *timestamp, |t| {
                    let mut span =
                        Span::new(SpanKind::ToolExecution, tool_name.clone(), *timestamp).with_call_id(call_id.clone());
                    if let Some(risk) = t.risk_decision(call_id) {
                        span = span.with_metadata("risk_level", risk.level.clone());
                    }
                    t.spans.push(span);
                });
            }
            AgentEvent::ToolCallFinished {
                run_id,
                call_id,
                tool_name,
                is_error,
                duration_ms,
                timestamp,
            } => {
                self.with_trace(run_id, *timestamp, |t| {
                    match t.open_span_mut(SpanKind::ToolExecution, call_id) {
                        Some(span) => span.end(*timestamp, !is_error),
                        None => {
                            let mut span =
                                Span::completed(SpanKind::ToolExecution, tool_name.clone(), *timestamp, *duration_ms)
                                    .with_call_id(call_id.clone());
                            span.success = Some(!is_error);
                            t.spans.push(span);
                        }
                    }
                });
            }
            AgentEvent::RiskAssessed {
                run_id,
                call_id,
                tool_name,
                level,
                decision,
                timestamp,
            } => {
                self.with_trace(run_id, *timestamp, |t| {
                    t.risk_decisions.push(RiskRecord {
                        call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                        level: level.to_string(),
                        decision: decision.clone(),
                    });
                });
            }
            AgentEvent::ArgumentsRepaired { run_id, call_id, tool_name, success, timestamp } => {
                self.with_trace(run_id, *timestamp, |t| {
                    let mut span = Span::completed(SpanKind::Repair, tool_name.clone(), *timestamp, 0)
                        .with_call_id(call_id.clone());
                    span.success = Some(*success);
                    t.spans.push(span);
                });
            }
            AgentEvent::ContextCompacted {
                run_id,
                strategy,
                messages_removed,
                tokens_before,
                tokens_after,
                timestamp,
            } => {
                self.with_trace(run_id, *timestamp, |t| {
                    let mut span = Span::completed(SpanKind::Compaction, strategy.clone(), *timestamp, 0)
                        .with_metadata("messages_removed", *messages_removed)
                        .with_metadata("tokens_before", *tokens_before)
                        .with_metadata("tokens_after", *tokens_after);
                    span.success = Some(true);
                    t.spans.push(span);
                });
            }
            AgentEvent::RunSuspended { run_id, call_id, reason, timestamp } => {
                self.with_trace(run_id, *timestamp, |t| {
                    t.spans
                        .push(Span::new(SpanKind::Suspension, reason.clone(), *timestamp).with_call_id(call_id.clone()));
                });
            }
            AgentEvent::RunTerminated {
                run_id,
                outcome,
                reason,
                iterations,
                tokens_used,
                timestamp,
            } => {
                self.with_trace(run_id, *timestamp, |t| {
                    t.iterations = *iterations;
                    t.tokens_used = *tokens_used;
                    t.outcome = Some(outcome.clone());
                    t.reason = reason.clone();
                    t.ended_at = Some(*timestamp);
                    for span in t.spans.iter_mut().filter(|s| s.is_open()) {
                        span.end(*timestamp, false);
                    }
                });
            }
            AgentEvent::PlanStepTransition { plan_id, step_id, to, timestamp, .. } => {
                self.with_trace(plan_id, *timestamp, |t| match to.as_str() {
                    "running" => t.spans.push(Span::new(SpanKind::PlanStep, step_id.clone(), *timestamp)),
                    "completed" | "failed" => {
                        if let Some(span) = t.open_span_mut(SpanKind::PlanStep, step_id) {
                            span.end(*timestamp, to == "completed");
                        }
                    }
                    _ => {}
                });
            }
        }
    }

    /// Run `f` on the trace for `run_id`, creating it if needed. Events
    /// without a run id are ignored.
    fn with_trace(&self, run_id: &str, timestamp: chrono::DateTime<chrono::Utc>, f: impl FnOnce(&mut RunTrace)) {
        if run_id.is_empty() {
            return;
        }
        let mut traces = self.traces.write().unwrap();
        if !traces.contains_key(run_id) {
            let mut order = self.order.write().unwrap();
            while order.len() >= self.max_traces {
                if let Some(oldest) = order.pop_front() {
                    traces.remove(&oldest);
                }
            }
            order.push_back(run_id.to_string());
            traces.insert(run_id.to_string(), RunTrace::new(run_id, timestamp));
        }
        if let Some(trace) = traces.get_mut(run_id) {
            // A suspended run that resumes keeps its suspension span open
            // until the next event for that run arrives.
            if let Some(span) = trace.spans.iter_mut().rev().find(|s| s.kind == SpanKind::Suspension && s.is_open()) {
                span.end(timestamp, true);
            }
            f(trace);
        }
    }

    pub fn get(&self, run_id: &str) -> Option<RunTrace> {
        self.traces.read().unwrap().get(run_id).cloned()
    }

    /// The `limit` most recently started traces, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RunTrace> {
        let traces = self.traces.read().unwrap();
        self.order
            .read()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| traces.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.traces.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize one trace as pretty JSON.
    pub fn export(&self, run_id: &str) -> Result<String, TelemetryError> {
        let trace = self
            .get(run_id)
            .ok_or_else(|| TelemetryError::UnknownRun(run_id.to_string()))?;
        Ok(serde_json::to_string_pretty(&trace)?)
    }
}
