//! Data model for run traces and their spans.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Span ──────────────────────────────────────────────────────────────────

/// The kind of work a span represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// A gateway call (agent turn, repair or summary).
    ModelCall,
    /// A tool execution.
    ToolExecution,
    /// An argument repair attempt.
    Repair,
    /// A context compaction.
    Compaction,
    /// Time spent waiting for the user.
    Suspension,
    /// One plan step from Running to Completed or Failed.
    PlanStep,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelCall => write!(f, "model_call"),
            Self::ToolExecution => write!(f, "tool_execution"),
            Self::Repair => write!(f, "repair"),
            Self::Compaction => write!(f, "compaction"),
            Self::Suspension => write!(f, "suspension"),
            Self::PlanStep => write!(f, "plan_step"),
        }
    }
}

/// A single traced unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub kind: SpanKind,
    /// Tool name, call purpose or step id
    pub label: String,
    /// Tool call the span belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Span {
    pub fn new(kind: SpanKind, label: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            call_id: None,
            started_at,
            ended_at: None,
            duration_ms: None,
            tokens: None,
            success: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// A span that finished at `ended_at` after `duration_ms`.
    pub fn completed(kind: SpanKind, label: impl Into<String>, ended_at: DateTime<Utc>, duration_ms: u64) -> Self {
        let started_at = ended_at - Duration::milliseconds(duration_ms as i64);
        let mut span = Self::new(kind, label, started_at);
        span.ended_at = Some(ended_at);
        span.duration_ms = Some(duration_ms);
        span
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Close the span at `ended_at`.
    pub fn end(&mut self, ended_at: DateTime<Utc>, success: bool) {
        self.ended_at = Some(ended_at);
        self.duration_ms = Some(
            ended_at
                .signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.success = Some(success);
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

// ── Trace ─────────────────────────────────────────────────────────────────

/// A risk gate decision for one tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskRecord {
    pub call_id: String,
    pub tool_name: String,
    pub level: String,
    pub decision: String,
}

/// Everything observed about one agent run (or one plan).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTrace {
    /// Run id, or plan id for plan traces
    pub run_id: String,
    pub spans: Vec<Span>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_decisions: Vec<RiskRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub iterations: u32,
    pub tokens_used: u64,
    /// `answer` or `failed` once the run terminates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunTrace {
    pub fn new(run_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            spans: Vec::new(),
            risk_decisions: Vec::new(),
            started_at,
            ended_at: None,
            iterations: 0,
            tokens_used: 0,
            outcome: None,
            reason: None,
        }
    }

    pub fn spans_of(&self, kind: SpanKind) -> impl Iterator<Item = &Span> {
        self.spans.iter().filter(move |s| s.kind == kind)
    }

    /// The most recent open span of `kind` for `call_id` (or label).
    pub fn open_span_mut(&mut self, kind: SpanKind, key: &str) -> Option<&mut Span> {
        self.spans.iter_mut().rev().find(|s| {
            s.kind == kind && s.is_open() && (s.call_id.as_deref() == Some(key) || s.label == key)
        })
    }

    /// The latest risk decision recorded for `call_id`.
    pub fn risk_decision(&self, call_id: &str) -> Option<&RiskRecord> {
        self.risk_decisions.iter().rev().find(|r| r.call_id == call_id)
    }

    pub fn model_call_count(&self) -> usize {
        self.spans_of(SpanKind::ModelCall).count()
    }

    pub fn tool_execution_count(&self) -> usize {
        self.spans_of(SpanKind::ToolExecution).count()
    }

    pub fn failed_tool_count(&self) -> usize {
        self.spans_of(SpanKind::ToolExecution)
            .filter(|s| s.success == Some(false))
            .count()
    }

    /// Tokens recorded on spans. Differs from `tokens_used` only while the
    /// run is still going.
    pub fn span_tokens(&self) -> u64 {
        self.spans.iter().filter_map(|s| s.tokens).sum()
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_span_backdates_start() {
        let end = Utc::now();
        let span = Span::completed(SpanKind::ModelCall, "agent", end, 250);
        assert_eq!(span.duration_ms, Some(250));
        assert_eq!((end - span.started_at).num_milliseconds(), 250);
        assert!(!span.is_open());
    }

    #[test]
    fn open_span_is_found_by_call_id() {
        let now = Utc::now();
        let mut trace = RunTrace::new("r1", now);
        trace
            .spans
            .push(Span::new(SpanKind::ToolExecution, "ping", now).with_call_id("c1"));
        trace
            .spans
            .push(Span::new(SpanKind::ToolExecution, "ping", now).with_call_id("c2"));

        let span = trace.open_span_mut(SpanKind::ToolExecution, "c1").unwrap();
        span.end(now + Duration::milliseconds(40), false);

        assert_eq!(trace.tool_execution_count(), 2);
        assert_eq!(trace.failed_tool_count(), 1);
        assert!(trace.open_span_mut(SpanKind::ToolExecution, "c1").is_none());
    }

    #[test]
    fn serializes_without_empty_fields() {
        let span = Span::new(SpanKind::Repair, "check_status", Utc::now());
        let json = serde_json::to_value(&span).unwrap();
        assert_eq!(json["kind"], "repair");
        assert!(json.get("metadata").is_none());
        assert!(json.get("ended_at").is_none());
    }
}
