//! End-to-end scenarios for the agent loop.
//!
//! Each test wires a scripted provider, a small tool registry and a real
//! `AgentLoop`, then checks the outcome, the transcript shape and how many
//! model calls were made.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use agentloom_agent::testing::{ScriptedProvider, text_response, tool_call, tool_call_response};
use agentloom_agent::{AgentLoop, AgentRun, LoopState, ModelGateway, RunOutcome, SuspensionKind};
use agentloom_core::event::{AgentEvent, EventBus};
use agentloom_core::message::{Message, Role};
use agentloom_core::tool::{FunctionTool, RiskLevel, ToolOutput, ToolRegistry};
use serde_json::{Value, json};

// ── Fixtures ─────────────────────────────────────────────────────────────

struct Fixture {
    provider: Arc<ScriptedProvider>,
    bus: Arc<EventBus>,
    agent: AgentLoop,
    deletions: Arc<AtomicUsize>,
}

fn registry(deletions: Arc<AtomicUsize>) -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    reg.register(Arc::new(FunctionTool::new(
        "check_status",
        "Check whether a server is up",
        json!({
            "type": "object",
            "properties": { "hostname": { "type": "string" } },
            "required": ["hostname"]
        }),
        RiskLevel::Safe,
        |args: Value| async move {
            let host = args["hostname"].as_str().unwrap_or_default().to_string();
            Ok(ToolOutput::text(format!("{host}: up, load 0.42")))
        },
    )))
    .unwrap();
    reg.register(Arc::new(FunctionTool::new(
        "delete_database",
        "Permanently drop a database",
        json!({
            "type": "object",
            "properties": { "database": { "type": "string" } },
            "required": ["database"]
        }),
        RiskLevel::Dangerous,
        move |args: Value| {
            let deletions = deletions.clone();
            async move {
                deletions.fetch_add(1, Ordering::SeqCst);
                Ok(ToolOutput::text(format!("dropped {}", args["database"])))
            }
        },
    )))
    .unwrap();
    reg
}

fn fixture(responses: Vec<agentloom_core::provider::ProviderResponse>) -> Fixture {
    let provider = Arc::new(ScriptedProvider::new(responses));
    let bus = Arc::new(EventBus::default());
    let deletions = Arc::new(AtomicUsize::new(0));
    let gateway = Arc::new(ModelGateway::new(provider.clone(), "test-model"));
    let agent = AgentLoop::new(gateway, Arc::new(registry(deletions.clone())), bus.clone());
    Fixture { provider, bus, agent, deletions }
}

fn tool_messages(run: &AgentRun) -> Vec<&Message> {
    run.transcript().iter().filter(|m| m.role == Role::Tool).collect()
}

/// Every Tool message answers exactly one earlier request, once.
fn assert_no_orphans(transcript: &[Message]) {
    let mut requested = HashSet::new();
    let mut answered = HashSet::new();
    for message in transcript {
        for call in &message.tool_calls {
            assert!(requested.insert(call.id.clone()), "duplicate request id {}", call.id);
        }
        if message.role == Role::Tool {
            let id = message.tool_call_id.clone().expect("tool message without id");
            assert!(requested.contains(&id), "orphan result {id}");
            assert!(answered.insert(id.clone()), "duplicate result {id}");
        }
    }
    assert_eq!(requested, answered, "some requests never got a result");
}

// ── Scenario A: single safe tool ─────────────────────────────────────────

#[tokio::test]
async fn scenario_a_safe_tool_then_answer() {
    let f = fixture(vec![
        tool_call_response(vec![tool_call("call_1", "check_status", json!({"hostname": "web-01"}))]),
        text_response("web-01 is up."),
    ]);

    let run = f
        .agent
        .run("You are an operations assistant.", "Check server status web-01")
        .await
        .unwrap();

    assert_eq!(run.outcome(), Some(&RunOutcome::Answer { text: "web-01 is up.".into() }));
    assert_eq!(run.state(), LoopState::Terminal);
    assert_eq!(f.provider.call_count(), 2);

    let results = tool_messages(&run);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].text(), "web-01: up, load 0.42");

    // The second model call saw the tool result as its last message.
    let requests = f.provider.requests();
    let last = requests[1].messages.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert_eq!(last.tool_call_id.as_deref(), Some("call_1"));
    assert_no_orphans(run.transcript());
}

// ── Scenario B: dangerous tool needs confirmation ────────────────────────

#[tokio::test]
async fn scenario_b_dangerous_tool_waits_for_confirmation() {
    let f = fixture(vec![
        tool_call_response(vec![tool_call("call_1", "delete_database", json!({"database": "prod"}))]),
        text_response("The prod database has been dropped."),
    ]);
    let mut events = f.bus.subscribe();

    let mut run = f.agent.run("sys", "Delete prod database").await.unwrap();

    let suspension = run.suspension().cloned().expect("run should be suspended");
    assert_eq!(suspension.kind, SuspensionKind::Confirmation);
    assert_eq!(suspension.call_id, "call_1");
    assert!(suspension.question.contains("delete_database"));
    assert_eq!(run.state(), LoopState::AwaitingConfirmation);
    assert_eq!(f.deletions.load(Ordering::SeqCst), 0);
    assert_eq!(f.provider.call_count(), 1);

    let outcome = f.agent.resume(&mut run, "yes").await;
    assert_eq!(outcome.answer(), Some("The prod database has been dropped."));
    assert_eq!(f.deletions.load(Ordering::SeqCst), 1);
    assert_eq!(f.provider.call_count(), 2);

    let mut decisions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let AgentEvent::RiskAssessed { decision, .. } = event.as_ref() {
            decisions.push(decision.clone());
        }
    }
    assert_eq!(decisions, vec!["require_confirmation", "execute"]);
    assert_no_orphans(run.transcript());
}

#[tokio::test]
async fn unrelated_yes_does_not_confirm() {
    let f = fixture(vec![
        tool_call_response(vec![tool_call("call_1", "delete_database", json!({"database": "prod"}))]),
        tool_call_response(vec![tool_call("call_2", "delete_database", json!({"database": "prod"}))]),
    ]);

    // "yes" in the opening message is not a reply to any pending call.
    let run = f.agent.run("sys", "yes, delete prod database").await.unwrap();
    assert_eq!(run.state(), LoopState::AwaitingConfirmation);
    assert_eq!(f.deletions.load(Ordering::SeqCst), 0);
}

// ── Scenario C: misspelled argument is repaired ──────────────────────────

#[tokio::test]
async fn scenario_c_misspelled_key_is_repaired() {
    let f = fixture(vec![
        tool_call_response(vec![tool_call("call_1", "check_status", json!({"hostnam": "web-01"}))]),
        text_response(r#"{"hostname": "web-01"}"#),
        text_response("web-01 is up."),
    ]);

    let run = f.agent.run("sys", "Check server status web-01").await.unwrap();

    assert_eq!(run.outcome().and_then(|o| o.answer()), Some("web-01 is up."));
    // agent turn, repair, agent turn
    assert_eq!(f.provider.call_count(), 3);
    let results = tool_messages(&run);
    assert!(!results[0].is_error);
    assert_eq!(results[0].text(), "web-01: up, load 0.42");

    // The repair call carried no tool catalog.
    assert!(f.provider.requests()[1].tools.is_empty());
    assert_eq!(run.budget().used(), 45);
}

#[tokio::test]
async fn failed_repair_reports_error_and_does_not_execute() {
    let f = fixture(vec![
        tool_call_response(vec![tool_call("call_1", "delete_database", json!({"db": "orders"}))]),
        text_response(r#"{"database": "customers"}"#),
        text_response("Could not delete."),
    ]);

    let run = f.agent.run("sys", "drop orders").await.unwrap();

    assert_eq!(run.outcome().and_then(|o| o.answer()), Some("Could not delete."));
    assert_eq!(f.deletions.load(Ordering::SeqCst), 0);
    let results = tool_messages(&run);
    assert!(results[0].is_error);
    assert!(results[0].text().contains("not executed"));
}

// ── Scenario E: stall detection ──────────────────────────────────────────

#[tokio::test]
async fn scenario_e_identical_calls_are_stuck() {
    let call = |id: &str| {
        tool_call_response(vec![tool_call(id, "check_status", json!({"hostname": "web-01"}))])
    };
    let f = fixture(vec![call("c1"), call("c2"), call("c3"), text_response("never reached")]);

    let run = f.agent.run("sys", "check web-01").await.unwrap();

    let reason = run.outcome().and_then(|o| o.failure()).cloned().expect("run should fail");
    assert_eq!(reason.category(), "stuck");
    assert!(reason.to_string().starts_with("stuck"));
    assert_eq!(f.provider.call_count(), 3);

    // The third call got an error result instead of executing.
    let results = tool_messages(&run);
    assert_eq!(results.len(), 3);
    assert!(!results[1].is_error);
    assert!(results[2].is_error);
    assert_no_orphans(run.transcript());
}

// ── Limits ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn budget_reaching_limit_finishes_iteration_then_stops() {
    let f = fixture(vec![
        tool_call_response(vec![tool_call("c1", "check_status", json!({"hostname": "web-01"}))]),
        text_response("never reached"),
    ]);
    // Each scripted response costs exactly 15 tokens.
    let agent = f.agent.with_token_limit(15);

    let run = agent.run("sys", "check web-01").await.unwrap();

    let reason = run.outcome().and_then(|o| o.failure()).cloned().unwrap();
    assert_eq!(reason.category(), "budget");
    assert_eq!(run.budget().used(), 15);
    assert_eq!(f.provider.call_count(), 1);
    // The current iteration still executed its tool.
    let results = tool_messages(&run);
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_error);
}

#[tokio::test]
async fn budget_overrun_discards_response() {
    let f = fixture(vec![
        tool_call_response(vec![tool_call("c1", "check_status", json!({"hostname": "web-01"}))]),
        text_response("never reached"),
    ]);
    let agent = f.agent.with_token_limit(10);

    let run = agent.run("sys", "check web-01").await.unwrap();

    assert_eq!(run.outcome().and_then(|o| o.failure()).map(|r| r.category()), Some("budget"));
    assert!(tool_messages(&run).is_empty());
    assert_eq!(run.transcript().len(), 2);
}

#[tokio::test]
async fn max_iterations_is_a_named_failure() {
    let responses = (0..5)
        .map(|i| {
            tool_call_response(vec![tool_call(
                &format!("c{i}"),
                "check_status",
                json!({"hostname": format!("web-0{i}")}),
            )])
        })
        .collect();
    let f = fixture(responses);
    let agent = f.agent.with_max_iterations(2);

    let run = agent.run("sys", "check everything").await.unwrap();

    let reason = run.outcome().and_then(|o| o.failure()).cloned().unwrap();
    assert_eq!(reason.category(), "iterations");
    assert!(reason.to_string().contains("max iterations exceeded"));
    assert_eq!(f.provider.call_count(), 2);
    assert_no_orphans(run.transcript());
}

// ── Run deadline ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn run_deadline_caps_tool_timeout_and_is_fatal() {
    let mut reg = registry(Arc::new(AtomicUsize::new(0)));
    reg.register(Arc::new(FunctionTool::new(
        "slow_scan",
        "Scan every port on a host",
        json!({
            "type": "object",
            "properties": { "hostname": { "type": "string" } },
            "required": ["hostname"]
        }),
        RiskLevel::Safe,
        |_args: Value| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ToolOutput::text("all ports closed"))
        },
    )))
    .unwrap();

    let provider = Arc::new(ScriptedProvider::new(vec![tool_call_response(vec![
        tool_call("call_1", "slow_scan", json!({"hostname": "web-01"})),
        tool_call("call_2", "check_status", json!({"hostname": "web-01"})),
    ])]));
    let gateway = Arc::new(ModelGateway::new(provider.clone(), "test-model"));
    let agent = AgentLoop::new(gateway, Arc::new(reg), Arc::new(EventBus::default()))
        .with_tool_timeout(Duration::from_secs(30))
        .with_run_deadline(Duration::from_millis(50));

    let started = tokio::time::Instant::now();
    let run = agent.run("sys", "scan web-01").await.unwrap();

    // The tool was cut off by the run deadline, not its own 30s timeout.
    assert!(started.elapsed() < Duration::from_millis(200));

    let reason = run.outcome().and_then(|o| o.failure()).cloned().expect("run should fail");
    assert_eq!(reason.category(), "deadline");
    assert_eq!(run.state(), LoopState::Terminal);
    assert_eq!(provider.call_count(), 1);

    let results = tool_messages(&run);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|m| m.is_error));
    let first = results.iter().find(|m| m.tool_call_id.as_deref() == Some("call_1")).unwrap();
    assert!(first.text().contains("timed out"), "{}", first.text());
    assert_no_orphans(run.transcript());
}

// ── Clarification ────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_argument_asks_the_user() {
    let f = fixture(vec![
        tool_call_response(vec![tool_call("c1", "check_status", json!({}))]),
        tool_call_response(vec![tool_call("c2", "check_status", json!({"hostname": "web-07"}))]),
        text_response("web-07 is up."),
    ]);

    let mut run = f.agent.run("sys", "is my server up?").await.unwrap();

    let suspension = run.suspension().cloned().unwrap();
    assert_eq!(suspension.kind, SuspensionKind::Clarification);
    assert_eq!(suspension.missing_fields, vec!["hostname".to_string()]);
    assert_eq!(f.provider.call_count(), 1);

    let outcome = f.agent.resume(&mut run, "web-07").await;
    assert_eq!(outcome.answer(), Some("web-07 is up."));

    // The model saw the clarification after the error result.
    let requests = f.provider.requests();
    let second = &requests[1].messages;
    let n = second.len();
    assert_eq!(second[n - 2].role, Role::Tool);
    assert_eq!(second[n - 1].role, Role::User);
    assert_eq!(second[n - 1].text(), "web-07");
    assert_no_orphans(run.transcript());
}

#[tokio::test]
async fn clarification_beats_confirmation() {
    let f = fixture(vec![tool_call_response(vec![tool_call(
        "c1",
        "delete_database",
        json!({"database": ""}),
    )])]);

    let run = f.agent.run("sys", "delete it").await.unwrap();
    assert_eq!(run.state(), LoopState::AwaitingClarification);
}
