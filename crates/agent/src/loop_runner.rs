//! The agent loop: an explicit state machine over one [`AgentRun`].
//!
//! ```text
//! AwaitingModel ──text──────────────▶ Terminal(Answer)
//!      │  ▲
//! tool calls│  │results appended
//!      ▼  │
//! ExecutingTools ──gate──▶ AwaitingConfirmation / AwaitingClarification
//!      │                          │ resume(reply)
//!      └──────────◀───────────────┘
//! any state ──budget / iterations / stall / deadline──▶ Terminal(Failure)
//! ```
//!
//! Each tool call goes through stall detection, schema validation (with one
//! repair attempt), the risk gate and finally the registry. Every call gets
//! exactly one Tool-role result before the model is asked again, and results
//! are appended in request order even when a batch runs concurrently.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use agentloom_config::{AgentConfig, AppConfig, ContextConfig};
use agentloom_core::error::{Error, SchemaError, ToolError};
use agentloom_core::event::{AgentEvent, EventBus};
use agentloom_core::message::{Message, ToolCallRequest, ToolCallResult};
use agentloom_core::provider::{DecodingParams, Provider};
use agentloom_core::tool::{ParsedArguments, RiskLevel, ToolRegistry};
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::{
    ContextManager, GatewaySummarizer, HeuristicCounter, Summarizer, TokenCounter, estimate_tool_tokens,
};
use crate::gateway::{GatewayError, ModelGateway};
use crate::repair::ArgumentRepairer;
use crate::risk::{RiskAction, RiskGate};
use crate::state::{
    AgentRun, AwaitingCall, LoopState, RunCheckpoint, RunOutcome, Suspension, SuspensionKind,
    TerminationReason,
};

/// Result of one state-machine step: `None` keeps going.
type Step = Result<Option<RunOutcome>, TerminationReason>;

/// A call that passed every gate and waits in a parallel batch.
struct Ready {
    call: ToolCallRequest,
    arguments: ParsedArguments,
}

/// Drives runs against a model gateway and a tool registry.
pub struct AgentLoop {
    gateway: Arc<ModelGateway>,
    tools: Arc<ToolRegistry>,
    risk: RiskGate,
    repairer: ArgumentRepairer,
    counter: Arc<dyn TokenCounter>,
    context_config: ContextConfig,
    params: DecodingParams,

    /// Model calls per user turn
    max_iterations: u32,

    /// Identical consecutive calls that end the run as stuck
    stall_threshold: usize,

    /// Active-time budget for one run
    run_deadline: Duration,
    tool_timeout: Duration,
    token_limit: u64,
    parallel_tools: bool,
    event_bus: Arc<EventBus>,
}

impl AgentLoop {
    pub fn new(gateway: Arc<ModelGateway>, tools: Arc<ToolRegistry>, event_bus: Arc<EventBus>) -> Self {
        let defaults = AgentConfig::default();
        Self {
            risk: RiskGate::new(tools.clone()),
            repairer: ArgumentRepairer::new(gateway.clone()),
            gateway,
            tools,
            counter: Arc::new(HeuristicCounter),
            context_config: ContextConfig::default(),
            params: DecodingParams::deterministic(),
            max_iterations: defaults.max_iterations,
            stall_threshold: defaults.stall_threshold,
            run_deadline: Duration::from_secs(defaults.run_deadline_secs),
            tool_timeout: Duration::from_secs(defaults.tool_timeout_secs),
            token_limit: defaults.token_limit,
            parallel_tools: defaults.parallel_tools,
            event_bus,
        }
    }

    /// Build a loop with every knob taken from `config`.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        event_bus: Arc<EventBus>,
    ) -> Result<Self, Error> {
        let gateway = Arc::new(ModelGateway::from_config(provider, &config.model));
        let risk = RiskGate::from_config(tools.clone(), &config.risk).map_err(|e| Error::Config {
            message: e.to_string(),
        })?;
        let params = DecodingParams {
            temperature: config.model.temperature,
            max_tokens: Some(config.model.max_tokens),
            structured_output: config.model.structured_output,
        };
        let agent = &config.agent;
        Ok(Self::new(gateway, tools, event_bus)
            .with_risk_gate(risk)
            .with_context_config(config.context.clone())
            .with_decoding_params(params)
            .with_max_iterations(agent.max_iterations)
            .with_stall_threshold(agent.stall_threshold)
            .with_run_deadline(Duration::from_secs(agent.run_deadline_secs))
            .with_tool_timeout(Duration::from_secs(agent.tool_timeout_secs))
            .with_token_limit(agent.token_limit)
            .with_parallel_tools(agent.parallel_tools))
    }

    pub fn with_risk_gate(mut self, risk: RiskGate) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_context_config(mut self, config: ContextConfig) -> Self {
        self.context_config = config;
        self
    }

    pub fn with_decoding_params(mut self, params: DecodingParams) -> Self {
        self.params = params;
        self
    }

    /// Counter used for the context window. The gateway keeps its own.
    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_stall_threshold(mut self, threshold: usize) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = deadline;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_token_limit(mut self, limit: u64) -> Self {
        self.token_limit = limit;
        self
    }

    pub fn with_parallel_tools(mut self, enabled: bool) -> Self {
        self.parallel_tools = enabled;
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn gateway(&self) -> &Arc<ModelGateway> {
        &self.gateway
    }

    // ── Public entry points ──

    /// Create a run whose transcript is `system` followed by `user`.
    pub fn start(&self, system: impl Into<String>, user: impl Into<String>) -> Result<AgentRun, Error> {
        let reserved = self.tools.definitions().iter().map(estimate_tool_tokens).sum();
        let mut context = ContextManager::new(self.context_config.clone(), self.counter.clone())
            .with_reserved_tokens(reserved);
        context.append(Message::system(system))?;
        context.append(Message::user(user))?;

        let run = AgentRun::new(context, self.token_limit);
        info!(run_id = %run.id, token_limit = self.token_limit, "Run started");
        self.event_bus.publish(AgentEvent::RunStarted {
            run_id: run.id.clone(),
            timestamp: Utc::now(),
        });
        Ok(run)
    }

    /// Start a run and drive it until it answers, suspends or fails.
    pub async fn run(&self, system: impl Into<String>, user: impl Into<String>) -> Result<AgentRun, Error> {
        let mut run = self.start(system, user)?;
        self.drive(&mut run).await;
        Ok(run)
    }

    /// Advance `run` until it reaches a suspension or terminal state.
    ///
    /// Driving a run that is already suspended or terminal returns its
    /// recorded outcome unchanged.
    pub async fn drive(&self, run: &mut AgentRun) -> RunOutcome {
        if matches!(
            run.state,
            LoopState::Terminal | LoopState::AwaitingConfirmation | LoopState::AwaitingClarification
        ) {
            return match &run.outcome {
                Some(outcome) => outcome.clone(),
                None => self.fail(
                    run,
                    TerminationReason::Internal {
                        message: format!("run is {:?} without a recorded outcome", run.state),
                    },
                ),
            };
        }

        let started = Instant::now();
        let deadline = started + self.run_deadline.saturating_sub(run.active_elapsed);

        let result = loop {
            let step = match run.state {
                LoopState::AwaitingModel => self.await_model(run, deadline).await,
                LoopState::ExecutingTools => self.execute_tools(run, deadline).await,
                state => Err(TerminationReason::Internal {
                    message: format!("cannot drive a run in state {state:?}"),
                }),
            };
            match step {
                Ok(None) => {}
                Ok(Some(outcome)) => break Ok(outcome),
                Err(reason) => break Err(reason),
            }
        };
        run.active_elapsed += started.elapsed();

        match result {
            Ok(outcome) => self.settle(run, outcome),
            Err(reason) => self.fail(run, reason),
        }
    }

    /// Feed the user's reply into a run and drive it again.
    ///
    /// - Awaiting confirmation: the reply confirms or declines the gated call.
    /// - Awaiting clarification: the reply is shown to the model after the
    ///   current batch of results.
    /// - Answered: the reply starts a new user turn in the same run.
    /// - Failed: nothing happens; the failure is returned again.
    pub async fn resume(&self, run: &mut AgentRun, reply: impl Into<String>) -> RunOutcome {
        let reply = reply.into();
        match run.state {
            LoopState::AwaitingConfirmation => match run.awaiting.as_mut() {
                Some(awaiting) => {
                    awaiting.reply = Some(Message::user_reply(reply, awaiting.call.id.clone()));
                    run.state = LoopState::ExecutingTools;
                }
                None => {
                    return self.fail(
                        run,
                        TerminationReason::Internal {
                            message: "awaiting confirmation without a pending call".into(),
                        },
                    );
                }
            },
            LoopState::AwaitingClarification => {
                let message = match run.suspension() {
                    Some(s) => Message::user_reply(reply, s.call_id.clone()),
                    None => Message::user(reply),
                };
                run.deferred.push(message);
                run.state = LoopState::ExecutingTools;
            }
            LoopState::Terminal => {
                if !matches!(run.outcome, Some(RunOutcome::Answer { .. })) {
                    return run.outcome.clone().unwrap_or_else(|| {
                        RunOutcome::Failed(TerminationReason::Internal {
                            message: "terminal run without outcome".into(),
                        })
                    });
                }
                if let Err(e) = run.context.append(Message::user(reply)) {
                    return self.fail(run, e.into());
                }
                run.iteration = 0;
                run.state = LoopState::AwaitingModel;
            }
            LoopState::ExecutingTools => run.deferred.push(Message::user(reply)),
            LoopState::AwaitingModel => {
                if let Err(e) = run.context.append(Message::user(reply)) {
                    return self.fail(run, e.into());
                }
            }
        }
        run.outcome = None;
        self.drive(run).await
    }

    /// Rebuild a run from a checkpoint taken with [`AgentRun::checkpoint`].
    pub fn restore(&self, checkpoint: RunCheckpoint) -> Result<AgentRun, Error> {
        let context = ContextManager::restore(
            checkpoint.context,
            self.context_config.clone(),
            self.counter.clone(),
        )?;
        let mut run = AgentRun::new(context, checkpoint.budget.limit());
        run.id = checkpoint.id;
        run.budget = checkpoint.budget;
        run.iteration = checkpoint.iteration;
        run.state = checkpoint.state;
        run.queue = VecDeque::from(checkpoint.queue);
        run.awaiting = checkpoint.awaiting;
        run.deferred = checkpoint.deferred;
        run.stall = checkpoint.stall;
        run.seen_call_ids = checkpoint.seen_call_ids.into_iter().collect();
        run.active_elapsed = Duration::from_millis(checkpoint.active_elapsed_ms);
        run.outcome = checkpoint.outcome;
        debug!(run_id = %run.id, state = ?run.state, "Run restored");
        Ok(run)
    }

    // ── States ──

    async fn await_model(&self, run: &mut AgentRun, deadline: Instant) -> Step {
        if Instant::now() >= deadline {
            return Err(TerminationReason::DeadlineExceeded);
        }
        if run.budget.is_exhausted() {
            return Err(budget_exceeded(run));
        }
        if run.iteration >= self.max_iterations {
            return Err(TerminationReason::MaxIterationsExceeded { max: self.max_iterations });
        }

        run.iteration += 1;
        debug!(run_id = %run.id, iteration = run.iteration, "Agent loop iteration");
        self.event_bus.publish(AgentEvent::IterationStarted {
            run_id: run.id.clone(),
            iteration: run.iteration,
            timestamp: Utc::now(),
        });

        let summarizer = GatewaySummarizer::new(&self.gateway, Some(deadline));
        let summarizer: &dyn Summarizer = &summarizer;
        if let Some(report) = run.context.compact(Some(summarizer)).await {
            run.budget.charge(report.tokens_spent);
            self.event_bus.publish(AgentEvent::ContextCompacted {
                run_id: run.id.clone(),
                strategy: report.strategy.to_string(),
                messages_removed: report.messages_removed,
                tokens_before: report.tokens_before,
                tokens_after: report.tokens_after,
                timestamp: Utc::now(),
            });
            if run.budget.is_exhausted() {
                return Err(budget_exceeded(run));
            }
        }

        let window = run.context.render();
        let definitions = self.tools.definitions();
        let started = Instant::now();
        let result = self
            .gateway
            .complete(&window, &definitions, &self.params, Some(deadline))
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let attempts = match &e {
                    GatewayError::Provider { attempts, .. } => *attempts,
                    _ => 0,
                };
                self.model_call_finished(run, 0, attempts, duration_ms, false);
                return Err(match e {
                    GatewayError::DeadlineExpired => TerminationReason::DeadlineExceeded,
                    other => TerminationReason::Gateway { message: other.to_string() },
                });
            }
        };

        run.budget.charge(response.tokens);
        self.model_call_finished(run, response.tokens, response.attempts, duration_ms, true);
        if run.budget.is_exceeded() {
            warn!(
                run_id = %run.id,
                used = run.budget.used(),
                limit = run.budget.limit(),
                "Token budget overrun, discarding model response"
            );
            return Err(budget_exceeded(run));
        }

        let mut message = response.message;
        if !message.has_tool_calls() {
            let text = message.text().to_string();
            run.context.append(message)?;
            return Ok(Some(RunOutcome::Answer { text }));
        }

        rekey_call_ids(&mut message.tool_calls, &mut run.seen_call_ids);
        let calls = message.tool_calls.clone();
        debug!(run_id = %run.id, tool_count = calls.len(), "Executing tool calls");
        run.context.append(message)?;
        run.queue.extend(calls);
        run.state = LoopState::ExecutingTools;
        Ok(None)
    }

    async fn execute_tools(&self, run: &mut AgentRun, deadline: Instant) -> Step {
        if let Some(awaiting) = run.awaiting.take() {
            match awaiting.reply.clone() {
                Some(reply) => {
                    let result = self.settle_confirmation(run, &awaiting, &reply, deadline).await;
                    run.context.append(Message::tool_result(result))?;
                    run.deferred.push(reply);
                }
                None => {
                    let suspension = self.confirmation_question(&awaiting.call, RiskLevel::Dangerous, None);
                    run.awaiting = Some(awaiting);
                    return Ok(Some(RunOutcome::Suspended(suspension)));
                }
            }
        }

        let mut batch: Vec<Ready> = Vec::new();
        while let Some(call) = run.queue.pop_front() {
            if Instant::now() >= deadline {
                return Err(TerminationReason::DeadlineExceeded);
            }

            let repetitions = run.stall.record(&call, self.stall_threshold);
            if repetitions >= self.stall_threshold {
                warn!(run_id = %run.id, tool = %call.name, repetitions, "Identical tool call repeated");
                return Err(TerminationReason::Stuck {
                    tool_name: call.name,
                    repetitions,
                });
            }

            let arguments = match self.tools.validate(&call.name, &call.arguments) {
                Ok(arguments) => arguments,
                Err(ToolError::Schema(error)) if self.only_missing_values(&call, &error) => {
                    self.flush(run, &mut batch, deadline).await?;
                    return self.clarify(run, call, error.missing_fields).map(Some);
                }
                Err(ToolError::Schema(error)) => match self.repair(run, &call, &error, deadline).await? {
                    Ok(arguments) => arguments,
                    Err(message) => {
                        self.flush(run, &mut batch, deadline).await?;
                        run.context
                            .append(Message::tool_result(ToolCallResult::error(&call.id, message)))?;
                        continue;
                    }
                },
                Err(e) => {
                    self.flush(run, &mut batch, deadline).await?;
                    run.context.append(Message::tool_result(ToolCallResult::error(
                        &call.id,
                        format!("Error: {e}"),
                    )))?;
                    continue;
                }
            };

            let confirmed = self
                .risk
                .has_confirmation(run.context.transcript().iter().chain(&run.deferred), &call.id);
            let decision = self.risk.assess(&call.name, arguments.value(), confirmed);
            self.event_bus.publish(AgentEvent::RiskAssessed {
                run_id: run.id.clone(),
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                level: decision.level,
                decision: decision.action.to_string(),
                timestamp: Utc::now(),
            });

            match decision.action {
                RiskAction::Execute => {
                    if self.parallel_tools && decision.level == RiskLevel::Safe {
                        if batch.iter().any(|r| call.arguments.contains(r.call.id.as_str())) {
                            self.flush(run, &mut batch, deadline).await?;
                        }
                        batch.push(Ready { call, arguments });
                    } else {
                        self.flush(run, &mut batch, deadline).await?;
                        let result = self.invoke(&run.id, call, arguments, deadline).await;
                        run.context.append(Message::tool_result(result))?;
                    }
                }
                RiskAction::RequireClarification => {
                    self.flush(run, &mut batch, deadline).await?;
                    return self.clarify(run, call, decision.missing_fields).map(Some);
                }
                RiskAction::RequireConfirmation => {
                    self.flush(run, &mut batch, deadline).await?;
                    let suspension = self.confirmation_question(&call, decision.level, decision.reason);
                    run.awaiting = Some(AwaitingCall {
                        arguments: arguments.value().to_string(),
                        call,
                        reply: None,
                    });
                    return Ok(Some(RunOutcome::Suspended(suspension)));
                }
            }
        }

        self.flush(run, &mut batch, deadline).await?;
        for message in std::mem::take(&mut run.deferred) {
            run.context.append(message)?;
        }
        run.state = LoopState::AwaitingModel;
        Ok(None)
    }

    // ── Tool plumbing ──

    /// Execute or decline a call the user has answered.
    async fn settle_confirmation(
        &self,
        run: &AgentRun,
        awaiting: &AwaitingCall,
        reply: &Message,
        deadline: Instant,
    ) -> ToolCallResult {
        let call = &awaiting.call;
        let confirmed = self.risk.has_confirmation([reply], &call.id);
        let arguments = match self.tools.validate(&call.name, &awaiting.arguments) {
            Ok(arguments) => arguments,
            Err(e) => return ToolCallResult::error(&call.id, format!("Error: {e}")),
        };
        let decision = self.risk.assess(&call.name, arguments.value(), confirmed);
        self.event_bus.publish(AgentEvent::RiskAssessed {
            run_id: run.id.clone(),
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            level: decision.level,
            decision: decision.action.to_string(),
            timestamp: Utc::now(),
        });

        if decision.action == RiskAction::Execute {
            info!(run_id = %run.id, tool = %call.name, "Action confirmed by user");
            self.invoke(&run.id, call.clone(), arguments, deadline).await
        } else {
            info!(run_id = %run.id, tool = %call.name, "Action declined by user");
            ToolCallResult::error(
                &call.id,
                format!("Error: declined by user (reply: {:?})", reply.text()),
            )
        }
    }

    /// One repair attempt. The inner error is the Tool-role message to
    /// append; the outer error ends the run.
    async fn repair(
        &self,
        run: &mut AgentRun,
        call: &ToolCallRequest,
        error: &SchemaError,
        deadline: Instant,
    ) -> Result<Result<ParsedArguments, String>, TerminationReason> {
        if run.budget.is_exhausted() {
            return Ok(Err(format!(
                "Error: {error}. Repair skipped: token budget exhausted."
            )));
        }

        let outcome = self.repairer.repair(&self.tools, call, error, Some(deadline)).await;
        let tokens = match &outcome {
            Ok(repaired) => repaired.tokens,
            Err(failed) => failed.tokens,
        };
        run.budget.charge(tokens);
        self.event_bus.publish(AgentEvent::ArgumentsRepaired {
            run_id: run.id.clone(),
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: outcome.is_ok(),
            timestamp: Utc::now(),
        });
        if run.budget.is_exceeded() {
            return Err(budget_exceeded(run));
        }

        Ok(match outcome {
            Ok(repaired) => {
                info!(run_id = %run.id, tool = %call.name, "Tool arguments repaired");
                Ok(repaired.arguments)
            }
            Err(failed) => {
                warn!(run_id = %run.id, tool = %call.name, reason = %failed.reason, "Argument repair failed");
                Err(format!("Error: {error}. {failed}. The tool was not executed."))
            }
        })
    }

    /// Run the pending batch concurrently and append results in request order.
    async fn flush(&self, run: &mut AgentRun, batch: &mut Vec<Ready>, deadline: Instant) -> Result<(), TerminationReason> {
        if batch.is_empty() {
            return Ok(());
        }
        let ready = std::mem::take(batch);
        let run_id = run.id.clone();
        let results = join_all(
            ready
                .into_iter()
                .map(|r| self.invoke(&run_id, r.call, r.arguments, deadline)),
        )
        .await;
        for result in results {
            run.context.append(Message::tool_result(result))?;
        }
        Ok(())
    }

    async fn invoke(
        &self,
        run_id: &str,
        call: ToolCallRequest,
        arguments: ParsedArguments,
        deadline: Instant,
    ) -> ToolCallResult {
        self.event_bus.publish(AgentEvent::ToolCallStarted {
            run_id: run_id.to_string(),
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            timestamp: Utc::now(),
        });

        let timeout = self
            .tool_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        let started = Instant::now();
        let result = self.tools.execute(&call.id, arguments, timeout).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        debug!(run_id, tool = %call.name, call_id = %call.id, is_error = result.is_error, duration_ms, "Tool call finished");
        self.event_bus.publish(AgentEvent::ToolCallFinished {
            run_id: run_id.to_string(),
            call_id: call.id,
            tool_name: call.name,
            is_error: result.is_error,
            duration_ms,
            timestamp: Utc::now(),
        });
        result
    }

    /// Arguments that name only declared parameters but leave required ones
    /// empty. Repair cannot supply values, so the user is asked instead.
    fn only_missing_values(&self, call: &ToolCallRequest, error: &SchemaError) -> bool {
        if error.malformed_json || error.missing_fields.is_empty() {
            return false;
        }
        let Ok(Value::Object(given)) = serde_json::from_str::<Value>(&call.arguments) else {
            return false;
        };
        let declared = self
            .tools
            .definition(&call.name)
            .and_then(|d| d.parameters.get("properties").and_then(Value::as_object).cloned());
        match declared {
            Some(properties) => given.keys().all(|k| properties.contains_key(k)),
            None => given.is_empty(),
        }
    }

    /// Answer the call with an error naming the missing fields and suspend.
    fn clarify(
        &self,
        run: &mut AgentRun,
        call: ToolCallRequest,
        missing_fields: Vec<String>,
    ) -> Result<RunOutcome, TerminationReason> {
        let fields = missing_fields.join(", ");
        run.context.append(Message::tool_result(ToolCallResult::error(
            &call.id,
            format!("Error: missing required parameters: {fields}. Asked the user to provide them."),
        )))?;
        Ok(RunOutcome::Suspended(Suspension {
            kind: SuspensionKind::Clarification,
            call_id: call.id,
            question: format!("To run '{}' I need: {fields}. Please provide them.", call.name),
            tool_name: call.name,
            missing_fields,
        }))
    }

    fn confirmation_question(&self, call: &ToolCallRequest, level: RiskLevel, reason: Option<String>) -> Suspension {
        let mut question = format!(
            "'{}' is a {level} action with arguments {}. Proceed? (yes/no)",
            call.name, call.arguments
        );
        if let Some(reason) = reason {
            question.push_str(&format!(" [{reason}]"));
        }
        Suspension {
            kind: SuspensionKind::Confirmation,
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            question,
            missing_fields: Vec::new(),
        }
    }

    // ── Outcomes ──

    fn settle(&self, run: &mut AgentRun, outcome: RunOutcome) -> RunOutcome {
        match &outcome {
            RunOutcome::Answer { .. } => {
                run.state = LoopState::Terminal;
                info!(
                    run_id = %run.id,
                    iterations = run.iteration,
                    tokens = run.budget.used(),
                    "Run answered"
                );
                self.event_bus.publish(AgentEvent::RunTerminated {
                    run_id: run.id.clone(),
                    outcome: "answer".into(),
                    reason: None,
                    iterations: run.iteration,
                    tokens_used: run.budget.used(),
                    timestamp: Utc::now(),
                });
            }
            RunOutcome::Suspended(suspension) => {
                run.state = match suspension.kind {
                    SuspensionKind::Confirmation => LoopState::AwaitingConfirmation,
                    SuspensionKind::Clarification => LoopState::AwaitingClarification,
                };
                info!(
                    run_id = %run.id,
                    tool = %suspension.tool_name,
                    kind = ?suspension.kind,
                    "Run suspended for user input"
                );
                self.event_bus.publish(AgentEvent::RunSuspended {
                    run_id: run.id.clone(),
                    call_id: suspension.call_id.clone(),
                    reason: format!("{:?}", suspension.kind).to_lowercase(),
                    timestamp: Utc::now(),
                });
            }
            RunOutcome::Failed(_) => run.state = LoopState::Terminal,
        }
        run.outcome = Some(outcome.clone());
        outcome
    }

    /// Close every open tool call and mark the run failed.
    fn fail(&self, run: &mut AgentRun, reason: TerminationReason) -> RunOutcome {
        run.queue.clear();
        run.awaiting = None;
        let pending = run.context.pending_calls().to_vec();
        for id in pending {
            let result = ToolCallResult::error(id, format!("Error: not executed, run terminated: {reason}"));
            if let Err(e) = run.context.append(Message::tool_result(result)) {
                warn!(run_id = %run.id, error = %e, "Could not close pending tool call");
            }
        }
        for message in std::mem::take(&mut run.deferred) {
            if let Err(e) = run.context.append(message) {
                warn!(run_id = %run.id, error = %e, "Could not append deferred message");
            }
        }

        warn!(
            run_id = %run.id,
            category = reason.category(),
            reason = %reason,
            iterations = run.iteration,
            tokens = run.budget.used(),
            "Run terminated"
        );
        self.event_bus.publish(AgentEvent::RunTerminated {
            run_id: run.id.clone(),
            outcome: "failed".into(),
            reason: Some(reason.to_string()),
            iterations: run.iteration,
            tokens_used: run.budget.used(),
            timestamp: Utc::now(),
        });
        run.state = LoopState::Terminal;
        let outcome = RunOutcome::Failed(reason);
        run.outcome = Some(outcome.clone());
        outcome
    }

    fn model_call_finished(&self, run: &AgentRun, tokens: u64, attempts: u32, duration_ms: u64, success: bool) {
        self.event_bus.publish(AgentEvent::ModelCallFinished {
            run_id: run.id.clone(),
            purpose: "agent".into(),
            tokens,
            attempts,
            duration_ms,
            success,
            timestamp: Utc::now(),
        });
    }
}

fn budget_exceeded(run: &AgentRun) -> TerminationReason {
    TerminationReason::BudgetExceeded {
        used: run.budget.used(),
        limit: run.budget.limit(),
    }
}

/// Give calls whose id was already used in this run a fresh one.
fn rekey_call_ids(calls: &mut [ToolCallRequest], seen: &mut HashSet<String>) {
    let mut taken = seen.clone();
    taken.extend(calls.iter().map(|c| c.id.clone()));
    for call in calls.iter_mut() {
        if seen.contains(&call.id) {
            let mut n = 1;
            let mut id = format!("{}_{n}", call.id);
            while taken.contains(&id) {
                n += 1;
                id = format!("{}_{n}", call.id);
            }
            debug!(old = %call.id, new = %id, "Re-keyed reused tool call id");
            taken.insert(id.clone());
            call.id = id;
        }
        seen.insert(call.id.clone());
    }
}
