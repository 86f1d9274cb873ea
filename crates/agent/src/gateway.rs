//! Model gateway: the single door through which the runtime calls a model.
//!
//! Wraps a [`Provider`] with the guarantees the loop depends on:
//! input transcripts end on a User or Tool turn, every attempt runs under a
//! sub-deadline clipped to the run deadline, transient failures are retried
//! with exponential backoff, and every response is normalized to exactly one
//! assistant message that carries either text or tool calls.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agentloom_config::ModelConfig;
use agentloom_core::error::ProviderError;
use agentloom_core::message::{Message, Role};
use agentloom_core::provider::{DecodingParams, Provider, ProviderRequest, ToolDefinition};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::token::{HeuristicCounter, TokenCounter};

/// Failures surfaced by [`ModelGateway::complete`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("transcript must end with a user or tool message")]
    InvalidTranscript,

    #[error("run deadline expired before the model answered")]
    DeadlineExpired,

    #[error("{source} (after {attempts} attempt(s))")]
    Provider { source: ProviderError, attempts: u32 },
}

/// A normalized model answer plus what it cost.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub message: Message,
    /// Tokens charged for this call
    pub tokens: u64,
    /// `tokens` is an estimate because the provider reported no usage
    pub estimated: bool,
    pub attempts: u32,
    pub model: String,
}

/// Retry and timeout policy for model calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Sub-deadline for a single attempt
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    ///
    /// `base * 2^attempt`, capped at `max_delay`, but never shorter than a
    /// server-requested `retry_after`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        retry_after.map_or(exp, |ra| ra.max(exp))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ModelConfig::default())
    }
}

pub struct ModelGateway {
    provider: Arc<dyn Provider>,
    model: String,
    policy: RetryPolicy,
    counter: Arc<dyn TokenCounter>,
}

impl ModelGateway {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            policy: RetryPolicy::default(),
            counter: Arc::new(HeuristicCounter),
        }
    }

    pub fn from_config(provider: Arc<dyn Provider>, config: &ModelConfig) -> Self {
        Self::new(provider, config.name.clone()).with_retry_policy(RetryPolicy::from_config(config))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Counter used to estimate cost when the provider reports no usage.
    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Send `transcript` to the model and return one normalized assistant message.
    pub async fn complete(
        &self,
        transcript: &[Message],
        tools: &[ToolDefinition],
        params: &DecodingParams,
        deadline: Option<Instant>,
    ) -> Result<GatewayResponse, GatewayError> {
        match transcript.last() {
            Some(last) if matches!(last.role, Role::User | Role::Tool) => {}
            _ => return Err(GatewayError::InvalidTranscript),
        }

        let request = ProviderRequest {
            model: self.model.clone(),
            messages: transcript.to_vec(),
            tools: tools.to_vec(),
            params: params.clone(),
        };

        let mut attempt: u32 = 0;
        loop {
            let timeout = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(GatewayError::DeadlineExpired);
                    }
                    (d - now).min(self.policy.call_timeout)
                }
                None => self.policy.call_timeout,
            };

            let result = match tokio::time::timeout(timeout, self.provider.complete(request.clone())).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(format!(
                    "no response within {}ms",
                    timeout.as_millis()
                ))),
            };

            let error = match result.and_then(|response| {
                let usage = response.usage;
                let model = response.model.clone();
                normalize(response.message).map(|message| (message, usage, model))
            }) {
                Ok((message, usage, model)) => {
                    let (tokens, estimated) = match usage {
                        Some(u) => (u64::from(u.total_tokens), false),
                        None => {
                            let prompt = self.counter.count_messages(transcript);
                            let completion = self.counter.count_message(&message);
                            ((prompt + completion) as u64, true)
                        }
                    };
                    debug!(
                        provider = self.provider.name(),
                        model = %model,
                        tokens,
                        attempts = attempt + 1,
                        tool_calls = message.tool_calls.len(),
                        "Model call completed"
                    );
                    return Ok(GatewayResponse {
                        message,
                        tokens,
                        estimated,
                        attempts: attempt + 1,
                        model,
                    });
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= self.policy.max_retries {
                warn!(
                    provider = self.provider.name(),
                    attempts = attempt + 1,
                    error = %error,
                    "Model call failed"
                );
                return Err(GatewayError::Provider {
                    source: error,
                    attempts: attempt + 1,
                });
            }

            let delay = self.policy.delay_for(attempt, error.retry_after());
            if let Some(d) = deadline {
                if Instant::now() + delay >= d {
                    return Err(GatewayError::DeadlineExpired);
                }
            }
            warn!(
                provider = self.provider.name(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient model error, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Enforce the one-message, text-xor-tool-calls output shape.
fn normalize(mut message: Message) -> Result<Message, ProviderError> {
    if message.role != Role::Assistant {
        return Err(ProviderError::MalformedResponse(format!(
            "expected an assistant message, got {:?}",
            message.role
        )));
    }

    if message.tool_calls.is_empty() {
        if message.content.as_deref().is_none_or(|c| c.trim().is_empty()) {
            return Err(ProviderError::MalformedResponse(
                "assistant message has neither content nor tool calls".into(),
            ));
        }
        return Ok(message);
    }

    // Tool calls win over text.
    message.content = None;

    let taken: HashSet<String> = message
        .tool_calls
        .iter()
        .filter(|c| !c.id.trim().is_empty())
        .map(|c| c.id.clone())
        .collect();
    let mut seen = HashSet::new();
    for (index, call) in message.tool_calls.iter_mut().enumerate() {
        if call.name.trim().is_empty() {
            return Err(ProviderError::MalformedResponse(format!(
                "tool call #{index} has no name"
            )));
        }
        if call.id.trim().is_empty() {
            let mut id = format!("call_{index}");
            while taken.contains(&id) || seen.contains(&id) {
                id.push('_');
            }
            call.id = id;
        }
        if !seen.insert(call.id.clone()) {
            return Err(ProviderError::MalformedResponse(format!(
                "duplicate tool call id '{}'",
                call.id
            )));
        }
    }
    Ok(message)
}
