//! Scripted providers for tests.
//!
//! Enabled for this crate's own tests and, through the `test-util` feature,
//! for downstream crates.

use std::collections::VecDeque;
use std::sync::Mutex;

use agentloom_core::error::ProviderError;
use agentloom_core::message::{Message, ToolCallRequest};
use agentloom_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use async_trait::async_trait;
use serde_json::Value;

/// A provider that replays a fixed script of responses and records every
/// request it receives.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(results: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::NotConfigured("script exhausted".into())))
    }
}

/// A text-only answer costing 15 tokens.
pub fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage::new(10, 5)),
        model: "mock-model".into(),
    }
}

/// A tool-call answer costing 15 tokens.
pub fn tool_call_response(calls: Vec<ToolCallRequest>) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_tool_calls(calls),
        usage: Some(Usage::new(10, 5)),
        model: "mock-model".into(),
    }
}

pub fn tool_call(id: &str, name: &str, arguments: Value) -> ToolCallRequest {
    ToolCallRequest::new(id, name, arguments.to_string())
}
