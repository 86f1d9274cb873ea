//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world.
//! The [`ToolRegistry`] owns every registered tool together with its compiled
//! parameter schema, and exposes the two-step contract the agent loop relies on:
//! `validate` turns raw model output into [`ParsedArguments`], `execute` runs the
//! handler and always yields a [`ToolCallResult`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{SchemaError, ToolError};
use crate::message::ToolCallResult;
use crate::provider::ToolDefinition;

/// How much harm a tool can do when invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Read-only, no side effects
    Safe,
    /// Reversible side effects
    Moderate,
    /// Destructive or externally visible side effects
    Dangerous,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Moderate => write!(f, "moderate"),
            Self::Dangerous => write!(f, "dangerous"),
        }
    }
}

/// What a tool handler produces on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The output content shown to the model
    pub output: String,

    /// Optional structured data, appended to the content as JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self { output: output.into(), data: None }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    fn render(self) -> String {
        match self.data {
            Some(data) if self.output.is_empty() => data.to_string(),
            Some(data) => format!("{}\n{}", self.output, data),
            None => self.output,
        }
    }
}

/// The core Tool trait.
///
/// Each tool implements this trait and is registered in the ToolRegistry.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "shell", "file_read").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Baseline risk of invoking this tool.
    fn risk_level(&self) -> RiskLevel;

    /// Keywords for catalog search.
    fn tags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Optional argument-aware risk refinement.
    ///
    /// Returning a level below `risk_level()` has no effect.
    fn assess_arguments(&self, _arguments: &Value) -> Option<RiskLevel> {
        None
    }

    /// Execute the tool with schema-validated arguments.
    async fn execute(&self, arguments: Value) -> std::result::Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
            risk_level: self.risk_level(),
            tags: self.tags(),
        }
    }
}

type BoxedHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = std::result::Result<ToolOutput, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// A tool backed by an async closure.
pub struct FunctionTool {
    name: String,
    description: String,
    schema: Value,
    risk: RiskLevel,
    tags: Vec<String>,
    handler: BoxedHandler,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        risk: RiskLevel,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<ToolOutput, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            risk,
            tags: Vec::new(),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }
    fn risk_level(&self) -> RiskLevel {
        self.risk
    }
    fn tags(&self) -> Vec<String> {
        self.tags.clone()
    }
    async fn execute(&self, arguments: Value) -> std::result::Result<ToolOutput, ToolError> {
        (self.handler)(arguments).await
    }
}

/// Arguments that passed schema validation for a specific tool.
///
/// Only [`ToolRegistry::validate`] can construct this type.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArguments {
    tool_name: String,
    value: Value,
}

impl ParsedArguments {
    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

/// Names listed under a schema's top-level `required` keyword.
pub fn required_fields(schema: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: jsonschema::Validator,
}

/// A registry of available tools.
///
/// The agent loop uses this to:
/// 1. Get tool definitions to send to the LLM
/// 2. Validate the arguments the model produced
/// 3. Execute validated calls under a timeout
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. Names must be unique and the schema must compile.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> std::result::Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::Registration(format!("duplicate tool name '{name}'")));
        }
        let validator = jsonschema::validator_for(&tool.parameters_schema())
            .map_err(|e| ToolError::Registration(format!("invalid schema for '{name}': {e}")))?;
        debug!(tool = %name, risk = %tool.risk_level(), "Registered tool");
        self.tools.insert(name, RegisteredTool { tool, validator });
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| t.tool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definition of a single tool.
    pub fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.get(name).map(|t| t.tool.to_definition())
    }

    /// Get all tool definitions (for sending to the LLM), ordered by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.tool.to_definition()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check raw model arguments against the tool's schema.
    ///
    /// Empty or whitespace-only arguments are treated as `{}`.
    pub fn validate(&self, name: &str, arguments: &str) -> std::result::Result<ParsedArguments, ToolError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let raw = if arguments.trim().is_empty() { "{}" } else { arguments };
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return Err(ToolError::Schema(SchemaError {
                    tool_name: name.to_string(),
                    violations: vec![format!("arguments are not valid JSON: {e}")],
                    missing_fields: required_fields(&entry.tool.parameters_schema()),
                    malformed_json: true,
                }));
            }
        };

        let violations: Vec<String> = entry
            .validator
            .iter_errors(&value)
            .map(|err| {
                let path = err.instance_path.to_string();
                if path.is_empty() {
                    err.to_string()
                } else {
                    format!("{path}: {err}")
                }
            })
            .collect();

        if violations.is_empty() {
            return Ok(ParsedArguments {
                tool_name: name.to_string(),
                value,
            });
        }

        let missing_fields = required_fields(&entry.tool.parameters_schema())
            .into_iter()
            .filter(|field| value.get(field).is_none_or(Value::is_null))
            .collect();

        Err(ToolError::Schema(SchemaError {
            tool_name: name.to_string(),
            violations,
            missing_fields,
            malformed_json: false,
        }))
    }

    /// Run a validated call. Never fails: handler errors, panics and
    /// timeouts all come back as `is_error` results.
    pub async fn execute(&self, call_id: &str, arguments: ParsedArguments, timeout: Duration) -> ToolCallResult {
        let name = arguments.tool_name.clone();
        let Some(tool) = self.get(&name) else {
            return ToolCallResult::error(call_id, ToolError::UnknownTool(name).to_string());
        };

        let handle = tokio::spawn(async move { tool.execute(arguments.value).await });
        let abort = handle.abort_handle();

        let outcome = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(output))) => return ToolCallResult::ok(call_id, output.render()),
            Ok(Ok(Err(e))) => e,
            Ok(Err(join_err)) if join_err.is_panic() => ToolError::Panicked {
                tool_name: name.clone(),
                reason: panic_message(join_err.into_panic()),
            },
            Ok(Err(join_err)) => ToolError::ExecutionFailed {
                tool_name: name.clone(),
                reason: join_err.to_string(),
            },
            Err(_) => {
                abort.abort();
                ToolError::Timeout {
                    tool_name: name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            }
        };

        warn!(tool = %name, call_id, error = %outcome, "Tool call failed");
        ToolCallResult::error(call_id, format!("Error: {outcome}"))
    }

    /// Keyword search over names, tags and descriptions.
    ///
    /// Name hits weigh 3, tag hits 2, description hits 1. Tools with no hits
    /// are omitted; ties break by name.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<ToolDefinition> {
        let terms: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();
        if terms.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, ToolDefinition)> = self
            .tools
            .values()
            .filter_map(|entry| {
                let def = entry.tool.to_definition();
                let name = def.name.to_lowercase();
                let description = def.description.to_lowercase();
                let tags: Vec<String> = def.tags.iter().map(|t| t.to_lowercase()).collect();
                let score: usize = terms
                    .iter()
                    .map(|term| {
                        let mut s = 0;
                        if name.contains(term.as_str()) {
                            s += 3;
                        }
                        if tags.iter().any(|t| t == term) {
                            s += 2;
                        }
                        if description.contains(term.as_str()) {
                            s += 1;
                        }
                        s
                    })
                    .sum();
                (score > 0).then_some((score, def))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
        scored.into_iter().take(top_k).map(|(_, def)| def).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A simple test tool for unit tests.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str { "echo" }
        fn description(&self) -> &str { "Echoes back the input" }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "times": { "type": "integer" }
                },
                "required": ["text"]
            })
        }
        fn risk_level(&self) -> RiskLevel { RiskLevel::Safe }
        async fn execute(&self, arguments: Value) -> std::result::Result<ToolOutput, ToolError> {
            let text = arguments["text"].as_str().unwrap_or("").to_string();
            Ok(ToolOutput::text(text))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        registry
    }

    #[test]
    fn registry_register_and_lookup() {
        let registry = registry();
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = registry();
        let err = registry.register(Arc::new(EchoTool)).unwrap_err();
        assert!(matches!(err, ToolError::Registration(_)));
    }

    #[test]
    fn registry_definitions() {
        let defs = registry().definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[0].risk_level, RiskLevel::Safe);
    }

    #[test]
    fn validate_accepts_conforming_arguments() {
        let parsed = registry().validate("echo", r#"{"text":"hi"}"#).unwrap();
        assert_eq!(parsed.tool_name(), "echo");
        assert_eq!(parsed.value()["text"], "hi");
    }

    #[test]
    fn validate_unknown_tool() {
        let err = registry().validate("nope", "{}").unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(ref n) if n == "nope"));
    }

    #[test]
    fn validate_reports_missing_required_field() {
        let err = registry().validate("echo", r#"{"txt":"hi"}"#).unwrap_err();
        let ToolError::Schema(schema) = err else {
            panic!("expected schema error");
        };
        assert_eq!(schema.missing_fields, vec!["text".to_string()]);
        assert!(!schema.malformed_json);
        assert!(!schema.violations.is_empty());
    }

    #[test]
    fn validate_reports_wrong_type() {
        let err = registry()
            .validate("echo", r#"{"text":"hi","times":"twice"}"#)
            .unwrap_err();
        let ToolError::Schema(schema) = err else {
            panic!("expected schema error");
        };
        assert!(schema.missing_fields.is_empty());
        assert!(schema.violations.iter().any(|v| v.contains("times")));
    }

    #[test]
    fn validate_reports_malformed_json() {
        let err = registry().validate("echo", r#"{"text": "hi""#).unwrap_err();
        let ToolError::Schema(schema) = err else {
            panic!("expected schema error");
        };
        assert!(schema.malformed_json);
    }

    #[test]
    fn empty_arguments_mean_empty_object() {
        let err = registry().validate("echo", "  ").unwrap_err();
        let ToolError::Schema(schema) = err else {
            panic!("expected schema error");
        };
        assert!(!schema.malformed_json);
        assert_eq!(schema.missing_fields, vec!["text".to_string()]);
    }

    #[tokio::test]
    async fn registry_execute_tool() {
        let registry = registry();
        let args = registry.validate("echo", r#"{"text":"hello world"}"#).unwrap();
        let result = registry.execute("call_1", args, Duration::from_secs(1)).await;
        assert!(!result.is_error);
        assert_eq!(result.tool_call_id, "call_1");
        assert_eq!(result.content, "hello world");
    }

    #[tokio::test]
    async fn handler_error_becomes_error_result() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(FunctionTool::new(
                "fail",
                "Always fails",
                json!({"type": "object"}),
                RiskLevel::Safe,
                |_| async {
                    Err::<ToolOutput, _>(ToolError::ExecutionFailed {
                        tool_name: "fail".into(),
                        reason: "disk on fire".into(),
                    })
                },
            )))
            .unwrap();
        let args = registry.validate("fail", "{}").unwrap();
        let result = registry.execute("call_1", args, Duration::from_secs(1)).await;
        assert!(result.is_error);
        assert!(result.content.contains("disk on fire"));
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(FunctionTool::new(
                "explode",
                "Panics",
                json!({"type": "object"}),
                RiskLevel::Safe,
                |_| async {
                    let nothing: Option<ToolOutput> = None;
                    Ok(nothing.expect("kaboom"))
                },
            )))
            .unwrap();
        let args = registry.validate("explode", "{}").unwrap();
        let result = registry.execute("call_9", args, Duration::from_secs(1)).await;
        assert!(result.is_error);
        assert!(result.content.contains("panicked"));
        assert!(result.content.contains("kaboom"));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(FunctionTool::new(
                "slow",
                "Sleeps",
                json!({"type": "object"}),
                RiskLevel::Safe,
                |_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(ToolOutput::text("done"))
                },
            )))
            .unwrap();
        let args = registry.validate("slow", "{}").unwrap();
        let result = registry.execute("call_2", args, Duration::from_millis(20)).await;
        assert!(result.is_error);
        assert!(result.content.contains("timed out"));
    }

    #[test]
    fn structured_data_is_rendered() {
        let out = ToolOutput::text("status").with_data(json!({"up": true}));
        assert_eq!(out.render(), "status\n{\"up\":true}");
    }

    #[test]
    fn search_ranks_by_keyword_overlap() {
        let mut registry = registry();
        registry
            .register(Arc::new(
                FunctionTool::new(
                    "check_status",
                    "Check whether a server is up",
                    json!({"type": "object"}),
                    RiskLevel::Safe,
                    |_| async { Ok(ToolOutput::text("up")) },
                )
                .with_tags(["server", "monitoring"]),
            ))
            .unwrap();
        registry
            .register(Arc::new(FunctionTool::new(
                "restart_server",
                "Restart a server process",
                json!({"type": "object"}),
                RiskLevel::Moderate,
                |_| async { Ok(ToolOutput::text("restarted")) },
            )))
            .unwrap();

        let hits = registry.search("server status", 5);
        assert_eq!(hits[0].name, "check_status");
        assert_eq!(hits.len(), 2);
        assert!(registry.search("weather", 5).is_empty());
        assert_eq!(registry.search("server", 1).len(), 1);
    }
}
