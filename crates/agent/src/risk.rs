//! Risk gate: decides whether a validated tool call may run.
//!
//! A call's effective risk is the highest of:
//! - the level declared on its [`ToolDefinition`](agentloom_core::ToolDefinition),
//! - any configured [`EscalationRule`] whose argument pattern matches,
//! - the tool's own [`Tool::assess_arguments`](agentloom_core::Tool::assess_arguments) hook.
//!
//! Escalation only ever raises a level. Missing required parameters win over
//! everything else: an incomplete action cannot be confirmed.

use std::sync::Arc;

use agentloom_config::{EscalationConfig, MatchOperator, RiskConfig};
use agentloom_core::message::{Message, Role};
use agentloom_core::tool::{RiskLevel, ToolRegistry, required_fields};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// What the loop must do with a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    Execute,
    RequireConfirmation,
    RequireClarification,
}

impl std::fmt::Display for RiskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execute => write!(f, "execute"),
            Self::RequireConfirmation => write!(f, "require_confirmation"),
            Self::RequireClarification => write!(f, "require_clarification"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskDecision {
    pub action: RiskAction,
    /// Required parameters that were absent, null or blank
    pub missing_fields: Vec<String>,
    /// Effective level after escalation
    pub level: RiskLevel,
    /// Why the level was raised above the tool's own, if it was
    pub reason: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid escalation pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

#[derive(Debug, Clone)]
enum Matcher {
    Contains(String),
    Equals(String),
    Matches(regex_lite::Regex),
}

impl Matcher {
    fn is_match(&self, value: &Value) -> bool {
        match value {
            Value::Array(items) => items.iter().any(|v| self.is_match(v)),
            Value::Object(_) | Value::Null => false,
            other => {
                let text = match other {
                    Value::String(s) => s.clone(),
                    v => v.to_string(),
                };
                match self {
                    Self::Contains(needle) => text.to_lowercase().contains(needle),
                    Self::Equals(expected) => text == *expected,
                    Self::Matches(re) => re.is_match(&text),
                }
            }
        }
    }
}

/// Raises a tool's risk when an argument matches a pattern.
#[derive(Debug, Clone)]
pub struct EscalationRule {
    tool: String,
    path: Vec<String>,
    matcher: Matcher,
    level: RiskLevel,
    description: String,
}

impl EscalationRule {
    pub fn compile(config: &EscalationConfig) -> Result<Self, RuleError> {
        let matcher = match config.operator {
            MatchOperator::Contains => Matcher::Contains(config.value.to_lowercase()),
            MatchOperator::Equals => Matcher::Equals(config.value.clone()),
            MatchOperator::Matches => Matcher::Matches(
                regex_lite::Regex::new(&config.value).map_err(|e| RuleError::InvalidPattern {
                    pattern: config.value.clone(),
                    message: e.to_string(),
                })?,
            ),
        };
        let op = match config.operator {
            MatchOperator::Contains => "contains",
            MatchOperator::Equals => "equals",
            MatchOperator::Matches => "matches",
        };
        Ok(Self {
            tool: config.tool.clone(),
            path: config.argument.split('.').map(String::from).collect(),
            matcher,
            level: config.level,
            description: format!("{} {} {:?}", config.argument, op, config.value),
        })
    }

    fn applies_to(&self, tool_name: &str) -> bool {
        match self.tool.strip_suffix('*') {
            Some(prefix) => tool_name.starts_with(prefix),
            None => self.tool == tool_name,
        }
    }

    fn evaluate(&self, tool_name: &str, arguments: &Value) -> Option<RiskLevel> {
        if !self.applies_to(tool_name) {
            return None;
        }
        let mut current = arguments;
        for key in &self.path {
            current = current.get(key)?;
        }
        self.matcher.is_match(current).then_some(self.level)
    }
}

pub struct RiskGate {
    tools: Arc<ToolRegistry>,
    rules: Vec<EscalationRule>,
    affirmative: Vec<String>,
    negative: Vec<String>,
}

impl RiskGate {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        let defaults = RiskConfig::default();
        Self {
            tools,
            rules: Vec::new(),
            affirmative: defaults.affirmative,
            negative: defaults.negative,
        }
    }

    pub fn from_config(tools: Arc<ToolRegistry>, config: &RiskConfig) -> Result<Self, RuleError> {
        let rules = config
            .escalations
            .iter()
            .map(EscalationRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(tools)
            .with_rules(rules)
            .with_phrases(config.affirmative.clone(), config.negative.clone()))
    }

    pub fn with_rules(mut self, rules: Vec<EscalationRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_phrases(mut self, affirmative: Vec<String>, negative: Vec<String>) -> Self {
        self.affirmative = affirmative.iter().map(|p| normalize(p)).collect();
        self.negative = negative.iter().map(|p| normalize(p)).collect();
        self
    }

    /// Classify one call.
    ///
    /// Unknown tools are treated as Dangerous; the registry rejects them
    /// before they get here in normal operation.
    pub fn assess(&self, tool_name: &str, arguments: &Value, has_prior_confirmation: bool) -> RiskDecision {
        let tool = self.tools.get(tool_name);
        let base = tool.as_ref().map_or(RiskLevel::Dangerous, |t| t.risk_level());

        let mut level = base;
        let mut reason = None;
        for rule in &self.rules {
            if let Some(raised) = rule.evaluate(tool_name, arguments) {
                if raised > level {
                    level = raised;
                    reason = Some(format!("escalated by rule: {}", rule.description));
                }
            }
        }
        if let Some(raised) = tool.as_ref().and_then(|t| t.assess_arguments(arguments)) {
            if raised > level {
                level = raised;
                reason = Some("escalated by tool argument inspection".to_string());
            }
        }

        let missing_fields: Vec<String> = tool
            .as_ref()
            .map(|t| required_fields(&t.parameters_schema()))
            .unwrap_or_default()
            .into_iter()
            .filter(|field| is_blank(arguments.get(field)))
            .collect();

        let action = if !missing_fields.is_empty() {
            RiskAction::RequireClarification
        } else if level == RiskLevel::Dangerous && !has_prior_confirmation {
            RiskAction::RequireConfirmation
        } else {
            RiskAction::Execute
        };

        debug!(tool = tool_name, %level, %action, confirmed = has_prior_confirmation, "Risk assessed");
        RiskDecision { action, missing_fields, level, reason }
    }

    /// Whether a reply reads as consent.
    ///
    /// Matches a configured phrase exactly or at the start of the reply,
    /// provided no negative phrase appears anywhere in it.
    pub fn is_affirmative(&self, reply: &str) -> bool {
        let text = normalize(reply);
        if text.is_empty() || self.is_negative(reply) {
            return false;
        }
        self.affirmative.iter().any(|p| starts_with_phrase(&text, p))
    }

    pub fn is_negative(&self, reply: &str) -> bool {
        let text = normalize(reply);
        let words: Vec<&str> = text.split_whitespace().collect();
        self.negative.iter().any(|p| {
            if p.contains(' ') {
                text.contains(p.as_str())
            } else {
                words.contains(&p.as_str())
            }
        })
    }

    /// Whether `messages` contain an affirmative User reply to `call_id`.
    pub fn has_confirmation<'a>(&self, messages: impl IntoIterator<Item = &'a Message>, call_id: &str) -> bool {
        messages.into_iter().any(|m| {
            m.role == Role::User && m.reply_to.as_deref() == Some(call_id) && self.is_affirmative(m.text())
        })
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn normalize(text: &str) -> String {
    text.trim()
        .trim_matches(|c: char| c.is_ascii_punctuation() && c != '\'')
        .trim()
        .to_lowercase()
}

fn starts_with_phrase(text: &str, phrase: &str) -> bool {
    text == phrase
        || text
            .strip_prefix(phrase)
            .is_some_and(|rest| rest.starts_with(|c: char| c.is_whitespace() || c == ',' || c == '.' || c == '!'))
}
