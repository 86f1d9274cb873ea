//! Configuration loading, validation, and management for agentloom.
//!
//! Loads configuration from `~/.agentloom/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use agentloom_core::RiskLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.agentloom/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model gateway settings
    #[serde(default)]
    pub model: ModelConfig,

    /// Agent loop bounds
    #[serde(default)]
    pub agent: AgentConfig,

    /// Context window management
    #[serde(default)]
    pub context: ContextConfig,

    /// Risk gating and confirmation phrases
    #[serde(default)]
    pub risk: RiskConfig,

    /// Plan execution
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Built-in tool settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Logging output
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_model() -> String {
    "default".into()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_retry_delay_ms() -> u64 {
    1000
}
fn default_max_retry_delay_ms() -> u64 {
    30_000
}
fn default_call_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub name: String,

    /// Agents decode greedily unless told otherwise
    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_true")]
    pub structured_output: bool,

    /// Retries after the first attempt for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Per-attempt sub-deadline
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            structured_output: true,
            max_retries: default_max_retries(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_max_iterations() -> u32 {
    15
}
fn default_stall_threshold() -> usize {
    3
}
fn default_run_deadline_secs() -> u64 {
    600
}
fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_token_limit() -> u64 {
    200_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Identical consecutive tool calls that count as stuck
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: usize,

    /// Overall active-time deadline for one run
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: u64,

    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Token budget for one run, across every model call it makes
    #[serde(default = "default_token_limit")]
    pub token_limit: u64,

    /// Run independent Safe tool calls from one response concurrently
    #[serde(default)]
    pub parallel_tools: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            stall_threshold: default_stall_threshold(),
            run_deadline_secs: default_run_deadline_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
            token_limit: default_token_limit(),
            parallel_tools: false,
        }
    }
}

/// How the context window is brought back under budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionPolicy {
    Trim,
    Summarize,
    Adaptive,
}

fn default_context_budget() -> usize {
    8000
}
fn default_policy() -> CompactionPolicy {
    CompactionPolicy::Trim
}
fn default_keep_recent() -> usize {
    10
}
fn default_prioritize_at() -> f32 {
    0.8
}
fn default_summarize_at() -> f32 {
    0.9
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Rendered window budget in estimated tokens
    #[serde(default = "default_context_budget")]
    pub budget_tokens: usize,

    #[serde(default = "default_policy")]
    pub policy: CompactionPolicy,

    /// Messages never folded into a summary
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,

    /// Adaptive policy: prioritize above this fraction of the budget
    #[serde(default = "default_prioritize_at")]
    pub prioritize_at: f32,

    /// Adaptive policy: summarize above this fraction of the budget
    #[serde(default = "default_summarize_at")]
    pub summarize_at: f32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: default_context_budget(),
            policy: default_policy(),
            keep_recent: default_keep_recent(),
            prioritize_at: default_prioritize_at(),
            summarize_at: default_summarize_at(),
        }
    }
}

/// How an escalation rule compares an argument value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOperator {
    Contains,
    Equals,
    Matches,
}

/// Raise a tool's risk level when one of its arguments matches a pattern.
///
/// ```toml
/// [[risk.escalations]]
/// tool = "delete_*"
/// argument = "database"
/// operator = "contains"
/// value = "prod"
/// level = "dangerous"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Tool name, or a prefix ending in `*`, or `*` for every tool
    pub tool: String,

    /// Dotted path into the arguments object
    pub argument: String,

    pub operator: MatchOperator,

    pub value: String,

    pub level: RiskLevel,
}

fn default_affirmative() -> Vec<String> {
    ["yes", "y", "confirm", "confirmed", "approve", "approved", "ok", "okay", "proceed", "go ahead", "do it"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_negative() -> Vec<String> {
    ["no", "n", "cancel", "stop", "deny", "abort", "don't", "do not"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Whole replies accepted as confirmation (case-insensitive)
    #[serde(default = "default_affirmative")]
    pub affirmative: Vec<String>,

    #[serde(default = "default_negative")]
    pub negative: Vec<String>,

    #[serde(default)]
    pub escalations: Vec<EscalationConfig>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            affirmative: default_affirmative(),
            negative: default_negative(),
            escalations: vec![],
        }
    }
}

fn default_state_dir() -> PathBuf {
    AppConfig::config_dir().join("plans")
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_step_attempts() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Where plan state files are written
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Attempts per step before it is marked Failed
    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_concurrency: default_max_concurrency(),
            max_step_attempts: default_max_step_attempts(),
        }
    }
}

fn default_shell_commands() -> Vec<String> {
    ["ls", "cat", "head", "tail", "echo", "pwd", "date", "wc", "grep", "find", "git"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_max_read_bytes() -> usize {
    256 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Commands the `shell` tool may run; empty allows any
    #[serde(default = "default_shell_commands")]
    pub shell_allowed_commands: Vec<String>,

    /// Directories `file_read` may read from; empty allows any
    #[serde(default)]
    pub file_read_roots: Vec<PathBuf>,

    /// Larger files are truncated
    #[serde(default = "default_max_read_bytes")]
    pub file_read_max_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell_allowed_commands: default_shell_commands(),
            file_read_roots: Vec::new(),
            file_read_max_bytes: default_max_read_bytes(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive, e.g. `info` or `agentloom_agent=debug`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON lines instead of human-readable logs
    #[serde(default)]
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.agentloom/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `AGENTLOOM_MODEL`
    /// - `AGENTLOOM_MAX_ITERATIONS`
    /// - `AGENTLOOM_TOKEN_LIMIT`
    /// - `AGENTLOOM_LOG`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(model) = std::env::var("AGENTLOOM_MODEL") {
            self.model.name = model;
        }
        if let Ok(raw) = std::env::var("AGENTLOOM_MAX_ITERATIONS") {
            self.agent.max_iterations = parse_env("AGENTLOOM_MAX_ITERATIONS", &raw)?;
        }
        if let Ok(raw) = std::env::var("AGENTLOOM_TOKEN_LIMIT") {
            self.agent.token_limit = parse_env("AGENTLOOM_TOKEN_LIMIT", &raw)?;
        }
        if let Ok(level) = std::env::var("AGENTLOOM_LOG") {
            self.telemetry.log_level = level;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".agentloom")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ConfigError::ValidationError(
                "model.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.model.call_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "model.call_timeout_secs must be > 0".into(),
            ));
        }
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be > 0".into(),
            ));
        }
        if self.agent.stall_threshold < 2 {
            return Err(ConfigError::ValidationError(
                "agent.stall_threshold must be at least 2".into(),
            ));
        }
        if self.agent.token_limit == 0 {
            return Err(ConfigError::ValidationError(
                "agent.token_limit must be > 0".into(),
            ));
        }
        let c = &self.context;
        if !(0.0 < c.prioritize_at && c.prioritize_at <= c.summarize_at && c.summarize_at <= 1.0) {
            return Err(ConfigError::ValidationError(
                "context thresholds must satisfy 0 < prioritize_at <= summarize_at <= 1".into(),
            ));
        }
        if self.planner.max_concurrency == 0 || self.planner.max_step_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "planner.max_concurrency and planner.max_step_attempts must be > 0".into(),
            ));
        }
        if self.tools.file_read_max_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "tools.file_read_max_bytes must be > 0".into(),
            ));
        }
        for rule in &self.risk.escalations {
            if rule.tool.is_empty() || rule.argument.is_empty() {
                return Err(ConfigError::ValidationError(
                    "risk.escalations entries need a tool and an argument".into(),
                ));
            }
        }
        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{name} is not a valid number: {raw}")))
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.temperature, 0.0);
        assert_eq!(config.agent.stall_threshold, 3);
        assert!(!config.agent.parallel_tools);
        assert_eq!(config.context.policy, CompactionPolicy::Trim);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.agent.max_iterations, config.agent.max_iterations);
        assert_eq!(parsed.risk.affirmative, config.risk.affirmative);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.model.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let mut config = AppConfig::default();
        config.context.prioritize_at = 0.95;
        config.context.summarize_at = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.agent.max_iterations, 15);
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("[agent]"));
        assert!(toml_str.contains("stall_threshold"));
    }

    #[test]
    fn escalation_rules_parse_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[agent]
max_iterations = 5
parallel_tools = true

[context]
policy = "adaptive"

[[risk.escalations]]
tool = "delete_*"
argument = "database"
operator = "contains"
value = "prod"
level = "dangerous"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.agent.max_iterations, 5);
        assert!(config.agent.parallel_tools);
        assert_eq!(config.context.policy, CompactionPolicy::Adaptive);
        assert_eq!(config.risk.escalations.len(), 1);
        let rule = &config.risk.escalations[0];
        assert_eq!(rule.operator, MatchOperator::Contains);
        assert_eq!(rule.level, RiskLevel::Dangerous);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[agent\nmax_iterations = ").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn env_number_parse_failure_is_reported() {
        let err = parse_env::<u32>("AGENTLOOM_MAX_ITERATIONS", "lots").unwrap_err();
        assert!(err.to_string().contains("AGENTLOOM_MAX_ITERATIONS"));
    }
}
