//! Shell tool: run a command through `sh -c`.
//!
//! Baseline risk is Moderate; commands that mutate or destroy state are
//! escalated to Dangerous so the agent loop asks before running them.

use std::path::Path;

use agentloom_core::error::ToolError;
use agentloom_core::tool::{RiskLevel, Tool, ToolOutput};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{debug, warn};

/// Programs that change the system or can run arbitrary other programs.
const DESTRUCTIVE_PROGRAMS: &[&str] = &[
    "rm", "rmdir", "mv", "dd", "mkfs", "chmod", "chown", "kill", "pkill", "shutdown", "reboot",
    "sudo", "truncate", "drop", "eval", "exec", "xargs", "sh", "bash", "env",
];

/// Separators between commands in a list or pipeline.
const COMMAND_SEPARATORS: [char; 5] = ['|', ';', '&', '\n', '\r'];

pub struct ShellTool {
    /// If non-empty, only these programs may be run
    allowed_commands: Vec<String>,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        Self { allowed_commands }
    }

    /// First word of a command, without any leading directory.
    fn program(command: &str) -> &str {
        let word = command.split_whitespace().next().unwrap_or("");
        Path::new(word)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(word)
    }

    /// Programs of every segment in a pipeline or command list.
    fn programs(command: &str) -> impl Iterator<Item = &str> {
        command
            .split(COMMAND_SEPARATORS)
            .map(Self::program)
            .filter(|p| !p.is_empty())
    }

    /// Command substitution, subshells and process substitution hide
    /// programs from the per-segment check.
    fn has_nested_commands(command: &str) -> bool {
        command.contains('(') || command.contains('`')
    }

    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }
        !Self::has_nested_commands(command)
            && Self::programs(command).all(|program| self.allowed_commands.iter().any(|a| a == program))
    }

    fn is_destructive(command: &str) -> bool {
        command.contains('>')
            || Self::has_nested_commands(command)
            || Self::programs(command)
                .any(|program| program.starts_with('$') || DESTRUCTIVE_PROGRAMS.contains(&program))
            || command.contains("git push")
            || command.contains("git reset --hard")
            || command.contains("-delete")
            || command.contains("-exec")
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command and return its stdout and stderr."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Moderate
    }

    fn tags(&self) -> Vec<String> {
        vec!["command".into(), "terminal".into(), "process".into()]
    }

    fn assess_arguments(&self, arguments: &Value) -> Option<RiskLevel> {
        let command = arguments["command"].as_str()?;
        Self::is_destructive(command).then_some(RiskLevel::Dangerous)
    }

    async fn execute(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let command = arguments["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing 'command'".into()))?;

        if !self.is_command_allowed(command) {
            let reason = match Self::programs(command)
                .find(|program| !self.allowed_commands.iter().any(|a| a == program))
            {
                Some(program) => format!("'{program}' is not in the allowlist"),
                None => "nested commands are not allowed with an allowlist".to_string(),
            };
            return Err(ToolError::PermissionDenied {
                tool_name: "shell".into(),
                reason,
            });
        }

        debug!(%command, "Executing shell command");

        // The registry aborts this task on timeout; the child dies with it.
        let output = Command::new("sh")
            .args(["-c", command])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "shell".into(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            warn!(%command, exit_code = code, "Command failed");
            return Err(ToolError::ExecutionFailed {
                tool_name: "shell".into(),
                reason: format!("exit code {code}: {}", stderr.trim()),
            });
        }

        let text = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            format!("{}\n[stderr]: {}", stdout.trim(), stderr.trim())
        };
        Ok(ToolOutput::text(text).with_data(json!({ "exit_code": code })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_check() {
        let tool = ShellTool::new(vec!["ls".into(), "git".into()]);
        assert!(tool.is_command_allowed("ls -la"));
        assert!(tool.is_command_allowed("git status"));
        assert!(!tool.is_command_allowed("rm -rf /"));
        assert!(!tool.is_command_allowed("ls && rm -rf /"));
        assert!(!tool.is_command_allowed("ls\nrm -rf /"));
        assert!(!tool.is_command_allowed("ls $(rm -rf /)"));
        assert!(!tool.is_command_allowed("ls `rm -rf /`"));
        assert!(!tool.is_command_allowed("(rm -rf /)"));
        assert!(!tool.is_command_allowed("/bin/rm -rf /"));
        assert!(tool.is_command_allowed("/bin/ls -la"));
    }

    #[test]
    fn empty_allowlist_allows_all() {
        let tool = ShellTool::new(vec![]);
        assert!(tool.is_command_allowed("anything goes"));
    }

    #[test]
    fn destructive_commands_escalate() {
        let tool = ShellTool::new(vec![]);
        let assess = |cmd: &str| tool.assess_arguments(&json!({ "command": cmd }));

        assert_eq!(assess("ls -la"), None);
        assert_eq!(assess("cat notes.txt | grep todo"), None);
        assert_eq!(assess("rm -rf build"), Some(RiskLevel::Dangerous));
        assert_eq!(assess("ls && rm x"), Some(RiskLevel::Dangerous));
        assert_eq!(assess("echo hi > out.txt"), Some(RiskLevel::Dangerous));
        assert_eq!(assess("git push origin main"), Some(RiskLevel::Dangerous));
        assert_eq!(assess("ls\nrm -rf build"), Some(RiskLevel::Dangerous));
        assert_eq!(assess("echo $(rm -rf build)"), Some(RiskLevel::Dangerous));
        assert_eq!(assess("echo `rm -rf build`"), Some(RiskLevel::Dangerous));
        assert_eq!(assess("(cd build && ls)"), Some(RiskLevel::Dangerous));
        assert_eq!(assess("diff <(ls a) <(ls b)"), Some(RiskLevel::Dangerous));
        assert_eq!(assess("/bin/rm -rf build"), Some(RiskLevel::Dangerous));
        assert_eq!(assess("find . -name '*.o' -delete"), Some(RiskLevel::Dangerous));
        assert_eq!(assess("X=rm; $X -rf build"), Some(RiskLevel::Dangerous));
    }

    #[tokio::test]
    async fn newline_separated_command_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        std::fs::write(&marker, "keep").unwrap();

        let tool = ShellTool::new(vec!["ls".into()]);
        let command = format!("ls\nrm {}", marker.display());
        let result = tool.execute(json!({ "command": command })).await;

        assert!(matches!(result, Err(ToolError::PermissionDenied { .. })));
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn execute_echo() {
        let tool = ShellTool::new(vec![]);
        let output = tool.execute(json!({ "command": "echo hello" })).await.unwrap();
        assert_eq!(output.output, "hello");
        assert_eq!(output.data, Some(json!({ "exit_code": 0 })));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let tool = ShellTool::new(vec![]);
        let err = tool.execute(json!({ "command": "exit 3" })).await.unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
    }

    #[tokio::test]
    async fn blocked_command() {
        let tool = ShellTool::new(vec!["ls".into()]);
        let result = tool.execute(json!({ "command": "rm -rf /" })).await;
        assert!(matches!(result, Err(ToolError::PermissionDenied { .. })));
    }
}
