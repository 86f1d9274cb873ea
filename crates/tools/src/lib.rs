//! Built-in tool handlers for agentloom.
//!
//! - `shell`: run a command; Moderate, escalated to Dangerous for commands
//!   that mutate state
//! - `file_read`: read a text file; Safe

pub mod file_read;
pub mod shell;

use std::sync::Arc;

use agentloom_config::ToolsConfig;
use agentloom_core::error::ToolError;
use agentloom_core::tool::ToolRegistry;

pub use file_read::FileReadTool;
pub use shell::ShellTool;

/// A registry holding every built-in tool, configured from `config`.
pub fn default_registry(config: &ToolsConfig) -> Result<ToolRegistry, ToolError> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ShellTool::new(config.shell_allowed_commands.clone())))?;
    registry.register(Arc::new(
        FileReadTool::new()
            .with_roots(config.file_read_roots.clone())
            .with_max_bytes(config.file_read_max_bytes),
    ))?;
    Ok(registry)
}
