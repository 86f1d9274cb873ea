//! File read tool: read a UTF-8 text file, optionally confined to roots.

use std::path::{Path, PathBuf};

use agentloom_core::error::ToolError;
use agentloom_core::tool::{RiskLevel, Tool, ToolOutput};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

const DEFAULT_MAX_BYTES: usize = 256 * 1024;

pub struct FileReadTool {
    /// Allowed root directories. Empty = allow all.
    allowed_roots: Vec<PathBuf>,
    max_bytes: usize,
}

impl FileReadTool {
    pub fn new() -> Self {
        Self {
            allowed_roots: Vec::new(),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.allowed_roots = roots;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes.max(1);
        self
    }

    fn denied(reason: String) -> ToolError {
        ToolError::PermissionDenied {
            tool_name: "file_read".into(),
            reason,
        }
    }

    /// Resolve `path` and check it against the allowed roots.
    fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let raw = Path::new(path);
        if raw.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(Self::denied(format!("path traversal in '{path}'")));
        }
        if self.allowed_roots.is_empty() {
            return Ok(raw.to_path_buf());
        }

        let canonical = raw
            .canonicalize()
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "file_read".into(),
                reason: format!("cannot resolve '{path}': {e}"),
            })?;
        let inside = self
            .allowed_roots
            .iter()
            .filter_map(|root| root.canonicalize().ok())
            .any(|root| canonical.starts_with(root));
        if inside {
            Ok(canonical)
        } else {
            Err(Self::denied(format!("'{path}' is outside the allowed roots")))
        }
    }
}

/// At most `max` bytes, cut back to a character boundary when the limit
/// falls inside a multi-byte character.
fn truncate_utf8(bytes: &[u8], max: usize) -> &[u8] {
    if bytes.len() <= max {
        return bytes;
    }
    let head = &bytes[..max];
    match std::str::from_utf8(head) {
        // `error_len() == None`: the input ends mid-character
        Err(e) if e.error_len().is_none() => &head[..e.valid_up_to()],
        _ => head,
    }
}

impl Default for FileReadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read the contents of a text file at the given path."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Safe
    }

    fn tags(&self) -> Vec<String> {
        vec!["file".into(), "filesystem".into(), "read".into()]
    }

    async fn execute(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing 'path'".into()))?;
        let resolved = self.resolve(path)?;

        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "file_read".into(),
                reason: format!("failed to read '{path}': {e}"),
            })?;

        let total = bytes.len();
        let truncated = total > self.max_bytes;
        let content = String::from_utf8_lossy(truncate_utf8(&bytes, self.max_bytes)).into_owned();
        debug!(path = %resolved.display(), bytes = total, truncated, "File read");

        let mut output = ToolOutput::text(content);
        if truncated {
            output = output.with_data(json!({ "truncated": true, "total_bytes": total }));
        }
        Ok(output)
    }
}
