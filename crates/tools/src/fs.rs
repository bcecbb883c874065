//! File tools: `fs.read` and `fs.write`, resolved against the workspace.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tapeloop_core::error::ToolError;
use tapeloop_core::tool::{Tool, ToolResult};
use tracing::debug;

use crate::args;

/// Relative paths are taken from the workspace; absolute paths are used as is.
fn resolve(workspace: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// `path` by key, or the first positional word.
fn path_arg(arguments: &Value) -> Result<String, ToolError> {
    args::string(arguments, "path")
        .or_else(|| args::positional(arguments).into_iter().next())
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments("missing 'path' argument".into()))
}

pub struct FsReadTool {
    workspace: PathBuf,
}

impl FsReadTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Tool for FsReadTool {
    fn name(&self) -> &str {
        "fs.read"
    }

    fn description(&self) -> &str {
        "Read a text file, optionally a window of lines."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path, relative to the workspace" },
                "offset": { "type": "integer", "description": "First line to return (0-based)" },
                "limit": { "type": "integer", "description": "Maximum number of lines" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let raw = path_arg(&arguments)?;
        let path = resolve(&self.workspace, &raw);
        let offset = args::number(&arguments, "offset", 0)? as usize;
        let limit = match arguments.get("limit") {
            None | Some(Value::Null) => None,
            Some(_) => Some(args::number(&arguments, "limit", 0)? as usize),
        };
        debug!(path = %path.display(), offset, ?limit, "fs.read");

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::failed("fs.read", format!("{}: {e}", path.display())))?;

        if offset == 0 && limit.is_none() {
            return Ok(ToolResult::ok(content));
        }
        let lines = content.lines().skip(offset);
        let window: Vec<&str> = match limit {
            Some(n) => lines.take(n).collect(),
            None => lines.collect(),
        };
        Ok(ToolResult::ok(window.join("\n")))
    }
}

pub struct FsWriteTool {
    workspace: PathBuf,
}

impl FsWriteTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Tool for FsWriteTool {
    fn name(&self) -> &str {
        "fs.write"
    }

    fn description(&self) -> &str {
        "Write a text file, creating parent directories."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path, relative to the workspace" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let raw = path_arg(&arguments)?;
        let content = args::string(&arguments, "content")
            .ok_or_else(|| ToolError::InvalidArguments("missing 'content' argument".into()))?;
        let path = resolve(&self.workspace, &raw);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::failed("fs.write", format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, content.as_bytes())
            .await
            .map_err(|e| ToolError::failed("fs.write", format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), bytes = content.len(), "fs.write");
        Ok(ToolResult::ok(format!("wrote: {raw}")))
    }
}
