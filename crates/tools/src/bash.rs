//! Bash tool — run a shell command line in the workspace.
//!
//! Both `$bash ...` actions and bare shell actions (`$git status`,
//! `echo hi`) end up here. Supports command allowlisting, a working
//! directory override, and a timeout. A non-zero exit is an error.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tapeloop_config::ShellConfig;
use tapeloop_core::error::ToolError;
use tapeloop_core::tool::{Tool, ToolResult};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::args;

/// Execute shell commands in the workspace.
pub struct BashTool {
    workspace: PathBuf,
    timeout_secs: u64,
    /// If non-empty, only these commands are allowed.
    allowed_commands: Vec<String>,
}

impl BashTool {
    pub fn new(workspace: impl Into<PathBuf>, config: &ShellConfig) -> Self {
        Self {
            workspace: workspace.into(),
            timeout_secs: config.timeout_secs,
            allowed_commands: config.allowed_commands.clone(),
        }
    }

    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }
        let base_cmd = command.split_whitespace().next().unwrap_or("").trim();
        self.allowed_commands.iter().any(|a| a == base_cmd)
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace and return its output. Non-zero exit is an error."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "cmd": {
                    "type": "string",
                    "description": "The command line to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory (defaults to the workspace)"
                }
            },
            "required": ["cmd"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let cmd = args::required(&arguments, "cmd")?;
        if cmd.trim().is_empty() {
            return Err(ToolError::InvalidArguments("empty command".into()));
        }
        if !self.is_command_allowed(&cmd) {
            return Err(ToolError::PermissionDenied {
                tool_name: "bash".into(),
                reason: format!(
                    "command '{}' not in allowlist",
                    cmd.split_whitespace().next().unwrap_or("")
                ),
            });
        }
        let cwd = args::string(&arguments, "cwd")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.workspace.clone());

        debug!(command = %cmd, cwd = %cwd.display(), "Executing shell command");

        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", cmd.as_str()]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", cmd.as_str()]);
            c
        };
        command.current_dir(&cwd).kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), command.output())
            .await
            .map_err(|_| ToolError::Timeout {
                tool_name: "bash".into(),
                timeout_secs: self.timeout_secs,
            })?
            .map_err(|e| ToolError::failed("bash", e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %cmd, exit_code = code, "Command failed");
            let message = [&stderr, &stdout]
                .into_iter()
                .find(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| format!("exit={code}"));
            return Err(ToolError::failed("bash", format!("exit={code}: {message}")));
        }

        let text = if stdout.is_empty() { "(no output)".to_string() } else { stdout };
        Ok(ToolResult::ok(text).with_data(serde_json::json!({ "exit_code": 0 })))
    }
}
