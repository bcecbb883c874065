//! Control commands: `help`, `tools`, `tool.describe`, `quit`, `done`, `debug`.
//!
//! `quit`, `done` and `debug` do nothing themselves; their fixed stdout is the
//! signal the session reacts to.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tapeloop_core::error::ToolError;
use tapeloop_core::provider::ToolDefinition;
use tapeloop_core::tool::{Tool, ToolResult};

use crate::args;

const HELP_TEXT: &str = "\
Commands use a leading comma or dollar:
  ,help                     show this help
  ,tools                    list available tools
  ,tool name=<tool>         describe one tool
  ,tape                     tape summary (tape.info)
  ,tape.search query=<q>    search the tape
  ,tape.anchors             list anchors
  ,tape.handoff name=<n>    create a handoff anchor
  ,tape.reset archive=true  archive and clear the tape
  ,memory                   show stored memory
  ,memory.save <text>       replace long-term memory
  ,memory.daily <text>      append to today's notes
  ,quit                     exit the session
Any other comma line runs as a shell command, e.g. ,git status
In model output, actions are written as $name key=value.";

fn no_args_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

pub struct HelpTool;

#[async_trait]
impl Tool for HelpTool {
    fn name(&self) -> &str {
        "help"
    }

    fn description(&self) -> &str {
        "Show command usage."
    }

    fn parameters_schema(&self) -> Value {
        no_args_schema()
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::ok(HELP_TEXT))
    }
}

/// A tool whose only job is to print a fixed signal word.
pub struct SignalTool {
    name: &'static str,
    description: &'static str,
    signal: &'static str,
}

impl SignalTool {
    /// Ends the session.
    pub fn quit() -> Self {
        Self {
            name: "quit",
            description: "Exit the session.",
            signal: "exit",
        }
    }

    /// Stops the current agent loop but keeps the session.
    pub fn done() -> Self {
        Self {
            name: "done",
            description: "Finish the current task and stop the agent loop.",
            signal: "done",
        }
    }

    pub fn debug() -> Self {
        Self {
            name: "debug",
            description: "Toggle debug display in the front end.",
            signal: "toggle",
        }
    }
}

#[async_trait]
impl Tool for SignalTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn parameters_schema(&self) -> Value {
        no_args_schema()
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::ok(self.signal))
    }
}

/// Lists every registered tool.
pub struct ToolsTool {
    catalog: Arc<Vec<ToolDefinition>>,
}

impl ToolsTool {
    pub fn new(catalog: Arc<Vec<ToolDefinition>>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Tool for ToolsTool {
    fn name(&self) -> &str {
        "tools"
    }

    fn description(&self) -> &str {
        "List available tools."
    }

    fn parameters_schema(&self) -> Value {
        no_args_schema()
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
        let lines: Vec<String> = self
            .catalog
            .iter()
            .map(|d| format!("{}: {}", d.name, d.description))
            .collect();
        Ok(ToolResult::ok(lines.join("\n")))
    }
}

pub struct ToolDescribeTool {
    catalog: Arc<Vec<ToolDefinition>>,
}

impl ToolDescribeTool {
    pub fn new(catalog: Arc<Vec<ToolDefinition>>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Tool for ToolDescribeTool {
    fn name(&self) -> &str {
        "tool.describe"
    }

    fn description(&self) -> &str {
        "Show the description and parameters of one tool."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Tool name" }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let name = args::required(&arguments, "name")?;
        let def = self
            .catalog
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ToolError::NotFound(name.clone()))?;
        let params = serde_json::to_string_pretty(&def.parameters).unwrap_or_else(|_| "{}".into());
        Ok(ToolResult::ok(format!(
            "name: {}\ndescription: {}\nparameters: {}",
            def.name, def.description, params
        )))
    }
}
