//! Memory tools over the session's [`MemoryZone`].

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Value, json};
use std::sync::Arc;
use tapeloop_core::error::ToolError;
use tapeloop_core::tool::{Tool, ToolResult};
use tapeloop_tape::MemoryZone;

use crate::args;

pub struct MemorySaveTool {
    memory: Arc<MemoryZone>,
}

impl MemorySaveTool {
    pub fn new(memory: Arc<MemoryZone>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemorySaveTool {
    fn name(&self) -> &str {
        "memory.save"
    }

    fn description(&self) -> &str {
        "Replace long-term memory. Content is stored verbatim; include anything worth keeping."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Full long-term memory text" }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let content = args::required(&arguments, "content")?;
        let snapshot = self.memory.save_long_term(&content).await?;
        Ok(ToolResult::ok("saved to long-term memory").with_data(json!({ "version": snapshot.version })))
    }
}

pub struct MemoryDailyTool {
    memory: Arc<MemoryZone>,
}

impl MemoryDailyTool {
    pub fn new(memory: Arc<MemoryZone>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryDailyTool {
    fn name(&self) -> &str {
        "memory.daily"
    }

    fn description(&self) -> &str {
        "Append to today's (or the given date's) daily notes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Note text" },
                "date": { "type": "string", "description": "YYYY-MM-DD (default today)" }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let content = args::required(&arguments, "content")?;
        let date = match args::string(&arguments, "date") {
            Some(raw) => Some(
                NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                    .map_err(|_| ToolError::InvalidArguments(format!("invalid date '{raw}', expected YYYY-MM-DD")))?,
            ),
            None => None,
        };
        self.memory.append_daily(&content, date).await?;
        let label = date.map(|d| d.to_string()).unwrap_or_else(|| "today".into());
        Ok(ToolResult::ok(format!("appended to daily notes ({label})")))
    }
}

pub struct MemoryRecallTool {
    memory: Arc<MemoryZone>,
}

impl MemoryRecallTool {
    pub fn new(memory: Arc<MemoryZone>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryRecallTool {
    fn name(&self) -> &str {
        "memory.recall"
    }

    fn description(&self) -> &str {
        "Recall long-term memory and recent daily notes, optionally filtered by a query."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Only lines containing this text" },
                "days": { "type": "integer", "description": "How many days of notes (default 7)" }
            }
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let query = args::text(&arguments, "query");
        let days = args::number(&arguments, "days", 7)?;
        let days = u32::try_from(days).map_err(|_| ToolError::InvalidArguments("'days' is too large".into()))?;
        Ok(ToolResult::ok(self.memory.recall(query.as_deref(), days).await?))
    }
}

pub struct MemoryClearTool {
    memory: Arc<MemoryZone>,
}

impl MemoryClearTool {
    pub fn new(memory: Arc<MemoryZone>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryClearTool {
    fn name(&self) -> &str {
        "memory.clear"
    }

    fn description(&self) -> &str {
        "Erase long-term memory and all daily notes."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
        self.memory.clear().await?;
        Ok(ToolResult::ok("memory cleared"))
    }
}

pub struct MemoryShowTool {
    memory: Arc<MemoryZone>,
}

impl MemoryShowTool {
    pub fn new(memory: Arc<MemoryZone>) -> Self {
        Self { memory }
    }
}

fn preview(text: &str, limit: usize) -> String {
    let single = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single.chars().count() <= limit {
        return single;
    }
    let cut: String = single.chars().take(limit.saturating_sub(3)).collect();
    format!("{cut}...")
}

#[async_trait]
impl Tool for MemoryShowTool {
    fn name(&self) -> &str {
        "memory.show"
    }

    fn description(&self) -> &str {
        "Show a summary of the memory zone."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
        let snap = self.memory.read().await?;
        let mut out = format!("version={}\nlong_term=", snap.version);
        if snap.long_term.is_empty() {
            out.push_str("no");
        } else {
            out.push_str(&format!("yes ({})", preview(&snap.long_term, 100)));
        }
        out.push_str(&format!("\ndaily_notes={}", snap.dailies.len()));
        if let Some(latest) = snap.dailies.first() {
            out.push_str(&format!(" (latest: {})", latest.date));
        }
        Ok(ToolResult::ok(out).with_data(serde_json::to_value(&snap).unwrap_or(Value::Null)))
    }
}
