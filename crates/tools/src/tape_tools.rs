//! Tape tools: inspect, search, hand off, and reset the session tape.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tapeloop_core::error::ToolError;
use tapeloop_core::tool::{Tool, ToolResult};
use tapeloop_tape::{EntryKind, MemoryZone, TapeEntry, TapeService};
use tracing::info;

use crate::args;

fn render_entry(entry: &TapeEntry) -> String {
    format!("#{} {} {}", entry.id, entry.kind, Value::Object(entry.payload.clone()))
}

fn render_entries(entries: &[TapeEntry], empty: &str) -> String {
    if entries.is_empty() {
        return empty.to_string();
    }
    entries.iter().map(render_entry).collect::<Vec<_>>().join("\n")
}

pub struct TapeInfoTool {
    tape: TapeService,
}

impl TapeInfoTool {
    pub fn new(tape: TapeService) -> Self {
        Self { tape }
    }
}

#[async_trait]
impl Tool for TapeInfoTool {
    fn name(&self) -> &str {
        "tape.info"
    }

    fn description(&self) -> &str {
        "Summarize the session tape: entry count, anchors, last anchor."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
        let info = self.tape.info().await?;
        let text = format!(
            "tape={} entries={} anchors={} last_anchor={}",
            info.name,
            info.entries,
            info.anchors,
            info.last_anchor.as_deref().unwrap_or("-")
        );
        let data = serde_json::to_value(&info).unwrap_or(Value::Null);
        Ok(ToolResult::ok(text).with_data(data))
    }
}

pub struct TapeSearchTool {
    tape: TapeService,
}

impl TapeSearchTool {
    pub fn new(tape: TapeService) -> Self {
        Self { tape }
    }
}

#[async_trait]
impl Tool for TapeSearchTool {
    fn name(&self) -> &str {
        "tape.search"
    }

    fn description(&self) -> &str {
        "Search tape entries for a case-insensitive substring."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Text to look for" },
                "limit": { "type": "integer", "description": "Maximum matches (default 20)" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let query = args::required(&arguments, "query")?;
        let limit = args::number(&arguments, "limit", 20)? as usize;
        let hits = self.tape.search(&query, limit).await?;
        Ok(ToolResult::ok(render_entries(&hits, "(no matches)")))
    }
}

pub struct TapeAnchorsTool {
    tape: TapeService,
}

impl TapeAnchorsTool {
    pub fn new(tape: TapeService) -> Self {
        Self { tape }
    }
}

#[async_trait]
impl Tool for TapeAnchorsTool {
    fn name(&self) -> &str {
        "tape.anchors"
    }

    fn description(&self) -> &str {
        "List recent anchors with their state."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Maximum anchors (default 50)" }
            }
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let limit = args::number(&arguments, "limit", 50)? as usize;
        let anchors = self.tape.anchors(limit).await?;
        if anchors.is_empty() {
            return Ok(ToolResult::ok("(no anchors)"));
        }
        let lines: Vec<String> = anchors
            .iter()
            .map(|a| format!("{} state={}", a.name, Value::Object(a.state.clone())))
            .collect();
        Ok(ToolResult::ok(lines.join("\n")))
    }
}

pub struct TapeHandoffTool {
    tape: TapeService,
}

impl TapeHandoffTool {
    pub fn new(tape: TapeService) -> Self {
        Self { tape }
    }
}

#[async_trait]
impl Tool for TapeHandoffTool {
    fn name(&self) -> &str {
        "tape.handoff"
    }

    fn description(&self) -> &str {
        "Create a handoff anchor; model context restarts after it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Anchor name (default 'handoff')" },
                "summary": { "type": "string", "description": "What was done so far" },
                "next_steps": { "type": "string", "description": "What should happen next" }
            }
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let name = args::string(&arguments, "name").unwrap_or_else(|| "handoff".into());
        let mut state = serde_json::Map::new();
        if let Some(summary) = args::string(&arguments, "summary") {
            state.insert("summary".into(), Value::String(summary));
        }
        if let Some(next) = args::string(&arguments, "next_steps") {
            state.insert("next_steps".into(), Value::String(next));
        }
        self.tape.handoff(&name, Value::Object(state)).await?;
        info!(tape = self.tape.name(), anchor = %name, "tape.handoff");
        Ok(ToolResult::ok(format!("handoff created: {name}")))
    }
}

/// Clears the tape. Memory lives on the tape, so the zone is re-created empty.
pub struct TapeResetTool {
    tape: TapeService,
    memory: Arc<MemoryZone>,
}

impl TapeResetTool {
    pub fn new(tape: TapeService, memory: Arc<MemoryZone>) -> Self {
        Self { tape, memory }
    }
}

#[async_trait]
impl Tool for TapeResetTool {
    fn name(&self) -> &str {
        "tape.reset"
    }

    fn description(&self) -> &str {
        "Clear the session tape, optionally archiving it first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "archive": { "type": "boolean", "description": "Archive before clearing" }
            }
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let result = self.tape.reset(args::flag(&arguments, "archive")).await?;
        self.memory.ensure_fresh().await?;
        Ok(ToolResult::ok(result))
    }
}

pub struct TapeReadTool {
    tape: TapeService,
}

impl TapeReadTool {
    pub fn new(tape: TapeService) -> Self {
        Self { tape }
    }
}

fn parse_kinds(raw: Option<String>) -> Result<Vec<EntryKind>, ToolError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| {
            serde_json::from_value(Value::String(k.to_string()))
                .map_err(|_| ToolError::InvalidArguments(format!("unknown entry kind '{k}'")))
        })
        .collect()
}

#[async_trait]
impl Tool for TapeReadTool {
    fn name(&self) -> &str {
        "tape.read"
    }

    fn description(&self) -> &str {
        "Read entries after an anchor, between two anchors, or since the last anchor."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "from": { "type": "string", "description": "Start anchor name" },
                "to": { "type": "string", "description": "End anchor name" },
                "kinds": { "type": "string", "description": "Comma-separated entry kinds" }
            }
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let kinds = parse_kinds(args::string(&arguments, "kinds"))?;
        let from = args::string(&arguments, "from");
        let to = args::string(&arguments, "to");
        let entries = match (from, to) {
            (Some(from), Some(to)) => self.tape.between_anchors(&from, &to, &kinds).await?,
            (Some(from), None) => self.tape.after_anchor(&from, &kinds).await?,
            (None, _) => self.tape.from_last_anchor(&kinds).await?,
        };
        Ok(ToolResult::ok(render_entries(&entries, "(no entries)")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapeloop_tape::InMemoryTapeStore;

    async fn tape() -> TapeService {
        let tape = TapeService::new(Arc::new(InMemoryTapeStore::new()), "t");
        tape.ensure_bootstrap_anchor().await.unwrap();
        tape
    }

    #[tokio::test]
    async fn info_reports_bootstrap_anchor() {
        let out = TapeInfoTool::new(tape().await).execute(json!({})).await.unwrap();
        assert_eq!(out.output, "tape=t entries=1 anchors=1 last_anchor=session/start");
    }

    #[tokio::test]
    async fn search_finds_messages() {
        let tape = tape().await;
        tape.record_user_message("hello there").await.unwrap();
        let tool = TapeSearchTool::new(tape);

        let out = tool.execute(json!({"query": "HELLO"})).await.unwrap().output;
        assert!(out.starts_with("#2 message"));
        let none = tool.execute(json!({"query": "absent"})).await.unwrap().output;
        assert_eq!(none, "(no matches)");
    }

    #[tokio::test]
    async fn handoff_then_anchors() {
        let tape = tape().await;
        TapeHandoffTool::new(tape.clone())
            .execute(json!({"name": "phase-1", "summary": "done reading"}))
            .await
            .unwrap();
        let out = TapeAnchorsTool::new(tape).execute(json!({})).await.unwrap().output;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("phase-1 state="));
        assert!(lines[1].contains("done reading"));
    }

    #[tokio::test]
    async fn reset_rebootstraps_and_recreates_memory() {
        let tape = tape().await;
        let memory = Arc::new(MemoryZone::new(tape.clone()));
        memory.save_long_term("keep me").await.unwrap();

        let out = TapeResetTool::new(tape.clone(), Arc::clone(&memory))
            .execute(json!({}))
            .await
            .unwrap();
        assert_eq!(out.output, "ok");
        let snapshot = memory.read().await.unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.version, 1);
        assert!(tape.info().await.unwrap().anchors >= 1);
    }

    #[tokio::test]
    async fn read_filters_by_kind() {
        let tape = tape().await;
        tape.record_user_message("one").await.unwrap();
        tape.append_event("note", json!({})).await.unwrap();
        let tool = TapeReadTool::new(tape);

        let out = tool.execute(json!({"kinds": "event"})).await.unwrap().output;
        assert_eq!(out.lines().count(), 1);
        assert!(out.contains(" event "));
        assert!(tool.execute(json!({"kinds": "bogus"})).await.is_err());
    }
}
