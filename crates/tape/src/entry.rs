//! Tape entry types.
//!
//! A tape is a sequence of immutable [`TapeEntry`] records. The store assigns
//! `id`; everything else is written and read back byte-for-byte.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

/// Meta key: visibility lane (`main`, `work`, `control`).
pub const META_LANE: &str = "lane";
/// Meta key: whether the entry is shown to the human.
pub const META_VIEW: &str = "view";
/// Meta key: whether the entry counts toward model context.
pub const META_CONTEXT: &str = "context";
/// Meta key: RFC 3339 timestamp set when the entry was recorded.
pub const META_TS: &str = "ts";

pub const LANE_MAIN: &str = "main";
pub const LANE_WORK: &str = "work";
pub const LANE_CONTROL: &str = "control";

/// The kind of a tape entry. Determines the payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// `{role, content}`
    Message,
    /// `{name, intent, status, stdout, stderr, exit_code, elapsed_ms, origin}`
    Command,
    /// `{calls: [...]}`
    ToolCall,
    /// `{results: [...]}`
    ToolResult,
    /// `{name, state}`
    Anchor,
    /// `{name, data}`
    Event,
    /// `{loop_id, status}`
    Loop,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Message => "message",
            EntryKind::Command => "command",
            EntryKind::ToolCall => "tool_call",
            EntryKind::ToolResult => "tool_result",
            EntryKind::Anchor => "anchor",
            EntryKind::Event => "event",
            EntryKind::Loop => "loop",
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable record on a tape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeEntry {
    /// Assigned by the store at append time; 0 until then
    pub id: u64,

    pub kind: EntryKind,

    pub payload: Map<String, Value>,

    /// A non-object `meta` on disk reads back as empty
    #[serde(default, deserialize_with = "object_or_empty")]
    pub meta: Map<String, Value>,
}

fn object_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    })
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl TapeEntry {
    pub fn new(kind: EntryKind, payload: Map<String, Value>) -> Self {
        Self {
            id: 0,
            kind,
            payload,
            meta: Map::new(),
        }
    }

    pub fn message(role: &str, content: impl Into<String>) -> Self {
        Self::new(
            EntryKind::Message,
            object(json!({ "role": role, "content": content.into() })),
        )
    }

    pub fn anchor(name: impl Into<String>, state: Value) -> Self {
        Self::new(EntryKind::Anchor, object(json!({ "name": name.into(), "state": state })))
    }

    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self::new(EntryKind::Event, object(json!({ "name": name.into(), "data": data })))
    }

    pub fn loop_status(loop_id: &str, status: &str) -> Self {
        Self::new(EntryKind::Loop, object(json!({ "loop_id": loop_id, "status": status })))
    }

    pub fn command(record: &CommandRecord) -> Self {
        Self::new(
            EntryKind::Command,
            object(json!({
                "name": record.name,
                "intent": record.intent,
                "status": record.status,
                "stdout": record.stdout,
                "stderr": record.stderr,
                "exit_code": record.exit_code,
                "elapsed_ms": record.elapsed_ms,
                "origin": record.origin,
            })),
        )
    }

    pub fn tool_calls(calls: Vec<Value>) -> Self {
        Self::new(EntryKind::ToolCall, object(json!({ "calls": calls })))
    }

    pub fn tool_results(results: Vec<Value>) -> Self {
        Self::new(EntryKind::ToolResult, object(json!({ "results": results })))
    }

    /// Set one meta key.
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    /// Merge a meta map over the existing meta.
    pub fn with_meta_map(mut self, meta: Map<String, Value>) -> Self {
        self.meta.extend(meta);
        self
    }

    /// String field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// `payload.name` for anchors, events, and commands.
    pub fn name(&self) -> Option<&str> {
        self.payload_str("name")
    }

    pub fn lane(&self) -> &str {
        self.meta.get(META_LANE).and_then(Value::as_str).unwrap_or(LANE_MAIN)
    }

    pub fn is_context(&self) -> bool {
        self.meta.get(META_CONTEXT).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Entries are visible unless explicitly marked `view: false`.
    pub fn is_visible(&self) -> bool {
        self.meta.get(META_VIEW).and_then(Value::as_bool).unwrap_or(true)
    }

    pub fn is_anchor(&self) -> bool {
        self.kind == EntryKind::Anchor
    }
}

/// The persisted shape of one executed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub name: String,
    pub intent: String,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub origin: String,
}
