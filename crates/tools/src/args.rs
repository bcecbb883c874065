//! Argument helpers shared by the built-in tools.
//!
//! Arguments arrive as a JSON object from two sources: native model tool calls
//! (typed JSON) and parsed `$name key=value` actions (every value a string,
//! bare `--flag` as `true`, loose words under `"args"`). These helpers accept
//! both shapes.

use serde_json::Value;
use tapeloop_core::ToolError;

/// A string argument, falling back to the positional `args` list joined by spaces.
pub fn text(arguments: &Value, key: &str) -> Option<String> {
    if let Some(value) = string(arguments, key) {
        return Some(value);
    }
    let joined = positional(arguments).join(" ");
    (!joined.is_empty()).then_some(joined)
}

/// A string argument by key only.
pub fn string(arguments: &Value, key: &str) -> Option<String> {
    match arguments.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn required(arguments: &Value, key: &str) -> Result<String, ToolError> {
    text(arguments, key).ok_or_else(|| ToolError::InvalidArguments(format!("missing '{key}' argument")))
}

/// Loose words collected under `"args"`.
pub fn positional(arguments: &Value) -> Vec<String> {
    arguments
        .get("args")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// A boolean flag; accepts `true`, `"true"`, `"1"`, `"yes"`.
pub fn flag(arguments: &Value, key: &str) -> bool {
    match arguments.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Some(Value::Number(n)) => n.as_u64().is_some_and(|n| n != 0),
        _ => false,
    }
}

/// An unsigned integer argument with a default.
pub fn number(arguments: &Value, key: &str, default: u64) -> Result<u64, ToolError> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| ToolError::InvalidArguments(format!("'{key}' must be a positive integer"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| ToolError::InvalidArguments(format!("'{key}' must be a positive integer, got '{s}'"))),
        Some(other) => Err(ToolError::InvalidArguments(format!("'{key}' must be a number, got {other}"))),
    }
}
