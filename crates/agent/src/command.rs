//! Helpers around one executed action: argument building, output
//! normalization, the `<cmd>` block fed back to the model, and the two human
//! shortcuts (comma commands and bare shell lines).

use serde_json::{Map, Value};
use std::borrow::Cow;

use crate::segments::{ActionKind, ActionSegment, DOLLAR, is_path_like};

/// Prefix of internal commands typed by a human, e.g. `,help`.
pub const INTERNAL_PREFIX: char = ',';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Human,
    Assistant,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Human => "human",
            Origin::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Ok,
    Error,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Ok => "ok",
            OutcomeStatus::Error => "error",
        }
    }
}

/// Result of executing one action. Recorded to the tape before it is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub name: String,
    pub status: OutcomeStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub intent: String,
    pub origin: Origin,
}

impl ActionOutcome {
    pub fn ok(segment: &ActionSegment, stdout: String, elapsed_ms: u64, origin: Origin) -> Self {
        Self {
            name: segment.name.clone(),
            status: OutcomeStatus::Ok,
            stdout,
            stderr: String::new(),
            exit_code: 0,
            elapsed_ms,
            intent: segment.raw.clone(),
            origin,
        }
    }

    pub fn error(segment: &ActionSegment, stderr: String, elapsed_ms: u64, origin: Origin) -> Self {
        Self {
            name: segment.name.clone(),
            status: OutcomeStatus::Error,
            stdout: String::new(),
            stderr,
            exit_code: 1,
            elapsed_ms,
            intent: segment.raw.clone(),
            origin,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OutcomeStatus::Ok
    }

    fn signals(&self, name: &str, word: &str) -> bool {
        self.name == name && self.is_ok() && self.stdout.trim() == word
    }

    pub fn is_quit(&self) -> bool {
        self.signals("quit", "exit")
    }

    pub fn is_done(&self) -> bool {
        self.signals("done", "done")
    }

    pub fn is_debug(&self) -> bool {
        self.signals("debug", "toggle")
    }

    pub fn is_control(&self) -> bool {
        self.is_quit() || self.is_done() || self.is_debug()
    }
}

/// The block the model sees for one executed action.
pub fn format_action_block(outcome: &ActionOutcome) -> String {
    match outcome.status {
        OutcomeStatus::Ok => {
            let content = match outcome.stdout.trim() {
                "" => "(no output)",
                s => s,
            };
            format!("<cmd name=\"{}\" status=\"ok\">\n{}\n</cmd>", outcome.name, content)
        }
        OutcomeStatus::Error => {
            let error = match outcome.stderr.trim() {
                "" => "command failed",
                s => s,
            };
            format!(
                "<cmd name=\"{}\" status=\"error\">\nerror: {}\nintent: {}\n</cmd>",
                outcome.name,
                error,
                outcome.intent.trim()
            )
        }
    }
}

/// Re-quote words into one shell-safe command line.
pub fn format_shell_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| match shlex::try_quote(arg) {
            Ok(quoted) => quoted,
            // Only NUL bytes fail to quote; drop them.
            Err(_) => Cow::Owned(shlex::try_quote(&arg.replace('\0', "")).unwrap_or_default().into_owned()),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Tool arguments from a parsed action.
pub fn build_tool_kwargs(segment: &ActionSegment) -> Value {
    if segment.name == "bash" {
        return Value::Object(bash_tool_kwargs(&segment.args));
    }
    Value::Object(parse_kv_arguments(&segment.args))
}

/// `--key value`, `--key=value`, `--flag`, `key=value`; everything else goes
/// to the positional `args` list.
pub fn parse_kv_arguments(args: &[String]) -> Map<String, Value> {
    let mut kwargs = Map::new();
    let mut positional = Vec::new();
    let mut idx = 0;
    while idx < args.len() {
        let token = &args[idx];
        if let Some(option) = token.strip_prefix("--") {
            if let Some((key, value)) = option.split_once('=') {
                kwargs.insert(key.into(), Value::String(value.into()));
                idx += 1;
            } else if let Some(next) = args.get(idx + 1).filter(|n| !n.starts_with("--")) {
                kwargs.insert(option.into(), Value::String(next.clone()));
                idx += 2;
            } else {
                kwargs.insert(option.into(), Value::Bool(true));
                idx += 1;
            }
            continue;
        }
        if let Some((key, value)) = token.split_once('=') {
            kwargs.insert(key.into(), Value::String(value.into()));
        } else {
            positional.push(Value::String(token.clone()));
        }
        idx += 1;
    }
    if !positional.is_empty() {
        kwargs.insert("args".into(), Value::Array(positional));
    }
    kwargs
}

/// `cmd`/`cwd` may be given as options; every other word joins the command.
fn bash_tool_kwargs(args: &[String]) -> Map<String, Value> {
    let mut kwargs = Map::new();
    let mut parts: Vec<&str> = Vec::new();
    let mut idx = 0;
    while idx < args.len() {
        let token = args[idx].as_str();
        let special = ["cwd", "cmd"].into_iter().find_map(|key| {
            let inline = token
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
                .or_else(|| token.strip_prefix("--").and_then(|t| t.strip_prefix(key)?.strip_prefix('=')));
            if let Some(value) = inline {
                return Some((key, value.to_string(), 1));
            }
            if token.strip_prefix("--") == Some(key) {
                return args.get(idx + 1).map(|v| (key, v.clone(), 2));
            }
            None
        });
        match special {
            Some((key, value, width)) => {
                kwargs.insert(key.into(), Value::String(value));
                idx += width;
            }
            None => {
                parts.push(token);
                idx += 1;
            }
        }
    }
    let tail = parts.join(" ");
    let tail = tail.trim();
    let cmd = match kwargs.get("cmd").and_then(Value::as_str) {
        Some(given) if !tail.is_empty() => format!("{given} {tail}").trim().to_string(),
        Some(given) => given.to_string(),
        None => tail.to_string(),
    };
    kwargs.insert("cmd".into(), Value::String(cmd));
    kwargs
}

/// A leading `error:` in tool output marks a failure.
pub fn normalize_command_output(output: &str) -> (bool, String) {
    let text = output.trim();
    match text.strip_prefix("error:") {
        Some(rest) => {
            let rest = rest.trim();
            (false, if rest.is_empty() { "command failed".into() } else { rest.into() })
        }
        None => (true, text.to_string()),
    }
}

/// For input that opens with `$`, the text after the marker.
pub fn strip_leading_dollar(raw: &str) -> Option<String> {
    let stripped = raw.trim_start();
    let rest = stripped.strip_prefix(DOLLAR)?;
    Some(rest.trim_start().to_string())
}

/// Shell word split; malformed quoting yields no words.
pub fn parse_command_words(text: &str) -> Vec<String> {
    shlex::split(text).unwrap_or_default()
}

fn resolve_internal_name(name: &str) -> &str {
    match name {
        "tool" => "tool.describe",
        "tape" => "tape.info",
        "memory" => "memory.show",
        other => other,
    }
}

/// Turn `,name args…` into an action.
///
/// Known tools run directly; any other name runs the whole line through
/// `bash` so pipes and redirects keep working.
pub fn internal_command(line: &str, is_tool: impl Fn(&str) -> bool) -> Option<ActionSegment> {
    let body = line.trim().strip_prefix(INTERNAL_PREFIX)?.trim();
    let words = parse_command_words(body);
    let first = words.first()?;
    let name = resolve_internal_name(first);
    if is_tool(name) {
        return Some(ActionSegment {
            name: name.to_string(),
            kind: ActionKind::Tool,
            args: words[1..].to_vec(),
            raw: line.trim().to_string(),
        });
    }
    Some(bash_line(body, line.trim()))
}

/// Run `command_line` verbatim through the `bash` tool.
pub fn bash_line(command_line: &str, raw: &str) -> ActionSegment {
    ActionSegment {
        name: "bash".into(),
        kind: ActionKind::Tool,
        args: vec!["--cmd".into(), command_line.to_string()],
        raw: raw.to_string(),
    }
}

fn is_cjk(ch: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&ch)
}

fn is_env_assignment(word: &str) -> bool {
    let Some((name, _)) = word.split_once('=') else {
        return false;
    };
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Whether a single human line reads as a shell command rather than prose.
pub fn is_shell_line(line: &str, shell_exists: impl Fn(&str) -> bool) -> bool {
    let line = line.trim();
    if line.is_empty() || line.contains('\n') || line.chars().any(is_cjk) {
        return false;
    }
    if line.ends_with(['.', '!', '?', '。']) {
        return false;
    }
    let words = parse_command_words(line);
    let Some(first) = words.first() else {
        return false;
    };
    is_path_like(first)
        || line.contains(['|', '&', ';', '<', '>'])
        || is_env_assignment(first)
        || shell_exists(first)
}
