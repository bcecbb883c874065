//! Segment parser: split free-form text into prose and `$` actions.
//!
//! An action starts at an unquoted, unescaped `$` that sits at the start of
//! the text or right after whitespace. The remainder is lexed with POSIX
//! shell rules; the first word names a tool or an executable on `PATH`. Tool
//! actions consume only `--flag value`, `--flag=value` and `key=value` words so
//! trailing prose stays prose. Shell actions consume every word up to the
//! next action start.
//!
//! Parsing never fails. Anything that does not form an action, including
//! malformed quoting, stays literal text.

use std::collections::HashSet;

pub const DOLLAR: char = '$';
const OPTION_TERMINATOR: &str = "--";

/// Tools that take the rest of the line verbatim when they open it.
pub const RAW_TAIL_TOOLS: &[&str] = &["bash"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// A registered tool.
    Tool,
    /// An executable resolved on `PATH` or given as a path.
    Shell,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Tool => "tool",
            ActionKind::Shell => "shell",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSegment {
    pub name: String,
    pub kind: ActionKind,
    pub args: Vec<String>,
    /// The source text of the action, `$` included.
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Action(ActionSegment),
}

impl Segment {
    pub fn is_text(&self) -> bool {
        matches!(self, Segment::Text(_))
    }
}

/// Parse `raw`, resolving non-tool names against `PATH`.
pub fn parse_segments(raw: &str, tool_names: &HashSet<String>) -> Vec<Segment> {
    parse_segments_with(raw, tool_names, &shell_command_exists)
}

/// Parse `raw` with an explicit shell resolver.
pub fn parse_segments_with(
    raw: &str,
    tool_names: &HashSet<String>,
    shell_exists: &dyn Fn(&str) -> bool,
) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut pos = 0;
    while pos < raw.len() {
        let Some(start) = find_command_start(raw, pos) else {
            push_text(&mut segments, &raw[pos..]);
            break;
        };
        if start > pos {
            push_text(&mut segments, &raw[pos..start]);
        }
        match parse_command_at(raw, start, tool_names, shell_exists) {
            Some((action, end)) => {
                segments.push(Segment::Action(action));
                pos = end;
            }
            None => {
                push_text(&mut segments, "$");
                pos = start + DOLLAR.len_utf8();
            }
        }
    }
    segments
}

pub fn segments_are_only_text(segments: &[Segment]) -> bool {
    segments.iter().all(Segment::is_text)
}

/// `./`, `../`, `/`, `~/`, or any `/` inside.
pub fn is_path_like(token: &str) -> bool {
    ["./", "../", "/", "~/"].iter().any(|p| token.starts_with(p)) || token.contains('/')
}

pub fn shell_command_exists(name: &str) -> bool {
    is_path_like(name) || which::which(name).is_ok()
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if let Some(Segment::Text(last)) = segments.last_mut() {
        last.push_str(text);
    } else {
        segments.push(Segment::Text(text.to_string()));
    }
}

fn find_command_start(raw: &str, from: usize) -> Option<usize> {
    let mut in_single = false;
    let mut in_double = false;
    let mut escape = false;
    for (offset, ch) in raw[from..].char_indices() {
        let idx = from + offset;
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if !in_single => escape = true,
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            DOLLAR if !in_single && !in_double => {
                let at_boundary = raw[..idx].chars().next_back().is_none_or(char::is_whitespace);
                if at_boundary {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_command_at(
    raw: &str,
    start: usize,
    tool_names: &HashSet<String>,
    shell_exists: &dyn Fn(&str) -> bool,
) -> Option<(ActionSegment, usize)> {
    let tokens: Vec<Token> = Lexer::new(&raw[start..]).collect();
    let (name, next_idx, name_end) = consume_command_token(&tokens)?;
    if !is_command_name(&name) {
        return None;
    }
    let kind = if tool_names.contains(&name) {
        ActionKind::Tool
    } else if shell_exists(&name) {
        ActionKind::Shell
    } else {
        return None;
    };

    let raw_tail = is_at_line_start(raw, start);
    let args = collect_arg_tokens(&tokens[next_idx..], kind, &name, raw_tail);
    let end = args.last().map_or(name_end, |t| t.end);

    let action = ActionSegment {
        args: args.iter().map(|t| t.text.clone()).collect(),
        raw: raw[start..start + end].trim_end().to_string(),
        name,
        kind,
    };
    Some((action, start + end))
}

fn consume_command_token(tokens: &[Token]) -> Option<(String, usize, usize)> {
    let first = tokens.first()?;
    if first.text == "$" {
        let name = tokens.get(1)?;
        return Some((name.text.clone(), 2, name.end));
    }
    let name = first.text.strip_prefix(DOLLAR)?;
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), 1, first.end))
}

fn is_command_name(name: &str) -> bool {
    !name.is_empty()
        && name.is_ascii()
        && name.chars().any(|c| c.is_ascii_alphabetic() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/' | ':' | '~'))
}

fn is_at_line_start(raw: &str, start: usize) -> bool {
    let line_start = raw[..start].rfind('\n').map_or(0, |i| i + 1);
    raw[line_start..start].trim().is_empty()
}

fn collect_arg_tokens<'t>(tokens: &'t [Token], kind: ActionKind, name: &str, raw_tail: bool) -> Vec<&'t Token> {
    let raw_tool = RAW_TAIL_TOOLS.contains(&name);
    let mut args = Vec::new();
    let mut pending_value = false;
    for token in tokens {
        if token.opens_action {
            break;
        }
        if token.text == OPTION_TERMINATOR && !raw_tool {
            break;
        }
        let accept = match kind {
            ActionKind::Shell => true,
            ActionKind::Tool if raw_tool && raw_tail => true,
            ActionKind::Tool if pending_value => {
                pending_value = false;
                true
            }
            ActionKind::Tool if token.text.starts_with("--") => {
                pending_value = !token.text.contains('=');
                true
            }
            ActionKind::Tool => token.text.contains('='),
        };
        if !accept {
            break;
        }
        args.push(token);
    }
    args
}

/// One lexed word. `end` is the byte offset just past the word and the
/// delimiter that ended it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    text: String,
    end: usize,
    /// Starts with an unquoted, unescaped `$`.
    opens_action: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Between,
    Word,
    Single,
    Double,
    Escape,
}

fn is_lex_whitespace(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\r' | '\n')
}

/// POSIX word splitter over a borrowed string.
///
/// Stops at the first lexing error (unclosed quote, dangling backslash) or
/// empty quoted word; the words produced before that are kept.
struct Lexer<'a> {
    text: &'a str,
    pos: usize,
    done: bool,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            done: false,
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        let mut text = String::new();
        let mut quoted = false;
        let mut opens_action = false;
        let mut state = LexState::Between;
        let mut resume = LexState::Word;
        let base = self.pos;

        for (offset, ch) in self.text[base..].char_indices() {
            let after = base + offset + ch.len_utf8();
            match state {
                LexState::Between => match ch {
                    c if is_lex_whitespace(c) => {}
                    '\\' => {
                        resume = LexState::Word;
                        state = LexState::Escape;
                    }
                    '\'' => state = LexState::Single,
                    '"' => state = LexState::Double,
                    c => {
                        opens_action = c == DOLLAR;
                        text.push(c);
                        state = LexState::Word;
                    }
                },
                LexState::Word => match ch {
                    c if is_lex_whitespace(c) => {
                        self.pos = after;
                        return Some(Token {
                            text,
                            end: after,
                            opens_action,
                        });
                    }
                    '\\' => {
                        resume = LexState::Word;
                        state = LexState::Escape;
                    }
                    '\'' => state = LexState::Single,
                    '"' => state = LexState::Double,
                    c => text.push(c),
                },
                LexState::Single => {
                    quoted = true;
                    if ch == '\'' {
                        state = LexState::Word;
                    } else {
                        text.push(ch);
                    }
                }
                LexState::Double => {
                    quoted = true;
                    match ch {
                        '"' => state = LexState::Word,
                        '\\' => {
                            resume = LexState::Double;
                            state = LexState::Escape;
                        }
                        c => text.push(c),
                    }
                }
                LexState::Escape => {
                    if resume == LexState::Double && ch != '\\' && ch != '"' {
                        text.push('\\');
                    }
                    text.push(ch);
                    state = resume;
                }
            }
        }

        self.pos = self.text.len();
        match state {
            LexState::Single | LexState::Double | LexState::Escape => None,
            _ if text.is_empty() && !quoted => None,
            _ => Some(Token {
                text,
                end: self.pos,
                opens_action,
            }),
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if self.done {
            return None;
        }
        match self.next_token() {
            Some(token) if !token.text.is_empty() => Some(token),
            _ => {
                self.done = true;
                None
            }
        }
    }
}
