//! Session router: parse input into segments, execute actions, and decide
//! whether the model needs to see the result.

use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tapeloop_core::error::{TapeError, ToolError};
use tapeloop_core::tool::{ToolCall, ToolRegistry};
use tapeloop_tape::{CommandRecord, LANE_CONTROL, META_LANE, META_VIEW, TapeService};
use tracing::{debug, warn};

use crate::command::{
    ActionOutcome, Origin, bash_line, build_tool_kwargs, format_action_block, format_shell_args,
    internal_command, is_shell_line, normalize_command_output, strip_leading_dollar,
};
use crate::segments::{
    ActionKind, ActionSegment, Segment, parse_segments, segments_are_only_text, shell_command_exists,
};

/// How one human input was routed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteResult {
    /// Text to hand to the model; recorded as a context message.
    pub agent_input: String,
    pub enter_agent: bool,
    pub exit_requested: bool,
    pub done_requested: bool,
    /// Output of the executed actions, for showing to the human right away.
    pub immediate_output: String,
}

/// How one model response was interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssistantResult {
    /// Executed action blocks, fed back as the next model input.
    pub followup_input: String,
    pub exit_requested: bool,
    pub done_requested: bool,
    /// Prose for the human.
    pub visible_text: String,
}

#[derive(Default)]
struct SegmentRun {
    output_parts: Vec<String>,
    action_blocks: Vec<String>,
    immediate: Vec<String>,
    text_present: bool,
    had_error: bool,
    ran_command: bool,
    exit_requested: bool,
    done_requested: bool,
}

/// Routes and executes segments for one tape.
#[derive(Clone)]
pub struct Session {
    tools: Arc<ToolRegistry>,
    tool_names: Arc<HashSet<String>>,
    tape: TapeService,
    workspace: PathBuf,
    detect_bare_shell: bool,
}

impl Session {
    pub fn new(tools: Arc<ToolRegistry>, tape: TapeService, workspace: impl Into<PathBuf>) -> Self {
        let tool_names = tools.names().into_iter().map(str::to_string).collect();
        Self {
            tools,
            tool_names: Arc::new(tool_names),
            tape,
            workspace: workspace.into(),
            detect_bare_shell: true,
        }
    }

    /// Treat single human lines like `git status` as shell commands.
    pub fn with_bare_shell_detection(mut self, enabled: bool) -> Self {
        self.detect_bare_shell = enabled;
        self
    }

    pub fn tape(&self) -> &TapeService {
        &self.tape
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Record the raw input, route it, and record the model-facing text.
    pub async fn handle_input(&self, raw: &str, origin: Origin) -> Result<RouteResult, TapeError> {
        self.tape.record_user_message(raw).await?;
        let result = self.route(raw, origin).await?;
        if result.enter_agent {
            self.tape.record_context_message(&result.agent_input).await?;
        }
        Ok(result)
    }

    pub async fn route(&self, raw: &str, origin: Origin) -> Result<RouteResult, TapeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(RouteResult::default());
        }

        if origin == Origin::Human {
            if let Some(action) = internal_command(trimmed, |name| self.tools.contains(name)) {
                return self.route_segments(vec![Segment::Action(action)], origin).await;
            }
        }

        let segments = parse_segments(raw, &self.tool_names);
        if segments.is_empty() {
            return Ok(RouteResult::default());
        }

        if segments_are_only_text(&segments) {
            if let Some(leading) = strip_leading_dollar(raw) {
                if leading.trim().is_empty() {
                    return Ok(RouteResult::default());
                }
                return Ok(RouteResult {
                    agent_input: leading,
                    enter_agent: true,
                    ..RouteResult::default()
                });
            }
            if origin == Origin::Human && self.detect_bare_shell && is_shell_line(trimmed, shell_command_exists) {
                debug!(line = trimmed, "bare line routed to shell");
                let action = bash_line(trimmed, trimmed);
                return self.route_segments(vec![Segment::Action(action)], origin).await;
            }
        }

        self.route_segments(segments, origin).await
    }

    async fn route_segments(&self, segments: Vec<Segment>, origin: Origin) -> Result<RouteResult, TapeError> {
        let run = self.run_segments(&segments, origin, true).await?;
        let immediate_output = run.immediate.join("\n");

        let (agent_input, enter_agent) = if !run.text_present && run.ran_command {
            if run.had_error {
                (run.action_blocks.concat().trim().to_string(), true)
            } else {
                (String::new(), false)
            }
        } else {
            (run.output_parts.concat().trim().to_string(), true)
        };

        Ok(RouteResult {
            enter_agent: enter_agent && !agent_input.is_empty(),
            agent_input,
            exit_requested: run.exit_requested,
            done_requested: run.done_requested,
            immediate_output,
        })
    }

    /// Run the actions in a model response; prose and action results stay apart.
    pub async fn interpret_assistant(&self, raw: &str) -> Result<AssistantResult, TapeError> {
        let segments = parse_segments(raw, &self.tool_names);
        if segments.is_empty() {
            return Ok(AssistantResult::default());
        }
        let run = self.run_segments(&segments, Origin::Assistant, false).await?;
        Ok(AssistantResult {
            followup_input: run.action_blocks.concat().trim().to_string(),
            exit_requested: run.exit_requested,
            done_requested: run.done_requested,
            visible_text: run.output_parts.concat().trim().to_string(),
        })
    }

    async fn run_segments(
        &self,
        segments: &[Segment],
        origin: Origin,
        include_actions: bool,
    ) -> Result<SegmentRun, TapeError> {
        let mut run = SegmentRun::default();

        for segment in segments {
            let action = match segment {
                Segment::Text(text) => {
                    run.output_parts.push(text.clone());
                    if !text.trim().is_empty() {
                        run.text_present = true;
                    }
                    continue;
                }
                Segment::Action(action) => action,
            };

            let outcome = self.execute(action, origin).await?;
            run.ran_command = true;
            let block = format_action_block(&outcome);
            run.action_blocks.push(block.clone());
            if !outcome.is_ok() {
                run.had_error = true;
            }
            if !outcome.is_control() {
                run.immediate.push(if outcome.is_ok() {
                    outcome.stdout.clone()
                } else {
                    format!("error: {}", outcome.stderr)
                });
            }
            if outcome.is_quit() {
                run.exit_requested = true;
                break;
            }
            if outcome.is_debug() {
                continue;
            }
            if outcome.is_done() {
                run.done_requested = true;
                break;
            }
            if include_actions {
                run.output_parts.push(block);
            }
        }

        Ok(run)
    }

    /// Execute one action. Tool failures become error outcomes; only tape
    /// failures propagate.
    async fn execute(&self, segment: &ActionSegment, origin: Origin) -> Result<ActionOutcome, TapeError> {
        let call = match segment.kind {
            ActionKind::Tool => ToolCall {
                id: String::new(),
                name: segment.name.clone(),
                arguments: build_tool_kwargs(segment),
            },
            ActionKind::Shell => {
                let mut words = vec![segment.name.clone()];
                words.extend(segment.args.iter().cloned());
                ToolCall {
                    id: String::new(),
                    name: "bash".into(),
                    arguments: json!({
                        "cmd": format_shell_args(&words),
                        "cwd": self.workspace.to_string_lossy(),
                    }),
                }
            }
        };

        let start = Instant::now();
        let result = self.tools.execute(&call).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(result) if result.success => match normalize_command_output(&result.output) {
                (true, stdout) => ActionOutcome::ok(segment, stdout, elapsed_ms, origin),
                (false, message) => ActionOutcome::error(segment, message, elapsed_ms, origin),
            },
            Ok(result) => ActionOutcome::error(segment, result.output, elapsed_ms, origin),
            Err(ToolError::NotFound(_)) => ActionOutcome::error(segment, "unknown command".into(), 0, origin),
            Err(e) => {
                warn!(action = %segment.name, error = %e, "action failed");
                ActionOutcome::error(segment, format!("execution failed: {e}"), elapsed_ms, origin)
            }
        };
        debug!(
            action = %outcome.name,
            kind = segment.kind.as_str(),
            status = outcome.status.as_str(),
            elapsed_ms = outcome.elapsed_ms,
            "action executed"
        );

        self.record(&outcome).await?;
        Ok(outcome)
    }

    async fn record(&self, outcome: &ActionOutcome) -> Result<(), TapeError> {
        let meta = matches!(outcome.name.as_str(), "debug" | "done").then(|| {
            let mut meta = Map::new();
            meta.insert(META_LANE.into(), Value::String(LANE_CONTROL.into()));
            meta.insert(META_VIEW.into(), Value::Bool(false));
            meta
        });
        let record = CommandRecord {
            name: outcome.name.clone(),
            intent: outcome.intent.clone(),
            status: outcome.status.as_str().into(),
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
            exit_code: outcome.exit_code,
            elapsed_ms: outcome.elapsed_ms,
            origin: outcome.origin.as_str().into(),
        };
        self.tape.record_command(&record, meta).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapeloop_config::ShellConfig;
    use tapeloop_tape::{EntryKind, InMemoryTapeStore, MemoryZone};
    use tapeloop_tools::{ToolContext, builtin_registry};

    async fn session() -> (Session, TapeService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let tape = TapeService::new(Arc::new(InMemoryTapeStore::new()), "s");
        tape.ensure_bootstrap_anchor().await.unwrap();
        let memory = Arc::new(MemoryZone::new(tape.clone()));
        memory.ensure().await.unwrap();
        let ctx = ToolContext {
            tape: tape.clone(),
            memory,
            workspace: dir.path().to_path_buf(),
            shell: ShellConfig::default(),
        };
        let session = Session::new(Arc::new(builtin_registry(&ctx)), tape.clone(), dir.path());
        (session, tape, dir)
    }

    async fn commands(tape: &TapeService) -> Vec<tapeloop_tape::TapeEntry> {
        tape.read_entries()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EntryKind::Command)
            .collect()
    }

    #[tokio::test]
    async fn comma_help_stays_out_of_the_model() {
        let (session, tape, _dir) = session().await;
        let result = session.handle_input(",help", Origin::Human).await.unwrap();
        assert!(!result.enter_agent);
        assert!(result.immediate_output.contains(",help"));
        let recorded = commands(&tape).await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].payload_str("name"), Some("help"));
        assert_eq!(recorded[0].payload_str("origin"), Some("human"));
    }

    #[tokio::test]
    async fn quit_requests_exit() {
        let (session, tape, _dir) = session().await;
        let result = session.handle_input("$quit", Origin::Human).await.unwrap();
        assert!(result.exit_requested);
        assert!(!result.enter_agent);
        let recorded = commands(&tape).await;
        assert_eq!(recorded[0].payload_str("stdout"), Some("exit"));
        assert_eq!(recorded[0].payload_str("status"), Some("ok"));
    }

    #[tokio::test]
    async fn plain_text_goes_to_the_model() {
        let (session, tape, _dir) = session().await;
        let result = session.handle_input("what is a tape?", Origin::Human).await.unwrap();
        assert!(result.enter_agent);
        assert_eq!(result.agent_input, "what is a tape?");
        let context = tape.context_messages().await.unwrap();
        assert_eq!(context.last().unwrap().content, "what is a tape?");
    }

    #[tokio::test]
    async fn mixed_text_and_action_is_combined_context() {
        let (session, _tape, _dir) = session().await;
        let result = session
            .handle_input("summarize $tape.search query=hello", Origin::Human)
            .await
            .unwrap();
        assert!(result.enter_agent);
        assert!(result.agent_input.starts_with("summarize <cmd name=\"tape.search\" status=\"ok\">"));
    }

    #[tokio::test]
    async fn failed_action_is_handed_to_the_model() {
        let (session, tape, _dir) = session().await;
        let result = session.handle_input("$tool.describe name=nope", Origin::Human).await.unwrap();
        assert!(result.enter_agent);
        assert!(result.agent_input.contains("status=\"error\""));
        assert!(result.agent_input.contains("intent: $tool.describe name=nope"));
        assert_eq!(commands(&tape).await[0].payload_str("status"), Some("error"));
    }

    #[tokio::test]
    async fn leading_dollar_without_action_is_model_input() {
        let (session, _tape, _dir) = session().await;
        let result = session.handle_input("$ 100 is the price", Origin::Human).await.unwrap();
        assert!(result.enter_agent);
        assert_eq!(result.agent_input, "100 is the price");

        let empty = session.handle_input("$", Origin::Human).await.unwrap();
        assert_eq!(empty, RouteResult::default());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bare_shell_line_runs_directly() {
        let (session, tape, _dir) = session().await;
        let result = session.handle_input("echo hi", Origin::Human).await.unwrap();
        assert!(!result.enter_agent);
        assert_eq!(result.immediate_output, "hi");
        assert_eq!(commands(&tape).await[0].payload_str("name"), Some("bash"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bare_line_keeps_quoted_dollar_literal() {
        let (session, _tape, _dir) = session().await;
        let result = session.handle_input("echo '$notacommand'", Origin::Human).await.unwrap();
        assert_eq!(result.immediate_output, "$notacommand");
    }

    #[tokio::test]
    async fn bare_shell_detection_can_be_disabled() {
        let (session, _tape, _dir) = session().await;
        let session = session.with_bare_shell_detection(false);
        let result = session.handle_input("echo hi", Origin::Human).await.unwrap();
        assert!(result.enter_agent);
        assert_eq!(result.agent_input, "echo hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_action_runs_in_workspace() {
        let (session, _tape, dir) = session().await;
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let result = session.handle_input("$ls", Origin::Human).await.unwrap();
        assert!(!result.enter_agent);
        assert!(result.immediate_output.contains("marker.txt"));
    }

    #[tokio::test]
    async fn assistant_prose_and_actions_stay_apart() {
        let (session, tape, _dir) = session().await;
        let result = session
            .interpret_assistant("Checking the tape.\n$tape.info\nOne moment.")
            .await
            .unwrap();
        assert_eq!(result.visible_text, "Checking the tape.\nOne moment.");
        assert!(result.followup_input.starts_with("<cmd name=\"tape.info\" status=\"ok\">"));
        assert_eq!(commands(&tape).await[0].payload_str("origin"), Some("assistant"));
    }

    #[tokio::test]
    async fn done_stops_processing_and_is_hidden() {
        let (session, tape, _dir) = session().await;
        let result = session.interpret_assistant("$done $tape.info").await.unwrap();
        assert!(result.done_requested);
        let recorded = commands(&tape).await;
        assert_eq!(recorded.len(), 1);
        assert!(!recorded[0].is_visible());
        assert_eq!(recorded[0].lane(), LANE_CONTROL);
    }

    #[tokio::test]
    async fn plain_assistant_answer_has_no_followup() {
        let (session, _tape, _dir) = session().await;
        let result = session.interpret_assistant("All done, nothing to run.").await.unwrap();
        assert_eq!(result.followup_input, "");
        assert_eq!(result.visible_text, "All done, nothing to run.");
    }
}
