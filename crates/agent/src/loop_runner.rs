//! The background agent loop.
//!
//! `submit` routes human input synchronously. When the model has to get
//! involved, a wake is queued for the loop's worker task, which runs a bounded
//! step sequence: call the model, run the actions in its reply, and feed their
//! results back until the model answers in prose, says `$done`, or a budget
//! runs out. Wakes that arrive while a cycle is running are coalesced into the
//! next cycle.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tapeloop_config::AgentConfig;
use tapeloop_core::Error;
use tapeloop_core::error::TapeError;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::Origin;
use crate::model_runner::{ModelRunner, STAGNATION_FALLBACK};
use crate::session::{RouteResult, Session};

/// Appended to a follow-up that is identical to the previous one.
pub const LOOP_STAGNATION_PROMPT: &str = "The same action results were produced again. \
Do not repeat the same actions. Answer directly from what you already know, or write `$done`.";

const REPORT_CAPACITY: usize = 64;

/// How a loop cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    /// The model answered without further actions.
    Idle,
    Done,
    Exit,
    MaxSteps,
    Stagnant,
    Error,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Idle => "idle",
            LoopStatus::Done => "done",
            LoopStatus::Exit => "exit",
            LoopStatus::MaxSteps => "max_steps",
            LoopStatus::Stagnant => "stagnant",
            LoopStatus::Error => "error",
        }
    }
}

/// Published once per finished cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopReport {
    /// Highest submission ticket this cycle served.
    pub generation: u64,
    pub loop_id: String,
    pub status: LoopStatus,
    /// Assistant prose produced during the cycle.
    pub visible: String,
    pub steps: u32,
    pub error: Option<String>,
}

impl LoopReport {
    fn new(generation: u64, loop_id: String) -> Self {
        Self {
            generation,
            loop_id,
            status: LoopStatus::Idle,
            visible: String::new(),
            steps: 0,
            error: None,
        }
    }
}

/// Result of [`AgentLoop::submit`]. A ticket means a cycle was requested;
/// wait for a [`LoopReport`] whose generation reaches it.
#[derive(Debug, Clone)]
pub struct Submission {
    pub route: RouteResult,
    pub ticket: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_steps: u32,
    pub step_delay: Duration,
    /// Identical follow-ups tolerated before the recovery instruction.
    pub stagnation_window: u32,
}

impl LoopSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_steps: config.max_steps.max(1),
            step_delay: Duration::from_millis(config.step_delay_ms),
            stagnation_window: config.stagnation_window.max(1),
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

struct Shared {
    session: Session,
    runner: ModelRunner,
    settings: LoopSettings,
    wake: Notify,
    requested: AtomicU64,
    exit: Arc<AtomicBool>,
    stopped: AtomicBool,
    done: AtomicBool,
    active: AtomicBool,
    reports: broadcast::Sender<LoopReport>,
}

/// One session's loop: synchronous routing plus a worker task for model turns.
pub struct AgentLoop {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl AgentLoop {
    /// Start the worker. `exit` is shared by every loop in the process.
    /// Must be called inside a tokio runtime.
    pub fn spawn(session: Session, runner: ModelRunner, settings: LoopSettings, exit: Arc<AtomicBool>) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        let shared = Arc::new(Shared {
            session,
            runner,
            settings,
            wake: Notify::new(),
            requested: AtomicU64::new(0),
            exit,
            stopped: AtomicBool::new(false),
            done: AtomicBool::new(false),
            active: AtomicBool::new(false),
            reports,
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&shared)));
        Self { shared, worker }
    }

    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    /// Route one human input and queue a model cycle if it needs one.
    pub async fn submit(&self, raw: &str) -> Result<Submission, TapeError> {
        let shared = &self.shared;
        let route = shared.session.handle_input(raw, Origin::Human).await?;

        if route.exit_requested {
            info!(tape = shared.session.tape().name(), "exit requested");
            shared.exit.store(true, Ordering::SeqCst);
            self.stop();
            return Ok(Submission { route, ticket: None });
        }
        if route.done_requested {
            if shared.active.load(Ordering::SeqCst) {
                shared.done.store(true, Ordering::SeqCst);
            }
            return Ok(Submission { route, ticket: None });
        }
        if !route.enter_agent || shared.should_stop() {
            return Ok(Submission { route, ticket: None });
        }

        let ticket = shared.requested.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(ticket, "agent cycle requested");
        shared.wake.notify_one();
        Ok(Submission {
            route,
            ticket: Some(ticket),
        })
    }

    /// Reports for every cycle finished after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LoopReport> {
        self.shared.reports.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn exit_requested(&self) -> bool {
        self.shared.exit.load(Ordering::SeqCst)
    }

    /// Ask the worker to finish after its current cycle.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

impl Drop for AgentLoop {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(shared: Arc<Shared>) {
    let mut served = 0u64;
    loop {
        shared.wake.notified().await;
        let generation = shared.requested.load(Ordering::SeqCst);

        if shared.should_stop() {
            if generation > served {
                let mut report = LoopReport::new(generation, String::new());
                report.status = LoopStatus::Exit;
                let _ = shared.reports.send(report);
            }
            debug!(tape = shared.session.tape().name(), "agent worker stopped");
            break;
        }
        if generation <= served {
            continue;
        }

        let report = shared.run_cycle(generation).await;
        served = generation;
        // No subscribers is fine.
        let _ = shared.reports.send(report);
    }
}

impl Shared {
    fn should_stop(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) || self.exit.load(Ordering::SeqCst)
    }

    async fn run_cycle(&self, generation: u64) -> LoopReport {
        let mut loop_id = uuid::Uuid::new_v4().simple().to_string();
        loop_id.truncate(8);
        let mut report = LoopReport::new(generation, loop_id);

        self.active.store(true, Ordering::SeqCst);
        let result = self.drive(&mut report).await;
        self.active.store(false, Ordering::SeqCst);
        self.done.store(false, Ordering::SeqCst);

        if let Err(e) = result {
            warn!(loop_id = %report.loop_id, error = %e, "agent loop failed");
            report.status = LoopStatus::Error;
            report.error = Some(e.to_string());
            let _ = self
                .session
                .tape()
                .record_loop(&report.loop_id, LoopStatus::Error.as_str())
                .await;
        }
        report
    }

    async fn drive(&self, report: &mut LoopReport) -> Result<(), Error> {
        let tape = self.session.tape();
        tape.record_loop(&report.loop_id, "start").await?;
        info!(loop_id = %report.loop_id, tape = tape.name(), "agent loop started");

        let mut visible = Vec::new();
        let mut last_followup: Option<String> = None;
        let mut repeats = 0u32;

        let status = loop {
            if self.should_stop() {
                break LoopStatus::Exit;
            }
            if self.done.swap(false, Ordering::SeqCst) {
                break LoopStatus::Done;
            }

            let step = report.steps + 1;
            report.steps = step;
            tape.append_event("loop.step.start", json!({"step": step, "model": self.runner.model()}))
                .await?;

            let text = match self.runner.respond().await {
                Ok(text) => text,
                Err(e) => {
                    warn!(step, error = %e, "model step failed");
                    tape.append_event("loop.step.error", json!({"step": step, "error": e.to_string()}))
                        .await?;
                    report.error = Some(e.to_string());
                    break LoopStatus::Error;
                }
            };
            if text.trim().is_empty() {
                tape.append_event("loop.step.empty", json!({"step": step})).await?;
                break LoopStatus::Idle;
            }

            let result = self.session.interpret_assistant(&text).await?;
            tape.append_event(
                "loop.step.finish",
                json!({
                    "step": step,
                    "visible_text": !result.visible_text.is_empty(),
                    "followup": !result.followup_input.is_empty(),
                    "exit_requested": result.exit_requested,
                    "done_requested": result.done_requested,
                }),
            )
            .await?;

            if !result.visible_text.is_empty() {
                tape.record_assistant_message(&result.visible_text).await?;
                visible.push(result.visible_text.clone());
            }
            if result.exit_requested {
                self.exit.store(true, Ordering::SeqCst);
                break LoopStatus::Exit;
            }
            if result.done_requested {
                break LoopStatus::Done;
            }

            let followup = result.followup_input.trim();
            if followup.is_empty() {
                break LoopStatus::Idle;
            }
            if step >= self.settings.max_steps {
                tape.append_event("loop.max_steps", json!({"step": step, "max_steps": self.settings.max_steps}))
                    .await?;
                report.error = Some(format!("exceeded step budget ({} steps)", self.settings.max_steps));
                break LoopStatus::MaxSteps;
            }

            repeats = if last_followup.as_deref() == Some(followup) {
                repeats + 1
            } else {
                0
            };
            let next_input = if repeats > self.settings.stagnation_window {
                tape.append_event("loop.stagnant", json!({"step": step})).await?;
                tape.record_assistant_message(STAGNATION_FALLBACK).await?;
                visible.push(STAGNATION_FALLBACK.to_string());
                break LoopStatus::Stagnant;
            } else if repeats == self.settings.stagnation_window {
                warn!(step, "follow-up repeated, asking for a direct answer");
                format!("{followup}\n\n{LOOP_STAGNATION_PROMPT}")
            } else {
                followup.to_string()
            };
            last_followup = Some(followup.to_string());

            tape.record_context_message(&next_input).await?;
            if !self.settings.step_delay.is_zero() {
                tokio::time::sleep(self.settings.step_delay).await;
            }
        };

        tape.record_loop(&report.loop_id, status.as_str()).await?;
        info!(
            loop_id = %report.loop_id,
            status = status.as_str(),
            steps = report.steps,
            "agent loop finished"
        );
        report.status = status;
        report.visible = visible.join("\n\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runner::ModelSettings;
    use crate::provider::{ScriptedProvider, text_response, tool_call, tool_call_response};
    use tapeloop_config::ShellConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tapeloop_core::error::ProviderError;
    use tapeloop_core::provider::{Provider, ProviderRequest, ProviderResponse};
    use tapeloop_tape::{EntryKind, InMemoryTapeStore, MemoryZone, TapeService};
    use tapeloop_tools::{ToolContext, builtin_registry};

    fn fast_settings() -> LoopSettings {
        LoopSettings {
            max_steps: 5,
            step_delay: Duration::ZERO,
            stagnation_window: 1,
        }
    }

    async fn agent_loop(provider: Arc<dyn Provider>, settings: LoopSettings) -> (AgentLoop, TapeService) {
        let tape = TapeService::new(Arc::new(InMemoryTapeStore::new()), "loop");
        tape.ensure_bootstrap_anchor().await.unwrap();
        let memory = Arc::new(MemoryZone::new(tape.clone()));
        memory.ensure().await.unwrap();
        let ctx = ToolContext {
            tape: tape.clone(),
            memory: Arc::clone(&memory),
            workspace: std::env::temp_dir(),
            shell: ShellConfig::default(),
        };
        let tools = Arc::new(builtin_registry(&ctx));
        let session =
            Session::new(Arc::clone(&tools), tape.clone(), std::env::temp_dir()).with_bare_shell_detection(false);
        let runner = ModelRunner::new(provider, tools, tape.clone(), memory, ModelSettings::default());
        let exit = Arc::new(AtomicBool::new(false));
        (AgentLoop::spawn(session, runner, settings, exit), tape)
    }

    async fn run(agent_loop: &AgentLoop, text: &str) -> (Submission, Option<LoopReport>) {
        let mut reports = agent_loop.subscribe();
        let submission = agent_loop.submit(text).await.unwrap();
        let report = match submission.ticket {
            Some(ticket) => loop {
                let report = reports.recv().await.unwrap();
                if report.generation >= ticket {
                    break Some(report);
                }
            },
            None => None,
        };
        (submission, report)
    }

    async fn loop_statuses(tape: &TapeService) -> Vec<String> {
        tape.read_entries()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EntryKind::Loop)
            .filter_map(|e| e.payload_str("status").map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn plain_answer_ends_idle() {
        let provider = Arc::new(ScriptedProvider::texts(&["Hi, how can I help?"]));
        let (agent_loop, tape) = agent_loop(provider, fast_settings()).await;

        let (submission, report) = run(&agent_loop, "hello").await;
        assert_eq!(submission.ticket, Some(1));
        let report = report.unwrap();
        assert_eq!(report.status, LoopStatus::Idle);
        assert_eq!(report.visible, "Hi, how can I help?");
        assert_eq!(report.steps, 1);
        assert_eq!(loop_statuses(&tape).await, vec!["start", "idle"]);
    }

    /// Parks its first call until released; every call answers "answer".
    struct GatedProvider {
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Provider for GatedProvider {
        fn name(&self) -> &str {
            "gated"
        }

        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(text_response("answer", "gated"))
        }
    }

    #[tokio::test]
    async fn submits_during_a_cycle_share_the_next_one() {
        let provider = Arc::new(GatedProvider {
            calls: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (agent_loop, tape) = agent_loop(provider.clone(), fast_settings()).await;
        let mut reports = agent_loop.subscribe();

        let first = agent_loop.submit("first").await.unwrap();
        assert_eq!(first.ticket, Some(1));
        provider.entered.notified().await;

        let mut tickets = Vec::new();
        for text in ["second", "third", "fourth", "fifth"] {
            tickets.push(agent_loop.submit(text).await.unwrap().ticket.unwrap());
        }
        assert_eq!(tickets, vec![2, 3, 4, 5]);
        provider.release.notify_one();

        let busy = reports.recv().await.unwrap();
        assert_eq!(busy.generation, 1);
        let batched = reports.recv().await.unwrap();
        assert_eq!(batched.generation, 5);
        for ticket in tickets {
            assert!(batched.generation >= ticket);
        }
        assert_eq!(batched.status, LoopStatus::Idle);
        assert_eq!(batched.steps, 1);
        assert_eq!(batched.visible, "answer");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(loop_statuses(&tape).await, vec!["start", "idle", "start", "idle"]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(reports.try_recv().is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pure_command_never_wakes_the_worker() {
        let provider = Arc::new(ScriptedProvider::texts(&["unused"]));
        let (agent_loop, _tape) = agent_loop(provider.clone(), fast_settings()).await;

        let (submission, report) = run(&agent_loop, ",tape.info").await;
        assert!(submission.ticket.is_none());
        assert!(report.is_none());
        assert!(submission.route.immediate_output.starts_with("tape=loop"));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn action_results_feed_the_next_step() {
        let provider = Arc::new(ScriptedProvider::texts(&["$tape.info", "The tape is healthy."]));
        let (agent_loop, tape) = agent_loop(provider.clone(), fast_settings()).await;

        let (_, report) = run(&agent_loop, "check the tape").await;
        let report = report.unwrap();
        assert_eq!(report.status, LoopStatus::Idle);
        assert_eq!(report.steps, 2);
        assert_eq!(report.visible, "The tape is healthy.");

        let second = &provider.requests().await[1];
        assert!(second.messages.last().unwrap().content.starts_with("<cmd name=\"tape.info\""));
        assert!(
            tape.read_entries()
                .await
                .unwrap()
                .iter()
                .any(|e| e.name() == Some("loop.step.finish"))
        );
    }

    #[tokio::test]
    async fn done_returns_to_idle_state() {
        let provider = Arc::new(ScriptedProvider::texts(&["Finished.\n$done"]));
        let (agent_loop, tape) = agent_loop(provider, fast_settings()).await;

        let (_, report) = run(&agent_loop, "wrap up").await;
        let report = report.unwrap();
        assert_eq!(report.status, LoopStatus::Done);
        assert_eq!(report.visible, "Finished.");
        assert!(!agent_loop.exit_requested());
        assert!(!agent_loop.is_active());
        assert_eq!(loop_statuses(&tape).await, vec!["start", "done"]);
    }

    #[tokio::test]
    async fn assistant_quit_sets_exit_flag() {
        let provider = Arc::new(ScriptedProvider::texts(&["Bye.\n$quit"]));
        let (agent_loop, tape) = agent_loop(provider, fast_settings()).await;

        let (_, report) = run(&agent_loop, "we are finished").await;
        assert_eq!(report.unwrap().status, LoopStatus::Exit);
        assert!(agent_loop.exit_requested());
        assert_eq!(loop_statuses(&tape).await, vec!["start", "exit"]);

        let (submission, report) = run(&agent_loop, "anyone there?").await;
        assert!(submission.ticket.is_none());
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn human_quit_is_synchronous() {
        let provider = Arc::new(ScriptedProvider::texts(&["unused"]));
        let (agent_loop, _tape) = agent_loop(provider.clone(), fast_settings()).await;

        let (submission, report) = run(&agent_loop, "$quit").await;
        assert!(submission.route.exit_requested);
        assert!(report.is_none());
        assert!(agent_loop.exit_requested());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn step_budget_is_reported() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            text_response("$memory.daily content=one", "scripted"),
            text_response("$memory.daily content=two", "scripted"),
            text_response("$memory.daily content=three", "scripted"),
        ]));
        let settings = LoopSettings {
            max_steps: 2,
            ..fast_settings()
        };
        let (agent_loop, tape) = agent_loop(provider, settings).await;

        let (_, report) = run(&agent_loop, "take notes").await;
        let report = report.unwrap();
        assert_eq!(report.status, LoopStatus::MaxSteps);
        assert_eq!(report.steps, 2);
        assert_eq!(report.error.as_deref(), Some("exceeded step budget (2 steps)"));
        assert_eq!(loop_statuses(&tape).await, vec!["start", "max_steps"]);
    }

    #[tokio::test]
    async fn repeated_followups_stop_before_the_ceiling() {
        let provider = Arc::new(ScriptedProvider::texts(&["$tape.anchors"]));
        let settings = LoopSettings {
            max_steps: 50,
            ..fast_settings()
        };
        let (agent_loop, tape) = agent_loop(provider.clone(), settings).await;

        let (_, report) = run(&agent_loop, "list anchors forever").await;
        let report = report.unwrap();
        assert_eq!(report.status, LoopStatus::Stagnant);
        assert_eq!(report.steps, 3);
        assert_eq!(report.visible, STAGNATION_FALLBACK);
        assert!(
            provider.requests().await[2]
                .messages
                .last()
                .unwrap()
                .content
                .ends_with(LOOP_STAGNATION_PROMPT)
        );
        assert_eq!(loop_statuses(&tape).await, vec!["start", "stagnant"]);
    }

    #[tokio::test]
    async fn repeated_native_tool_calls_terminate() {
        let call = tool_call("c1", "tape.anchors", serde_json::json!({}));
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_response(vec![call.clone()]),
            tool_call_response(vec![call]),
            text_response("There is one anchor.", "scripted"),
        ]));
        let (agent_loop, _tape) = agent_loop(provider.clone(), fast_settings()).await;

        let (_, report) = run(&agent_loop, "anchors?").await;
        let report = report.unwrap();
        assert_eq!(report.status, LoopStatus::Idle);
        assert_eq!(report.steps, 1);
        assert_eq!(report.visible, "There is one anchor.");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn provider_failure_is_a_step_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let (agent_loop, tape) = agent_loop(provider, fast_settings()).await;

        let (_, report) = run(&agent_loop, "hello").await;
        let report = report.unwrap();
        assert_eq!(report.status, LoopStatus::Error);
        assert!(report.error.unwrap().contains("no responses"));
        assert!(
            tape.read_entries()
                .await
                .unwrap()
                .iter()
                .any(|e| e.name() == Some("loop.step.error"))
        );
        assert_eq!(loop_statuses(&tape).await, vec!["start", "error"]);
    }
}
