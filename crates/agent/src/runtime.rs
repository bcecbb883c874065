//! The runtime: one per process, owning the config, the tape store, the model
//! provider, and every live session.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tapeloop_config::AppConfig;
use tapeloop_core::provider::Provider;
use tapeloop_core::{Envelope, Error};
use tapeloop_tape::{FileTapeStore, MemoryZone, TapeService, TapeStore};
use tapeloop_tools::{ToolContext, builtin_registry};
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::loop_runner::{AgentLoop, LoopReport, LoopSettings};
use crate::model_runner::{ModelRunner, ModelSettings};
use crate::provider::provider_for;
use crate::session::{RouteResult, Session};

/// Session used when the caller does not name one.
pub const DEFAULT_SESSION: &str = "default";

/// Everything one submitted line produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TurnOutcome {
    pub immediate_output: String,
    pub assistant_output: String,
    pub exit_requested: bool,
    pub steps: u32,
    pub error: Option<String>,
}

impl TurnOutcome {
    fn from_route(route: &RouteResult) -> Self {
        Self {
            immediate_output: route.immediate_output.clone(),
            exit_requested: route.exit_requested,
            ..Self::default()
        }
    }

    fn absorb(&mut self, report: LoopReport) {
        self.assistant_output = report.visible;
        self.steps = report.steps;
        self.error = report.error;
    }
}

/// A live session: its tape, memory, router, and loop.
pub struct SessionHandle {
    pub name: String,
    pub tape: TapeService,
    pub memory: Arc<MemoryZone>,
    pub session: Session,
    pub agent_loop: AgentLoop,
}

pub struct Runtime {
    config: AppConfig,
    workspace: PathBuf,
    store: Arc<dyn TapeStore>,
    provider: Arc<dyn Provider>,
    exit: Arc<AtomicBool>,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl Runtime {
    pub fn new(
        config: AppConfig,
        workspace: impl Into<PathBuf>,
        store: Arc<dyn TapeStore>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            config,
            workspace: workspace.into(),
            store,
            provider,
            exit: Arc::new(AtomicBool::new(false)),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// File-backed tapes under the configured home and the provider named by
    /// `config.model`.
    pub fn from_config(config: AppConfig, workspace: &Path) -> Result<Self, Error> {
        let provider = provider_for(&config)?;
        let store: Arc<dyn TapeStore> = Arc::new(FileTapeStore::new(config.tapes_dir(), workspace));
        Ok(Self::new(config, workspace, store, provider))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn store(&self) -> &Arc<dyn TapeStore> {
        &self.store
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    /// Tape backing `session`: the configured tape for the default session,
    /// `<tape_name>-<session>` otherwise. The session name is kept verbatim,
    /// so distinct sessions always get distinct tapes; stores encode names
    /// for storage themselves.
    pub fn tape_name_for(&self, session: &str) -> String {
        if session == DEFAULT_SESSION {
            return self.config.tape_name.clone();
        }
        format!("{}-{}", self.config.tape_name, session)
    }

    /// Get or create a session.
    pub async fn session(&self, name: &str) -> Result<Arc<SessionHandle>, Error> {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(name) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(self.create_session(name).await?);
        sessions.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    async fn create_session(&self, name: &str) -> Result<SessionHandle, Error> {
        let tape = TapeService::new(Arc::clone(&self.store), self.tape_name_for(name));
        tape.ensure_bootstrap_anchor().await?;

        let memory = Arc::new(
            MemoryZone::new(tape.clone())
                .with_retention_days(self.config.memory.retention_days)
                .with_recent_days(self.config.memory.recent_days),
        );
        memory.ensure().await?;
        memory.prune().await?;

        let ctx = ToolContext {
            tape: tape.clone(),
            memory: Arc::clone(&memory),
            workspace: self.workspace.clone(),
            shell: self.config.shell.clone(),
        };
        let tools = Arc::new(builtin_registry(&ctx));
        let session = Session::new(Arc::clone(&tools), tape.clone(), self.workspace.clone())
            .with_bare_shell_detection(self.config.router.detect_bare_shell);
        let runner = ModelRunner::new(
            Arc::clone(&self.provider),
            tools,
            tape.clone(),
            Arc::clone(&memory),
            ModelSettings::from_config(&self.config),
        );
        let agent_loop = AgentLoop::spawn(
            session.clone(),
            runner,
            LoopSettings::from_config(&self.config.agent),
            Arc::clone(&self.exit),
        );

        info!(session = name, tape = tape.name(), store = self.store.name(), "session created");
        Ok(SessionHandle {
            name: name.to_string(),
            tape,
            memory,
            session,
            agent_loop,
        })
    }

    /// Submit one line to `session` and wait for any model cycle it started.
    pub async fn submit(&self, session: &str, text: &str) -> Result<TurnOutcome, Error> {
        let handle = self.session(session).await?;
        let mut reports = handle.agent_loop.subscribe();
        let submission = handle.agent_loop.submit(text).await?;
        let mut outcome = TurnOutcome::from_route(&submission.route);

        if let Some(ticket) = submission.ticket {
            loop {
                match reports.recv().await {
                    Ok(report) if report.generation >= ticket => {
                        outcome.absorb(report);
                        break;
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "loop reports lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        outcome.error = Some("agent loop stopped".into());
                        break;
                    }
                }
            }
        }

        outcome.exit_requested |= self.exit_requested();
        Ok(outcome)
    }

    /// Route a channel message to its session.
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<TurnOutcome, Error> {
        envelope.validate()?;
        self.submit(&envelope.session_key(), &envelope.content).await
    }

    /// Stop every loop worker.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.lock().await;
        for handle in sessions.values() {
            handle.agent_loop.stop();
        }
        info!(sessions = sessions.len(), "runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{EchoProvider, ScriptedProvider};
    use tapeloop_core::EnvelopeError;
    use tapeloop_tape::InMemoryTapeStore;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.agent.step_delay_ms = 0;
        config.router.detect_bare_shell = false;
        config
    }

    fn runtime(provider: Arc<dyn Provider>) -> Runtime {
        Runtime::new(config(), std::env::temp_dir(), Arc::new(InMemoryTapeStore::new()), provider)
    }

    #[tokio::test]
    async fn echo_answers_plain_text() {
        let runtime = runtime(Arc::new(EchoProvider));
        let outcome = runtime.submit(DEFAULT_SESSION, "hello tape").await.unwrap();
        assert_eq!(outcome.assistant_output, "hello tape");
        assert_eq!(outcome.steps, 1);
        assert!(outcome.error.is_none());
        assert!(!outcome.exit_requested);
    }

    #[tokio::test]
    async fn sessions_get_their_own_tapes() {
        let runtime = runtime(Arc::new(EchoProvider));
        let a = runtime.session(DEFAULT_SESSION).await.unwrap();
        let b = runtime.session("cli:42").await.unwrap();
        assert_eq!(a.tape.name(), "tapeloop");
        assert_eq!(b.tape.name(), "tapeloop-cli:42");

        let again = runtime.session("cli:42").await.unwrap();
        assert!(Arc::ptr_eq(&b, &again));
    }

    #[tokio::test]
    async fn lookalike_sessions_stay_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.home = Some(dir.path().to_path_buf());
        let runtime = Runtime::from_config(config, dir.path()).unwrap();

        runtime.submit("cli:42", ",memory.save content=colon-notes").await.unwrap();
        runtime.submit("cli-42", ",memory.save content=dash-notes").await.unwrap();

        let colon = runtime.session("cli:42").await.unwrap();
        let dash = runtime.session("cli-42").await.unwrap();
        assert_ne!(colon.tape.name(), dash.tape.name());
        assert_eq!(colon.memory.read().await.unwrap().long_term, "colon-notes");
        assert_eq!(dash.memory.read().await.unwrap().long_term, "dash-notes");
        assert!(colon.tape.search("dash-notes", 10).await.unwrap().is_empty());

        let tapes = runtime.store().list_tapes().await.unwrap();
        assert!(tapes.contains("tapeloop-cli:42"));
        assert!(tapes.contains("tapeloop-cli-42"));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn new_session_is_bootstrapped() {
        let runtime = runtime(Arc::new(EchoProvider));
        let handle = runtime.session(DEFAULT_SESSION).await.unwrap();
        let anchors = handle.tape.anchors(10).await.unwrap();
        assert_eq!(anchors[0].name, tapeloop_tape::BOOTSTRAP_ANCHOR);
        assert_eq!(handle.memory.read().await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn pure_commands_return_immediately() {
        let provider = Arc::new(ScriptedProvider::texts(&["unused"]));
        let runtime = runtime(provider.clone());
        let outcome = runtime.submit(DEFAULT_SESSION, ",memory.save content=likes tea").await.unwrap();
        assert_eq!(outcome.immediate_output, "saved to long-term memory");
        assert_eq!(outcome.steps, 0);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn quit_sets_runtime_exit() {
        let runtime = runtime(Arc::new(EchoProvider));
        let outcome = runtime.submit(DEFAULT_SESSION, "$quit").await.unwrap();
        assert!(outcome.exit_requested);
        assert!(runtime.exit_requested());
    }

    #[tokio::test]
    async fn envelopes_route_by_session_key() {
        let runtime = runtime(Arc::new(EchoProvider));
        let outcome = runtime
            .handle_envelope(Envelope::new("telegram", "7", "ping from chat"))
            .await
            .unwrap();
        assert_eq!(outcome.assistant_output, "ping from chat");
        let handle = runtime.session("telegram:7").await.unwrap();
        assert_eq!(handle.tape.name(), "tapeloop-telegram:7");
    }

    #[tokio::test]
    async fn invalid_envelope_is_rejected() {
        let runtime = runtime(Arc::new(EchoProvider));
        let err = runtime
            .handle_envelope(Envelope::new("cli", "", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Envelope(EnvelopeError::MissingField("chat_id"))));
    }

    #[tokio::test]
    async fn file_backed_runtime_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.home = Some(dir.path().to_path_buf());
        let runtime = Runtime::from_config(config.clone(), dir.path()).unwrap();
        runtime.submit(DEFAULT_SESSION, "remember this").await.unwrap();
        runtime.shutdown().await;

        let reopened = Runtime::from_config(config, dir.path()).unwrap();
        let handle = reopened.session(DEFAULT_SESSION).await.unwrap();
        let hits = handle.tape.search("remember this", 10).await.unwrap();
        assert!(!hits.is_empty());
    }
}
