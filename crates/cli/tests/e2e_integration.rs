//! End-to-end tests for the tapeloop runtime.
//!
//! These drive whole turns through `Runtime`: routing, action execution, the
//! background loop, and what ends up on the tape.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use tapeloop_agent::provider::{tool_call, tool_call_response};
use tapeloop_agent::{DEFAULT_SESSION, EchoProvider, Runtime, ScriptedProvider};
use tapeloop_agent::model_runner::STAGNATION_FALLBACK;
use tapeloop_config::AppConfig;
use tapeloop_core::error::{ProviderError, TapeError};
use tapeloop_core::provider::{Provider, ProviderRequest, ProviderResponse};
use tapeloop_core::Envelope;
use tapeloop_tape::{
    EntryKind, FileTapeStore, InMemoryTapeStore, MemoryZone, TapeEntry, TapeEvent, TapeService, TapeStore,
};

// ── Helpers ──────────────────────────────────────────────────────────────

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.agent.step_delay_ms = 0;
    config
}

fn runtime_with(provider: Arc<dyn Provider>) -> (Runtime, tempfile::TempDir) {
    let workspace = tempfile::tempdir().unwrap();
    let runtime = Runtime::new(
        test_config(),
        workspace.path(),
        Arc::new(InMemoryTapeStore::new()),
        provider,
    );
    (runtime, workspace)
}

async fn entries_of(runtime: &Runtime, kind: EntryKind) -> Vec<TapeEntry> {
    let handle = runtime.session(DEFAULT_SESSION).await.unwrap();
    handle
        .tape
        .read_entries()
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == kind)
        .collect()
}

struct DownProvider;

#[async_trait::async_trait]
impl Provider for DownProvider {
    fn name(&self) -> &str {
        "down"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Network("connection refused".into()))
    }
}

// ── Routing scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_comma_help_resolves_without_the_model() {
    let provider = Arc::new(ScriptedProvider::texts(&["unused"]));
    let (runtime, _ws) = runtime_with(provider.clone());

    let outcome = runtime.submit(DEFAULT_SESSION, ",help").await.unwrap();
    assert!(outcome.immediate_output.contains(",help"));
    assert_eq!(outcome.assistant_output, "");
    assert_eq!(outcome.steps, 0);
    assert_eq!(provider.call_count(), 0);

    let commands = entries_of(&runtime, EntryKind::Command).await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].payload_str("name"), Some("help"));
}

#[cfg(unix)]
#[tokio::test]
async fn e2e_bare_echo_runs_in_the_shell() {
    let provider = Arc::new(ScriptedProvider::texts(&["unused"]));
    let (runtime, _ws) = runtime_with(provider.clone());

    let outcome = runtime.submit(DEFAULT_SESSION, "echo hi").await.unwrap();
    assert_eq!(outcome.immediate_output, "hi");
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn e2e_quit_is_recorded_and_requests_exit() {
    let (runtime, _ws) = runtime_with(Arc::new(EchoProvider));

    let outcome = runtime.submit(DEFAULT_SESSION, "$quit").await.unwrap();
    assert!(outcome.exit_requested);

    let commands = entries_of(&runtime, EntryKind::Command).await;
    assert_eq!(commands[0].payload_str("name"), Some("quit"));
    assert_eq!(commands[0].payload_str("status"), Some("ok"));
    assert_eq!(commands[0].payload_str("stdout"), Some("exit"));
}

#[tokio::test]
async fn e2e_text_with_action_reaches_the_model_as_one_turn() {
    let provider = Arc::new(ScriptedProvider::texts(&["Nothing mentions hello yet."]));
    let (runtime, _ws) = runtime_with(provider.clone());

    let outcome = runtime
        .submit(DEFAULT_SESSION, "summarize $tape.search query=hello")
        .await
        .unwrap();
    assert_eq!(outcome.assistant_output, "Nothing mentions hello yet.");
    assert_eq!(outcome.steps, 1);

    let request = &provider.requests().await[0];
    let last = &request.messages.last().unwrap().content;
    assert!(last.starts_with("summarize <cmd name=\"tape.search\" status=\"ok\">"));
}

#[tokio::test]
async fn e2e_failed_command_is_shown_to_the_model() {
    let provider = Arc::new(ScriptedProvider::texts(&["That file does not exist."]));
    let (runtime, _ws) = runtime_with(provider.clone());

    let outcome = runtime.submit(DEFAULT_SESSION, "$fs.read path=missing.txt").await.unwrap();
    assert!(outcome.immediate_output.starts_with("error:"));
    assert_eq!(outcome.assistant_output, "That file does not exist.");

    let request = &provider.requests().await[0];
    let last = &request.messages.last().unwrap().content;
    assert!(last.contains("<cmd name=\"fs.read\" status=\"error\">"));
}

// ── Loop behavior ────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_model_actions_run_and_feed_back() {
    let provider = Arc::new(ScriptedProvider::texts(&[
        "Saving that.\n$memory.save content=prefers-rust",
        "Saved your preference.",
    ]));
    let (runtime, _ws) = runtime_with(provider.clone());

    let outcome = runtime.submit(DEFAULT_SESSION, "remember that I prefer rust").await.unwrap();
    assert_eq!(outcome.steps, 2);
    assert_eq!(outcome.assistant_output, "Saving that.\n\nSaved your preference.");

    let handle = runtime.session(DEFAULT_SESSION).await.unwrap();
    assert_eq!(handle.memory.read().await.unwrap().long_term, "prefers-rust");

    let second = &provider.requests().await[1];
    assert!(second.messages[0].content.contains("prefers-rust"));
}

#[tokio::test]
async fn e2e_repeated_tool_calls_terminate_early() {
    let call = tool_call("c1", "tape.anchors", json!({"limit": 10}));
    let provider = Arc::new(ScriptedProvider::new(vec![tool_call_response(vec![call])]));
    let (runtime, _ws) = runtime_with(provider.clone());

    let outcome = runtime.submit(DEFAULT_SESSION, "what anchors exist").await.unwrap();
    assert_eq!(outcome.assistant_output, STAGNATION_FALLBACK);
    assert_eq!(outcome.steps, 1);
    // Two tool rounds, then the tool-free recovery request.
    assert_eq!(provider.call_count(), 3);
    assert!(provider.requests().await[2].tools.is_empty());
}

#[tokio::test]
async fn e2e_model_failure_is_a_turn_error() {
    let (runtime, _ws) = runtime_with(Arc::new(DownProvider));

    let outcome = runtime.submit(DEFAULT_SESSION, "hello there").await.unwrap();
    assert!(outcome.error.unwrap().contains("connection refused"));
    assert!(!outcome.exit_requested);

    let events = entries_of(&runtime, EntryKind::Event).await;
    assert!(events.iter().any(|e| e.name() == Some("loop.step.error")));

    // The session keeps working after a failed turn.
    let outcome = runtime.submit(DEFAULT_SESSION, ",tape.info").await.unwrap();
    assert!(outcome.immediate_output.starts_with("tape=tapeloop"));
}

#[tokio::test]
async fn e2e_sessions_are_isolated() {
    let (runtime, _ws) = runtime_with(Arc::new(EchoProvider));

    runtime.submit("alpha", "hello alpha").await.unwrap();
    runtime
        .handle_envelope(Envelope::new("cli", "beta", "hello beta"))
        .await
        .unwrap();

    let alpha = runtime.session("alpha").await.unwrap();
    let beta = runtime.session("cli:beta").await.unwrap();
    assert_ne!(alpha.tape.name(), beta.tape.name());
    assert!(alpha.tape.search("hello beta", 10).await.unwrap().is_empty());
    assert!(!beta.tape.search("hello beta", 10).await.unwrap().is_empty());
}

// ── Tape store ───────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_concurrent_appends_get_consecutive_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn TapeStore> = Arc::new(FileTapeStore::new(dir.path().join("tapes"), dir.path()));
    store.append("main", TapeEntry::message("user", "seed")).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            store
                .append("main", TapeEntry::message("user", format!("m{i}")))
                .await
                .unwrap()
                .id
        }));
    }
    let mut ids = BTreeSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap());
    }
    assert_eq!(ids, (2..=17).collect::<BTreeSet<u64>>());
}

#[tokio::test]
async fn e2e_fork_merge_keeps_prefix_once() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn TapeStore> = Arc::new(FileTapeStore::new(dir.path().join("tapes"), dir.path()));
    let main = TapeService::new(store, "main");
    main.record_user_message("e1").await.unwrap();
    main.record_user_message("e2").await.unwrap();

    let fork = main.fork().await.unwrap();
    fork.record_user_message("f1").await.unwrap();
    fork.record_user_message("f2").await.unwrap();
    assert_eq!(fork.merge_into(&main).await.unwrap(), 2);

    let contents: Vec<String> = main
        .read_entries()
        .await
        .unwrap()
        .iter()
        .filter_map(|e| e.payload_str("content").map(str::to_string))
        .collect();
    assert_eq!(contents, vec!["e1", "e2", "f1", "f2"]);

    let err = fork.merge_into(&main).await.unwrap_err();
    assert!(matches!(err, TapeError::ForkNotFound(_)));
}

#[tokio::test]
async fn e2e_follower_survives_reset() {
    let store = Arc::new(InMemoryTapeStore::new());
    let mut events = store.subscribe();
    let tape = TapeService::new(store.clone(), "follow");

    tape.record_user_message("one").await.unwrap();
    tape.record_user_message("two").await.unwrap();
    tape.reset(false).await.unwrap();

    let mut last_seen = 0u64;
    let mut resets = 0;
    let mut seen_after_reset = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            TapeEvent::Appended { entry, .. } => {
                if resets > 0 {
                    seen_after_reset.push(entry.id);
                }
                assert!(entry.id > last_seen);
                last_seen = entry.id;
            }
            TapeEvent::Reset { .. } => {
                resets += 1;
                last_seen = 0;
            }
            _ => {}
        }
    }
    assert_eq!(resets, 1);
    // The bootstrap anchor re-written after the reset starts over at 1.
    assert_eq!(seen_after_reset.first(), Some(&1));
}

#[tokio::test]
async fn e2e_memory_persists_across_runtimes() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn TapeStore> = Arc::new(FileTapeStore::new(dir.path().join("tapes"), dir.path()));
    let tape = TapeService::new(Arc::clone(&store), "mem");
    let memory = MemoryZone::new(tape.clone());
    memory.ensure().await.unwrap();
    memory.save_long_term("likes tea").await.unwrap();
    memory.append_daily("shipped the parser", None).await.unwrap();

    let reopened_store: Arc<dyn TapeStore> =
        Arc::new(FileTapeStore::new(dir.path().join("tapes"), dir.path()));
    let reopened = MemoryZone::new(TapeService::new(reopened_store, "mem"));
    let snapshot = reopened.read().await.unwrap();
    assert_eq!(snapshot.version, 3);
    assert_eq!(snapshot.long_term, "likes tea");
    assert_eq!(snapshot.dailies.len(), 1);
    assert!(reopened.get_context().await.unwrap().contains("shipped the parser"));
}

#[tokio::test]
async fn e2e_file_runtime_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.home = Some(dir.path().to_path_buf());

    let runtime = Runtime::from_config(config.clone(), dir.path()).unwrap();
    let outcome = runtime.submit(DEFAULT_SESSION, "hello file tape").await.unwrap();
    assert_eq!(outcome.assistant_output, "hello file tape");
    runtime.shutdown().await;

    let reopened = Runtime::from_config(config, dir.path()).unwrap();
    let tapes = reopened.store().list_tapes().await.unwrap();
    assert!(tapes.contains("tapeloop"));

    let handle = reopened.session(DEFAULT_SESSION).await.unwrap();
    let messages = handle.tape.context_messages().await.unwrap();
    assert_eq!(messages.first().unwrap().content, "hello file tape");
    assert_eq!(messages.last().unwrap().content, "hello file tape");
    assert_eq!(messages.len(), 2);
}
