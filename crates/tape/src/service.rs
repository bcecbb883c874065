//! High-level tape service.
//!
//! `TapeService` binds a store to one tape name and knows how each kind of
//! session activity is recorded: which lane it goes to, whether the human sees
//! it, and whether it counts toward model context.

use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tapeloop_core::{Message, Role, TapeError};

use crate::entry::{
    CommandRecord, EntryKind, LANE_CONTROL, LANE_MAIN, LANE_WORK, META_CONTEXT, META_LANE, META_TS,
    META_VIEW, TapeEntry,
};
use crate::memory::MEMORY_ANCHOR_PREFIX;
use crate::store::TapeStore;

/// Anchor written on an empty tape.
pub const BOOTSTRAP_ANCHOR: &str = "session/start";

/// Runtime tape info summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TapeInfo {
    pub name: String,
    pub entries: usize,
    pub anchors: usize,
    pub last_anchor: Option<String>,
}

/// One anchor as listed by [`TapeService::anchors`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnchorSummary {
    pub id: u64,
    pub name: String,
    pub state: Map<String, Value>,
}

/// Tape helper with session-specific recording operations.
#[derive(Clone)]
pub struct TapeService {
    store: Arc<dyn TapeStore>,
    name: String,
}

impl TapeService {
    pub fn new(store: Arc<dyn TapeStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn TapeStore> {
        &self.store
    }

    /// All entries, or an empty list if the tape was never written.
    pub async fn read_entries(&self) -> Result<Vec<TapeEntry>, TapeError> {
        Ok(self.store.read(&self.name).await?.unwrap_or_default())
    }

    /// Append one entry, stamping `meta.ts` if the caller did not.
    pub async fn append(&self, mut entry: TapeEntry) -> Result<TapeEntry, TapeError> {
        if !entry.meta.contains_key(META_TS) {
            entry.meta.insert(META_TS.into(), Value::String(chrono::Utc::now().to_rfc3339()));
        }
        self.store.append(&self.name, entry).await
    }

    /// Append several entries as one batch with consecutive IDs.
    pub async fn append_batch(&self, entries: Vec<TapeEntry>) -> Result<Vec<TapeEntry>, TapeError> {
        let ts = Value::String(chrono::Utc::now().to_rfc3339());
        let entries = entries
            .into_iter()
            .map(|mut e| {
                e.meta.entry(META_TS).or_insert_with(|| ts.clone());
                e
            })
            .collect();
        self.store.append_batch(&self.name, entries).await
    }

    // --- Recording ---

    /// The raw text as the human (or channel) typed it.
    pub async fn record_user_message(&self, content: &str) -> Result<TapeEntry, TapeError> {
        self.append(
            TapeEntry::message(Role::User.as_str(), content)
                .with_meta(META_LANE, LANE_MAIN)
                .with_meta(META_CONTEXT, false),
        )
        .await
    }

    /// Text the model should see as the next user turn. Hidden from the human.
    pub async fn record_context_message(&self, content: &str) -> Result<TapeEntry, TapeError> {
        self.append(
            TapeEntry::message(Role::User.as_str(), content)
                .with_meta(META_LANE, LANE_WORK)
                .with_meta(META_CONTEXT, true)
                .with_meta(META_VIEW, false),
        )
        .await
    }

    pub async fn record_assistant_message(&self, content: &str) -> Result<TapeEntry, TapeError> {
        self.append(
            TapeEntry::message(Role::Assistant.as_str(), content)
                .with_meta(META_LANE, LANE_MAIN)
                .with_meta(META_CONTEXT, true),
        )
        .await
    }

    /// Record one executed action. `meta` overrides the default main-lane meta.
    pub async fn record_command(
        &self,
        record: &CommandRecord,
        meta: Option<Map<String, Value>>,
    ) -> Result<TapeEntry, TapeError> {
        let entry = TapeEntry::command(record)
            .with_meta(META_LANE, LANE_MAIN)
            .with_meta(META_CONTEXT, false);
        self.append(entry.with_meta_map(meta.unwrap_or_default())).await
    }

    pub async fn record_loop(&self, loop_id: &str, status: &str) -> Result<TapeEntry, TapeError> {
        self.append(
            TapeEntry::loop_status(loop_id, status)
                .with_meta(META_LANE, LANE_CONTROL)
                .with_meta(META_VIEW, false),
        )
        .await
    }

    pub async fn record_tool_call(&self, calls: Vec<Value>) -> Result<TapeEntry, TapeError> {
        self.append(TapeEntry::tool_calls(calls).with_meta(META_LANE, LANE_WORK)).await
    }

    pub async fn record_tool_result(&self, results: Vec<Value>) -> Result<TapeEntry, TapeError> {
        self.append(TapeEntry::tool_results(results).with_meta(META_LANE, LANE_WORK)).await
    }

    pub async fn append_event(&self, name: &str, data: Value) -> Result<TapeEntry, TapeError> {
        self.append(
            TapeEntry::event(name, data)
                .with_meta(META_LANE, LANE_CONTROL)
                .with_meta(META_VIEW, false),
        )
        .await
    }

    /// Write a named anchor. Context for the model restarts after it.
    pub async fn handoff(&self, name: &str, state: Value) -> Result<TapeEntry, TapeError> {
        self.append(TapeEntry::anchor(name, state)).await
    }

    /// Write `session/start` if the tape has no anchors yet.
    pub async fn ensure_bootstrap_anchor(&self) -> Result<(), TapeError> {
        if self.read_entries().await?.iter().any(TapeEntry::is_anchor) {
            return Ok(());
        }
        self.handoff(BOOTSTRAP_ANCHOR, json!({ "owner": "human" })).await?;
        Ok(())
    }

    // --- Queries ---

    pub async fn info(&self) -> Result<TapeInfo, TapeError> {
        let entries = self.read_entries().await?;
        let anchors: Vec<&TapeEntry> = entries.iter().filter(|e| e.is_anchor()).collect();
        Ok(TapeInfo {
            name: self.name.clone(),
            entries: entries.len(),
            anchors: anchors.len(),
            last_anchor: anchors.last().and_then(|e| e.name()).map(str::to_string),
        })
    }

    /// The last `limit` anchors, oldest first.
    pub async fn anchors(&self, limit: usize) -> Result<Vec<AnchorSummary>, TapeError> {
        let anchors: Vec<AnchorSummary> = self
            .read_entries()
            .await?
            .into_iter()
            .filter(TapeEntry::is_anchor)
            .map(|e| AnchorSummary {
                id: e.id,
                name: e.name().unwrap_or("-").to_string(),
                state: match e.payload.get("state") {
                    Some(Value::Object(map)) => map.clone(),
                    _ => Map::new(),
                },
            })
            .collect();
        let skip = anchors.len().saturating_sub(limit);
        Ok(anchors.into_iter().skip(skip).collect())
    }

    /// Case-insensitive substring search over kind, payload, and meta.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<TapeEntry>, TapeError> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let needle = query.to_lowercase();
        let mut results = Vec::new();
        for entry in self.read_entries().await? {
            let haystack = format!(
                "{} {} {}",
                entry.kind,
                Value::Object(entry.payload.clone()),
                Value::Object(entry.meta.clone())
            )
            .to_lowercase();
            if haystack.contains(&needle) {
                results.push(entry);
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }

    /// Entries strictly between the last `start` anchor and the next `end` anchor.
    pub async fn between_anchors(
        &self,
        start: &str,
        end: &str,
        kinds: &[EntryKind],
    ) -> Result<Vec<TapeEntry>, TapeError> {
        let entries = self.read_entries().await?;
        let Some(from) = entries
            .iter()
            .rposition(|e| e.is_anchor() && e.name() == Some(start))
        else {
            return Ok(Vec::new());
        };
        let slice = &entries[from + 1..];
        let until = slice
            .iter()
            .position(|e| e.is_anchor() && e.name() == Some(end))
            .unwrap_or(slice.len());
        Ok(filter_kinds(&slice[..until], kinds))
    }

    /// Entries after the last anchor named `anchor`.
    pub async fn after_anchor(&self, anchor: &str, kinds: &[EntryKind]) -> Result<Vec<TapeEntry>, TapeError> {
        let entries = self.read_entries().await?;
        match entries.iter().rposition(|e| e.is_anchor() && e.name() == Some(anchor)) {
            Some(idx) => Ok(filter_kinds(&entries[idx + 1..], kinds)),
            None => Ok(Vec::new()),
        }
    }

    /// Entries after the most recent anchor of any name.
    pub async fn from_last_anchor(&self, kinds: &[EntryKind]) -> Result<Vec<TapeEntry>, TapeError> {
        let entries = self.read_entries().await?;
        let start = entries.iter().rposition(TapeEntry::is_anchor).map(|i| i + 1).unwrap_or(0);
        Ok(filter_kinds(&entries[start..], kinds))
    }

    /// Context-lane messages after the last handoff, as model messages.
    ///
    /// Memory zone anchors do not count as handoffs.
    pub async fn context_messages(&self) -> Result<Vec<Message>, TapeError> {
        let entries = self.read_entries().await?;
        let start = entries
            .iter()
            .rposition(|e| {
                e.is_anchor() && !e.name().is_some_and(|n| n.starts_with(MEMORY_ANCHOR_PREFIX))
            })
            .map(|i| i + 1)
            .unwrap_or(0);

        Ok(entries[start..]
            .iter()
            .filter(|e| e.kind == EntryKind::Message && e.is_context())
            .filter_map(|e| {
                let role = Role::parse(e.payload_str("role")?)?;
                let content = e.payload_str("content")?;
                Some(match role {
                    Role::Assistant => Message::assistant(content),
                    Role::System => Message::system(content),
                    _ => Message::user(content),
                })
            })
            .collect())
    }

    // --- Lifecycle ---

    /// Clear the tape (archiving it first when asked) and re-bootstrap.
    pub async fn reset(&self, archive: bool) -> Result<String, TapeError> {
        let archived = if archive {
            self.store.archive(&self.name).await?
        } else {
            None
        };
        self.store.reset(&self.name).await?;
        self.ensure_bootstrap_anchor().await?;
        Ok(match archived {
            Some(location) => format!("archived: {location}"),
            None => "ok".to_string(),
        })
    }

    /// Fork this tape; the returned service writes to the fork.
    pub async fn fork(&self) -> Result<TapeService, TapeError> {
        let fork = self.store.fork(&self.name).await?;
        Ok(Self::new(Arc::clone(&self.store), fork))
    }

    /// Merge this fork back into `target`. Returns how many entries moved.
    pub async fn merge_into(&self, target: &TapeService) -> Result<usize, TapeError> {
        self.store.merge(&self.name, &target.name).await
    }
}

fn filter_kinds(entries: &[TapeEntry], kinds: &[EntryKind]) -> Vec<TapeEntry> {
    entries
        .iter()
        .filter(|e| kinds.is_empty() || kinds.contains(&e.kind))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryTapeStore;

    fn service() -> TapeService {
        TapeService::new(Arc::new(InMemoryTapeStore::new()), "main")
    }

    #[tokio::test]
    async fn bootstrap_anchor_written_once() {
        let tape = service();
        tape.ensure_bootstrap_anchor().await.unwrap();
        tape.ensure_bootstrap_anchor().await.unwrap();
        let info = tape.info().await.unwrap();
        assert_eq!(info.anchors, 1);
        assert_eq!(info.last_anchor.as_deref(), Some(BOOTSTRAP_ANCHOR));
    }

    #[tokio::test]
    async fn context_messages_follow_last_handoff() {
        let tape = service();
        tape.ensure_bootstrap_anchor().await.unwrap();
        tape.record_context_message("before").await.unwrap();
        tape.handoff("phase/2", json!({})).await.unwrap();
        tape.record_user_message("raw line").await.unwrap();
        tape.record_context_message("after").await.unwrap();
        tape.record_assistant_message("answer").await.unwrap();
        tape.handoff("memory/open", json!({"version": 1})).await.unwrap();

        let messages = tape.context_messages().await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["after", "answer"]);
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn reset_with_archive_reports_location() {
        let tape = service();
        tape.record_user_message("hello").await.unwrap();
        let result = tape.reset(true).await.unwrap();
        assert!(result.starts_with("archived: memory:main."));

        let entries = tape.read_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name(), Some(BOOTSTRAP_ANCHOR));
        assert_eq!(tape.reset(false).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn search_is_case_insensitive_and_limited() {
        let tape = service();
        tape.record_user_message("Hello there").await.unwrap();
        tape.record_user_message("hello again").await.unwrap();
        tape.record_user_message("bye").await.unwrap();
        assert_eq!(tape.search("HELLO", 20).await.unwrap().len(), 2);
        assert_eq!(tape.search("hello", 1).await.unwrap().len(), 1);
        assert!(tape.search("", 20).await.unwrap().is_empty());
        assert_eq!(tape.search("anchor", 20).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn anchors_returns_most_recent() {
        let tape = service();
        for i in 0..5 {
            tape.handoff(&format!("a{i}"), json!({"i": i})).await.unwrap();
        }
        let anchors = tape.anchors(2).await.unwrap();
        let names: Vec<&str> = anchors.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a3", "a4"]);
        assert_eq!(anchors[1].state["i"], json!(4));
    }

    #[tokio::test]
    async fn anchor_range_queries() {
        let tape = service();
        tape.handoff("start", json!({})).await.unwrap();
        tape.record_user_message("one").await.unwrap();
        tape.append_event("tick", json!({})).await.unwrap();
        tape.handoff("end", json!({})).await.unwrap();
        tape.record_user_message("two").await.unwrap();

        let between = tape.between_anchors("start", "end", &[]).await.unwrap();
        assert_eq!(between.len(), 2);
        let messages = tape
            .between_anchors("start", "end", &[EntryKind::Message])
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(tape.after_anchor("start", &[EntryKind::Message]).await.unwrap().len(), 2);
        assert_eq!(tape.from_last_anchor(&[]).await.unwrap().len(), 1);
        assert!(tape.after_anchor("missing", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fork_and_merge_through_service() {
        let main = service();
        main.record_user_message("base").await.unwrap();
        let fork = main.fork().await.unwrap();
        assert_ne!(fork.name(), main.name());
        fork.record_assistant_message("from fork").await.unwrap();
        assert_eq!(fork.merge_into(&main).await.unwrap(), 1);
        assert_eq!(main.read_entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn command_meta_override_applies() {
        let tape = service();
        let record = CommandRecord {
            name: "done".into(),
            intent: "$done".into(),
            status: "ok".into(),
            stdout: "done".into(),
            stderr: String::new(),
            exit_code: 0,
            elapsed_ms: 0,
            origin: "assistant".into(),
        };
        let mut meta = Map::new();
        meta.insert(META_LANE.into(), json!(LANE_CONTROL));
        meta.insert(META_VIEW.into(), json!(false));
        let entry = tape.record_command(&record, Some(meta)).await.unwrap();
        assert_eq!(entry.lane(), LANE_CONTROL);
        assert!(!entry.is_visible());
        assert!(entry.meta.contains_key(META_TS));
    }
}
