//! Tape-native memory zone.
//!
//! Memory lives inside the session tape, bracketed by `memory/open` and
//! `memory/seal` anchors carrying the same version number. Every write appends
//! a complete new bracket with version + 1; older brackets stay on the tape as
//! dead history. The authoritative snapshot is the highest-version seal that
//! has a matching open before it.

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tapeloop_core::TapeError;
use tokio::sync::Mutex;
use tracing::info;

use crate::entry::{EntryKind, LANE_CONTROL, META_LANE, META_VIEW, TapeEntry};
use crate::service::TapeService;

pub const MEMORY_ANCHOR_PREFIX: &str = "memory/";
pub const MEMORY_OPEN_ANCHOR: &str = "memory/open";
pub const MEMORY_SEAL_ANCHOR: &str = "memory/seal";
pub const MEMORY_LONG_TERM_EVENT: &str = "memory.long_term";
pub const MEMORY_DAILY_EVENT: &str = "memory.daily";
pub const DEFAULT_DAILY_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_RECENT_DAYS: u32 = 7;

const CONTEXT_HINT: &str = "Use `memory.save` to update long-term memory, \
`memory.daily` to append to daily notes, and `memory.recall` to search past memories.";

/// One day's notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyNote {
    /// `YYYY-MM-DD`
    pub date: String,
    pub content: String,
}

/// Point-in-time view of the memory zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub version: u64,
    pub long_term: String,
    /// Newest date first, at most one note per date
    pub dailies: Vec<DailyNote>,
}

impl MemorySnapshot {
    pub fn get_daily(&self, date: &str) -> Option<&str> {
        self.dailies
            .iter()
            .find(|d| d.date == date)
            .map(|d| d.content.as_str())
    }

    /// Notes dated within `days` of `today`, inclusive.
    pub fn recent_dailies(&self, today: NaiveDate, days: u32) -> Vec<&DailyNote> {
        let cutoff = iso(today - Duration::days(i64::from(days)));
        self.dailies.iter().filter(|d| d.date >= cutoff).collect()
    }

    /// Set or replace the note for `date`, keeping newest-first order.
    pub fn set_daily(&mut self, date: &str, content: String) {
        self.dailies.retain(|d| d.date != date);
        self.dailies.push(DailyNote {
            date: date.to_string(),
            content,
        });
        self.dailies.sort_by(|a, b| b.date.cmp(&a.date));
    }

    /// Drop notes older than `retention_days`. Returns how many were removed.
    pub fn prune(&mut self, today: NaiveDate, retention_days: u32) -> usize {
        let cutoff = iso(today - Duration::days(i64::from(retention_days)));
        let before = self.dailies.len();
        self.dailies.retain(|d| d.date >= cutoff);
        before - self.dailies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.long_term.is_empty() && self.dailies.is_empty()
    }
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Persistent memory stored on a session tape.
pub struct MemoryZone {
    tape: TapeService,
    retention_days: u32,
    recent_days: u32,
    cache: Mutex<Option<MemorySnapshot>>,
}

impl MemoryZone {
    pub fn new(tape: TapeService) -> Self {
        Self {
            tape,
            retention_days: DEFAULT_DAILY_RETENTION_DAYS,
            recent_days: DEFAULT_RECENT_DAYS,
            cache: Mutex::new(None),
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_recent_days(mut self, days: u32) -> Self {
        self.recent_days = days;
        self
    }

    /// Write an empty version-1 zone if the tape has none.
    pub async fn ensure(&self) -> Result<MemorySnapshot, TapeError> {
        let mut cache = self.cache.lock().await;
        if let Some(snapshot) = self.load().await? {
            *cache = Some(snapshot.clone());
            return Ok(snapshot);
        }
        let snapshot = MemorySnapshot {
            version: 1,
            ..MemorySnapshot::default()
        };
        self.write_zone(&snapshot).await?;
        info!(tape = self.tape.name(), "memory.zone.created version=1");
        *cache = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Drop the cached snapshot and [`ensure`](Self::ensure) again. Used after
    /// the tape underneath was reset.
    pub async fn ensure_fresh(&self) -> Result<MemorySnapshot, TapeError> {
        self.cache.lock().await.take();
        self.ensure().await
    }

    /// The latest snapshot; scanned once, then served from cache.
    pub async fn read(&self) -> Result<MemorySnapshot, TapeError> {
        let mut cache = self.cache.lock().await;
        if let Some(snapshot) = cache.as_ref() {
            return Ok(snapshot.clone());
        }
        let snapshot = self.load().await?.unwrap_or_default();
        *cache = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Replace long-term memory.
    pub async fn save_long_term(&self, content: &str) -> Result<MemorySnapshot, TapeError> {
        let snapshot = self
            .update(|snap| {
                snap.long_term = content.to_string();
                true
            })
            .await?;
        info!(version = snapshot.version, "memory.long_term.saved");
        Ok(snapshot)
    }

    /// Append to the note for `date` (today when `None`).
    pub async fn append_daily(&self, content: &str, date: Option<NaiveDate>) -> Result<MemorySnapshot, TapeError> {
        let date = iso(date.unwrap_or_else(today));
        let snapshot = self
            .update(|snap| {
                let merged = match snap.get_daily(&date) {
                    Some(existing) => format!("{existing}\n{content}"),
                    None => format!("# {date}\n\n{content}"),
                };
                snap.set_daily(&date, merged);
                true
            })
            .await?;
        info!(date = %date, version = snapshot.version, "memory.daily.appended");
        Ok(snapshot)
    }

    /// Write an empty zone.
    pub async fn clear(&self) -> Result<MemorySnapshot, TapeError> {
        let snapshot = self
            .update(|snap| {
                snap.long_term.clear();
                snap.dailies.clear();
                true
            })
            .await?;
        info!(version = snapshot.version, "memory.cleared");
        Ok(snapshot)
    }

    /// Drop daily notes past retention. Writes a new zone only if something was removed.
    pub async fn prune(&self) -> Result<usize, TapeError> {
        let mut removed = 0;
        let retention = self.retention_days;
        let snapshot = self
            .update(|snap| {
                removed = snap.prune(today(), retention);
                removed > 0
            })
            .await?;
        if removed > 0 {
            info!(removed, version = snapshot.version, "memory.pruned");
        }
        Ok(removed)
    }

    /// Prompt-ready rendering of memory, or an empty string if nothing is stored.
    pub async fn get_context(&self) -> Result<String, TapeError> {
        let snapshot = self.read().await?;
        Ok(render_context(&snapshot, today(), self.recent_days))
    }

    /// Long-term memory plus the last `days` of notes, filtered by `query`.
    pub async fn recall(&self, query: Option<&str>, days: u32) -> Result<String, TapeError> {
        let snapshot = self.read().await?;
        Ok(render_recall(&snapshot, today(), days, query))
    }

    /// Apply `change` to the current snapshot; when it reports a change, bump
    /// the version and write a new zone.
    async fn update<F>(&self, change: F) -> Result<MemorySnapshot, TapeError>
    where
        F: FnOnce(&mut MemorySnapshot) -> bool,
    {
        let mut cache = self.cache.lock().await;
        let mut snapshot = match cache.take() {
            Some(s) => s,
            None => self.load().await?.unwrap_or_default(),
        };
        let original = snapshot.clone();
        if !change(&mut snapshot) {
            *cache = Some(original.clone());
            return Ok(original);
        }
        snapshot.version += 1;
        if let Err(e) = self.write_zone(&snapshot).await {
            *cache = Some(original);
            return Err(e);
        }
        *cache = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn write_zone(&self, snapshot: &MemorySnapshot) -> Result<(), TapeError> {
        let now = Utc::now().to_rfc3339();
        let hidden = |entry: TapeEntry| entry.with_meta(META_LANE, LANE_CONTROL).with_meta(META_VIEW, false);

        let mut entries = vec![hidden(TapeEntry::anchor(
            MEMORY_OPEN_ANCHOR,
            json!({ "version": snapshot.version }),
        ))];
        if !snapshot.long_term.is_empty() {
            entries.push(hidden(TapeEntry::event(
                MEMORY_LONG_TERM_EVENT,
                json!({ "content": snapshot.long_term, "updated_at": now }),
            )));
        }
        for daily in &snapshot.dailies {
            entries.push(hidden(TapeEntry::event(
                MEMORY_DAILY_EVENT,
                json!({ "date": daily.date, "content": daily.content, "updated_at": now }),
            )));
        }
        entries.push(hidden(TapeEntry::anchor(
            MEMORY_SEAL_ANCHOR,
            json!({ "version": snapshot.version }),
        )));

        self.tape.append_batch(entries).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<MemorySnapshot>, TapeError> {
        Ok(load_snapshot(&self.tape.read_entries().await?))
    }
}

fn anchor_version(entry: &TapeEntry, name: &str) -> Option<u64> {
    if entry.kind != EntryKind::Anchor || entry.name() != Some(name) {
        return None;
    }
    entry.payload.get("state")?.get("version")?.as_u64()
}

/// Reconstruct the authoritative snapshot from tape entries.
pub fn load_snapshot(entries: &[TapeEntry]) -> Option<MemorySnapshot> {
    let mut seals: Vec<(usize, u64)> = entries
        .iter()
        .enumerate()
        .filter_map(|(idx, e)| anchor_version(e, MEMORY_SEAL_ANCHOR).map(|v| (idx, v)))
        .collect();
    // Highest version first; a seal without its open is skipped.
    seals.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));

    seals.into_iter().find_map(|(seal_idx, version)| {
        let open_idx = entries[..seal_idx]
            .iter()
            .rposition(|e| anchor_version(e, MEMORY_OPEN_ANCHOR) == Some(version))?;
        Some(parse_zone(&entries[open_idx + 1..seal_idx], version))
    })
}

fn parse_zone(entries: &[TapeEntry], version: u64) -> MemorySnapshot {
    let mut snapshot = MemorySnapshot {
        version,
        ..MemorySnapshot::default()
    };
    for entry in entries.iter().filter(|e| e.kind == EntryKind::Event) {
        let Some(data) = entry.payload.get("data") else {
            continue;
        };
        let content = data.get("content").and_then(Value::as_str).unwrap_or_default();
        match entry.name() {
            Some(MEMORY_LONG_TERM_EVENT) => snapshot.long_term = content.to_string(),
            Some(MEMORY_DAILY_EVENT) => {
                if let Some(date) = data.get("date").and_then(Value::as_str) {
                    snapshot.set_daily(date, content.to_string());
                }
            }
            _ => {}
        }
    }
    snapshot
}

fn render_context(snapshot: &MemorySnapshot, today: NaiveDate, recent_days: u32) -> String {
    let today_iso = iso(today);
    let mut parts = Vec::new();

    if !snapshot.long_term.is_empty() {
        parts.push(format!("## Long-term Memory\n{}", snapshot.long_term));
    }
    if let Some(content) = snapshot.get_daily(&today_iso).filter(|c| !c.is_empty()) {
        parts.push(format!("## Today's Notes\n{content}"));
    }
    let recent: Vec<&DailyNote> = snapshot
        .recent_dailies(today, recent_days)
        .into_iter()
        .filter(|d| d.date != today_iso)
        .collect();
    if !recent.is_empty() {
        parts.push(render_dailies("## Recent Notes", &recent));
    }

    if parts.is_empty() {
        return String::new();
    }
    format!("{CONTEXT_HINT}\n\n{}", parts.join("\n\n"))
}

fn render_recall(snapshot: &MemorySnapshot, today: NaiveDate, days: u32, query: Option<&str>) -> String {
    let mut parts = Vec::new();
    if !snapshot.long_term.is_empty() {
        parts.push(format!("## Long-term Memory\n{}", snapshot.long_term));
    }
    let dailies = snapshot.recent_dailies(today, days);
    if !dailies.is_empty() {
        parts.push(render_dailies("## Recent Daily Notes", &dailies));
    }
    if parts.is_empty() {
        return "(no memories stored)".to_string();
    }

    let full = parts.join("\n\n");
    let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
        return full;
    };
    let needle = query.to_lowercase();
    let matches: Vec<&str> = full
        .lines()
        .filter(|line| line.to_lowercase().contains(&needle))
        .collect();
    if matches.is_empty() {
        format!("(no matches for '{query}')\n\nFull memory:\n{full}")
    } else {
        matches.join("\n")
    }
}

fn render_dailies(heading: &str, dailies: &[&DailyNote]) -> String {
    let mut lines = vec![heading.to_string()];
    for daily in dailies {
        lines.push(format!("### {}", daily.date));
        lines.push(daily.content.clone());
    }
    lines.join("\n")
}
