//! In-memory tape store — useful for testing and ephemeral sessions.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tapeloop_core::TapeError;
use tokio::sync::{Mutex, broadcast};

use crate::entry::TapeEntry;
use crate::store::{TapeEvent, TapeStore, archive_stamp, assign_ids, fork_name};

#[derive(Default)]
struct Tapes {
    live: HashMap<String, Vec<TapeEntry>>,
    archived: HashMap<String, Vec<TapeEntry>>,
    forks: HashMap<String, u64>,
}

/// A tape store that keeps every tape in a `HashMap`.
pub struct InMemoryTapeStore {
    tapes: Mutex<Tapes>,
    events: broadcast::Sender<TapeEvent>,
}

impl InMemoryTapeStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            tapes: Mutex::new(Tapes::default()),
            events,
        }
    }

    /// Entries moved aside by `archive`, keyed by archive location.
    pub async fn archived(&self, location: &str) -> Option<Vec<TapeEntry>> {
        self.tapes.lock().await.archived.get(location).cloned()
    }
}

impl Default for InMemoryTapeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn push(tapes: &mut Tapes, tape: &str, entries: Vec<TapeEntry>) -> Vec<TapeEntry> {
    let live = tapes.live.entry(tape.to_string()).or_default();
    let next = live.last().map(|e| e.id + 1).unwrap_or(1);
    let stored = assign_ids(entries, next);
    live.extend(stored.iter().cloned());
    stored
}

#[async_trait]
impl TapeStore for InMemoryTapeStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append_batch(&self, tape: &str, entries: Vec<TapeEntry>) -> Result<Vec<TapeEntry>, TapeError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let stored = push(&mut *self.tapes.lock().await, tape, entries);
        for entry in &stored {
            let _ = self.events.send(TapeEvent::Appended {
                tape: tape.to_string(),
                entry: entry.clone(),
            });
        }
        Ok(stored)
    }

    async fn read(&self, tape: &str) -> Result<Option<Vec<TapeEntry>>, TapeError> {
        Ok(self.tapes.lock().await.live.get(tape).cloned())
    }

    async fn fork(&self, tape: &str) -> Result<String, TapeError> {
        let mut tapes = self.tapes.lock().await;
        let entries = tapes.live.get(tape).cloned().unwrap_or_default();
        let boundary = entries.last().map(|e| e.id + 1).unwrap_or(1);
        let fork = fork_name(tape);
        tapes.live.insert(fork.clone(), entries);
        tapes.forks.insert(fork.clone(), boundary);
        drop(tapes);

        let _ = self.events.send(TapeEvent::Forked {
            source: tape.to_string(),
            fork: fork.clone(),
        });
        Ok(fork)
    }

    async fn merge(&self, fork: &str, target: &str) -> Result<usize, TapeError> {
        let mut tapes = self.tapes.lock().await;
        let boundary = tapes
            .forks
            .remove(fork)
            .ok_or_else(|| TapeError::ForkNotFound(fork.to_string()))?;
        let pending: Vec<TapeEntry> = tapes
            .live
            .remove(fork)
            .unwrap_or_default()
            .into_iter()
            .filter(|e| e.id >= boundary)
            .collect();
        let moved = pending.len();
        if !pending.is_empty() {
            push(&mut tapes, target, pending);
        }
        drop(tapes);

        let _ = self.events.send(TapeEvent::Merged {
            fork: fork.to_string(),
            target: target.to_string(),
            entries: moved,
        });
        Ok(moved)
    }

    async fn reset(&self, tape: &str) -> Result<(), TapeError> {
        self.tapes.lock().await.live.remove(tape);
        let _ = self.events.send(TapeEvent::Reset { tape: tape.to_string() });
        Ok(())
    }

    async fn archive(&self, tape: &str) -> Result<Option<String>, TapeError> {
        let mut tapes = self.tapes.lock().await;
        let Some(entries) = tapes.live.remove(tape) else {
            return Ok(None);
        };
        let location = format!("memory:{tape}.{}", archive_stamp());
        tapes.archived.insert(location.clone(), entries);
        drop(tapes);

        let _ = self.events.send(TapeEvent::Archived {
            tape: tape.to_string(),
            location: location.clone(),
        });
        Ok(Some(location))
    }

    async fn list_tapes(&self) -> Result<BTreeSet<String>, TapeError> {
        Ok(self.tapes.lock().await.live.keys().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<TapeEvent> {
        self.events.subscribe()
    }
}
