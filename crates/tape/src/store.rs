//! The `TapeStore` trait and the event stream it publishes.
//!
//! A store manages many named tapes. Implementations must serialize appends
//! to the same tape so IDs stay gap-free and strictly increasing; there is no
//! ordering guarantee across tapes.

use async_trait::async_trait;
use std::collections::BTreeSet;
use tapeloop_core::TapeError;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::entry::TapeEntry;

/// Change notifications published by a store.
///
/// Followers subscribe instead of polling. Entries moved by a merge are
/// reported once as [`TapeEvent::Merged`], not re-announced as appends.
#[derive(Debug, Clone)]
pub enum TapeEvent {
    Appended { tape: String, entry: TapeEntry },
    Forked { source: String, fork: String },
    Merged { fork: String, target: String, entries: usize },
    /// The tape was cleared; its ID sequence restarts at 1
    Reset { tape: String },
    Archived { tape: String, location: String },
}

impl TapeEvent {
    /// The tape this event is about (the target, for merges).
    pub fn tape(&self) -> &str {
        match self {
            TapeEvent::Appended { tape, .. } => tape,
            TapeEvent::Forked { source, .. } => source,
            TapeEvent::Merged { target, .. } => target,
            TapeEvent::Reset { tape } => tape,
            TapeEvent::Archived { tape, .. } => tape,
        }
    }
}

/// Durable, per-tape append-only storage.
#[async_trait]
pub trait TapeStore: Send + Sync {
    /// A short backend name ("file", "memory").
    fn name(&self) -> &str;

    /// Append entries as one batch, assigning consecutive IDs.
    async fn append_batch(&self, tape: &str, entries: Vec<TapeEntry>) -> Result<Vec<TapeEntry>, TapeError>;

    /// Append one entry and return it with its ID filled in.
    async fn append(&self, tape: &str, entry: TapeEntry) -> Result<TapeEntry, TapeError> {
        self.append_batch(tape, vec![entry])
            .await?
            .pop()
            .ok_or_else(|| TapeError::InvalidEntry("append stored no entry".into()))
    }

    /// All entries in ID order, or `None` if the tape was never created.
    async fn read(&self, tape: &str) -> Result<Option<Vec<TapeEntry>>, TapeError>;

    /// Copy the tape into a new fork and remember the copy boundary.
    async fn fork(&self, tape: &str) -> Result<String, TapeError>;

    /// Append the fork's post-boundary entries to `target`, then delete the fork.
    ///
    /// Returns how many entries were moved. A fork can be merged once; a
    /// second merge fails with [`TapeError::ForkNotFound`].
    async fn merge(&self, fork: &str, target: &str) -> Result<usize, TapeError>;

    /// Delete every entry; the next append gets ID 1.
    async fn reset(&self, tape: &str) -> Result<(), TapeError>;

    /// Move the tape aside under a timestamped name and clear the live tape.
    /// Returns the archive location, or `None` if the tape did not exist.
    async fn archive(&self, tape: &str) -> Result<Option<String>, TapeError>;

    async fn list_tapes(&self) -> Result<BTreeSet<String>, TapeError>;

    fn subscribe(&self) -> broadcast::Receiver<TapeEvent>;
}

/// Name for a new fork of `tape`: `<tape>__<8 hex>`.
pub(crate) fn fork_name(tape: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{tape}__{}", &suffix[..8])
}

/// Timestamp suffix used for archive names.
pub(crate) fn archive_stamp() -> String {
    chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Give each entry the next ID in sequence starting at `next`.
pub(crate) fn assign_ids(entries: Vec<TapeEntry>, next: u64) -> Vec<TapeEntry> {
    entries
        .into_iter()
        .enumerate()
        .map(|(offset, mut entry)| {
            entry.id = next + offset as u64;
            entry
        })
        .collect()
}
