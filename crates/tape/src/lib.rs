//! Tape storage for tapeloop.
//!
//! A tape is the single source of truth for a session: every message, executed
//! command, tool round, loop transition, and memory write is an entry on it.
//!
//! Stores:
//! - **FileTapeStore** — JSONL files under `<home>/tapes` (default)
//! - **InMemoryTapeStore** — ephemeral, for tests
//!
//! On top of a store, [`TapeService`] records session activity on one tape and
//! [`MemoryZone`] keeps versioned notes inside it.

pub mod entry;
pub mod store;
pub mod file_store;
pub mod in_memory;
pub mod service;
pub mod memory;

pub use entry::{
    CommandRecord, EntryKind, LANE_CONTROL, LANE_MAIN, LANE_WORK, META_CONTEXT, META_LANE, META_TS,
    META_VIEW, TapeEntry,
};
pub use file_store::FileTapeStore;
pub use in_memory::InMemoryTapeStore;
pub use memory::{DailyNote, MemorySnapshot, MemoryZone};
pub use service::{AnchorSummary, BOOTSTRAP_ANCHOR, TapeInfo, TapeService};
pub use store::{TapeEvent, TapeStore};
