//! File-based tape store — one JSON-lines file per tape.
//!
//! Storage location: `<home>/tapes/<workspace-hash>__<encoded-tape>.jsonl`. The hash
//! keeps tapes from different workspaces apart even when their names match.
//!
//! Tape names are percent-encoded into the file stem (`.` included), so two
//! distinct names never share a file and live stems never contain a dot.
//!
//! Every append opens the file in append mode, writes whole lines, and syncs
//! before returning. Reads skip corrupted lines with a warning instead of
//! failing the whole tape. A torn trailing line left by an interrupted write
//! is terminated before the first append so new entries start on a fresh line.
//!
//! A fork's copy boundary is also written to `<fork-stem>.fork`, so a fork
//! can be merged by a later process.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tapeloop_core::TapeError;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::entry::TapeEntry;
use crate::store::{TapeEvent, TapeStore, archive_stamp, assign_ids, fork_name};

const EXTENSION: &str = "jsonl";
const FORK_MARKER: &str = "fork";

/// Bookkeeping shared by every tape in the store, guarded by one lock.
#[derive(Default)]
struct StoreState {
    /// Cached next ID per tape, filled from the file tail on first use
    next_ids: HashMap<String, u64>,
    /// fork name -> first ID written after the fork
    forks: HashMap<String, u64>,
}

/// A tape store backed by JSONL files in one directory.
pub struct FileTapeStore {
    dir: PathBuf,
    workspace_hash: String,
    state: Mutex<StoreState>,
    events: broadcast::Sender<TapeEvent>,
}

impl FileTapeStore {
    /// Create a store rooted at `dir` for tapes belonging to `workspace`.
    ///
    /// The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>, workspace: &Path) -> Self {
        let (events, _) = broadcast::channel(256);
        let dir = dir.into();
        let workspace_hash = Self::workspace_hash(workspace);
        debug!(dir = %dir.display(), workspace = %workspace_hash, "File tape store opened");
        Self {
            dir,
            workspace_hash,
            state: Mutex::new(StoreState::default()),
            events,
        }
    }

    /// First 16 hex chars of the SHA-256 of the canonical workspace path.
    pub fn workspace_hash(workspace: &Path) -> String {
        let resolved = std::fs::canonicalize(workspace).unwrap_or_else(|_| workspace.to_path_buf());
        let digest = Sha256::digest(resolved.to_string_lossy().as_bytes());
        hex::encode(digest)[..16].to_string()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the live file for `tape`.
    pub fn tape_path(&self, tape: &str) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", self.file_stem(tape)))
    }

    fn file_stem(&self, tape: &str) -> String {
        format!("{}__{}", self.workspace_hash, encode_name(tape))
    }

    fn fork_marker_path(&self, fork: &str) -> PathBuf {
        self.dir.join(format!("{}.{FORK_MARKER}", self.file_stem(fork)))
    }

    async fn read_file(&self, tape: &str) -> Result<Option<Vec<TapeEntry>>, TapeError> {
        let path = self.tape_path(tape);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TapeError::io(tape, e)),
        };

        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<TapeEntry>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(tape, error = %e, "Skipping corrupted tape entry");
                    None
                }
            })
            .collect();
        Ok(Some(entries))
    }

    async fn write_lines(&self, tape: &str, entries: &[TapeEntry]) -> Result<(), TapeError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TapeError::io(tape, e))?;

        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.tape_path(tape))
            .await
            .map_err(|e| TapeError::io(tape, e))?;
        file.write_all(buf.as_bytes()).await.map_err(|e| TapeError::io(tape, e))?;
        file.sync_data().await.map_err(|e| TapeError::io(tape, e))?;
        Ok(())
    }

    async fn next_id(&self, state: &mut StoreState, tape: &str) -> Result<u64, TapeError> {
        if let Some(next) = state.next_ids.get(tape) {
            return Ok(*next);
        }
        self.terminate_torn_tail(tape).await?;
        let next = self
            .read_file(tape)
            .await?
            .and_then(|entries| entries.last().map(|e| e.id + 1))
            .unwrap_or(1);
        state.next_ids.insert(tape.to_string(), next);
        Ok(next)
    }

    /// Close a trailing line left unterminated by an interrupted write.
    ///
    /// The fragment stays on disk and is skipped on read.
    async fn terminate_torn_tail(&self, tape: &str) -> Result<(), TapeError> {
        let io = |e| TapeError::io(tape, e);
        let mut file = match tokio::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .open(self.tape_path(tape))
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io(e)),
        };
        let len = file.metadata().await.map_err(io)?.len();
        if len == 0 {
            return Ok(());
        }
        file.seek(SeekFrom::Start(len - 1)).await.map_err(io)?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last).await.map_err(io)?;
        if last[0] != b'\n' {
            warn!(tape, "Terminating torn trailing line");
            file.write_all(b"\n").await.map_err(io)?;
            file.sync_data().await.map_err(io)?;
        }
        Ok(())
    }

    /// Copy boundary recorded for `fork`, from this process or from its marker file.
    async fn fork_boundary(&self, state: &StoreState, fork: &str) -> Result<u64, TapeError> {
        if let Some(boundary) = state.forks.get(fork) {
            return Ok(*boundary);
        }
        let marker = match tokio::fs::read_to_string(self.fork_marker_path(fork)).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TapeError::ForkNotFound(fork.to_string()));
            }
            Err(e) => return Err(TapeError::io(fork, e)),
        };
        marker
            .trim()
            .parse()
            .map_err(|_| TapeError::InvalidEntry(format!("bad fork marker for '{fork}': {marker:?}")))
    }

    async fn remove_path(&self, tape: &str, path: PathBuf) -> Result<bool, TapeError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TapeError::io(tape, e)),
        }
    }

    /// Append under an already-held lock.
    async fn append_locked(
        &self,
        state: &mut StoreState,
        tape: &str,
        entries: Vec<TapeEntry>,
    ) -> Result<Vec<TapeEntry>, TapeError> {
        let next = self.next_id(state, tape).await?;
        let stored = assign_ids(entries, next);
        self.write_lines(tape, &stored).await?;
        state.next_ids.insert(tape.to_string(), next + stored.len() as u64);
        Ok(stored)
    }

    async fn remove_file(&self, tape: &str) -> Result<bool, TapeError> {
        self.remove_path(tape, self.tape_path(tape)).await
    }

    fn publish(&self, event: TapeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl TapeStore for FileTapeStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn append_batch(&self, tape: &str, entries: Vec<TapeEntry>) -> Result<Vec<TapeEntry>, TapeError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock().await;
        let stored = self.append_locked(&mut state, tape, entries).await?;
        drop(state);

        for entry in &stored {
            self.publish(TapeEvent::Appended {
                tape: tape.to_string(),
                entry: entry.clone(),
            });
        }
        Ok(stored)
    }

    async fn read(&self, tape: &str) -> Result<Option<Vec<TapeEntry>>, TapeError> {
        let _state = self.state.lock().await;
        self.read_file(tape).await
    }

    async fn fork(&self, tape: &str) -> Result<String, TapeError> {
        let mut state = self.state.lock().await;
        let entries = self.read_file(tape).await?.unwrap_or_default();
        let fork = fork_name(tape);
        self.write_lines(&fork, &entries).await?;

        let boundary = entries.last().map(|e| e.id + 1).unwrap_or(1);
        tokio::fs::write(self.fork_marker_path(&fork), boundary.to_string())
            .await
            .map_err(|e| TapeError::io(&fork, e))?;
        state.next_ids.insert(fork.clone(), boundary);
        state.forks.insert(fork.clone(), boundary);
        drop(state);

        debug!(source = tape, fork = %fork, boundary, "Tape forked");
        self.publish(TapeEvent::Forked {
            source: tape.to_string(),
            fork: fork.clone(),
        });
        Ok(fork)
    }

    async fn merge(&self, fork: &str, target: &str) -> Result<usize, TapeError> {
        let mut state = self.state.lock().await;
        let boundary = self.fork_boundary(&state, fork).await?;

        let pending: Vec<TapeEntry> = self
            .read_file(fork)
            .await?
            .unwrap_or_default()
            .into_iter()
            .filter(|e| e.id >= boundary)
            .collect();
        let moved = pending.len();
        if !pending.is_empty() {
            self.append_locked(&mut state, target, pending).await?;
        }

        // Marker goes first; an orphaned fork file is never merged.
        self.remove_path(fork, self.fork_marker_path(fork)).await?;
        self.remove_file(fork).await?;
        state.forks.remove(fork);
        state.next_ids.remove(fork);
        drop(state);

        debug!(fork, target, moved, "Fork merged");
        self.publish(TapeEvent::Merged {
            fork: fork.to_string(),
            target: target.to_string(),
            entries: moved,
        });
        Ok(moved)
    }

    async fn reset(&self, tape: &str) -> Result<(), TapeError> {
        let mut state = self.state.lock().await;
        self.remove_file(tape).await?;
        state.next_ids.remove(tape);
        drop(state);

        info!(tape, "Tape reset");
        self.publish(TapeEvent::Reset { tape: tape.to_string() });
        Ok(())
    }

    async fn archive(&self, tape: &str) -> Result<Option<String>, TapeError> {
        let mut state = self.state.lock().await;
        let source = self.tape_path(tape);
        match tokio::fs::try_exists(&source).await {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => return Err(TapeError::io(tape, e)),
        }

        let target = self
            .dir
            .join(format!("{}.{}.{EXTENSION}", self.file_stem(tape), archive_stamp()));
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| TapeError::io(tape, e))?;
        state.next_ids.remove(tape);
        drop(state);

        let location = target.display().to_string();
        info!(tape, archive = %location, "Tape archived");
        self.publish(TapeEvent::Archived {
            tape: tape.to_string(),
            location: location.clone(),
        });
        Ok(Some(location))
    }

    async fn list_tapes(&self) -> Result<BTreeSet<String>, TapeError> {
        let mut tapes = BTreeSet::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tapes),
            Err(e) => return Err(TapeError::io("*", e)),
        };

        let prefix = format!("{}__", self.workspace_hash);
        let suffix = format!(".{EXTENSION}");
        while let Some(item) = dir.next_entry().await.map_err(|e| TapeError::io("*", e))? {
            let file_name = item.file_name().to_string_lossy().into_owned();
            let Some(stem) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
            else {
                continue;
            };
            // Archived files carry a `.<stamp>` infix; live stems never contain dots.
            if stem.contains('.') {
                continue;
            }
            match urlencoding::decode(stem) {
                Ok(name) => {
                    tapes.insert(name.into_owned());
                }
                Err(e) => warn!(file = %file_name, error = %e, "Skipping undecodable tape file"),
            }
        }
        Ok(tapes)
    }

    fn subscribe(&self) -> broadcast::Receiver<TapeEvent> {
        self.events.subscribe()
    }
}

/// Percent-encode a tape name into a file-name fragment. `.` is encoded too.
fn encode_name(tape: &str) -> String {
    urlencoding::encode(tape).replace('.', "%2E")
}
