//! `tapeloop chat` — interactive mode.
//!
//! Command output is printed as each line is submitted. Assistant messages are
//! printed by a follower subscribed to the tape store, so replies show up as
//! soon as they are recorded.

use super::{CmdResult, open_runtime};
use std::io::Write;
use tapeloop_tape::{EntryKind, TapeEntry, TapeEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

pub async fn run(session: &str) -> CmdResult {
    let runtime = open_runtime()?;
    let handle = runtime.session(session).await?;
    let last_id = handle
        .tape
        .read_entries()
        .await?
        .last()
        .map(|e| e.id)
        .unwrap_or(0);
    let follower = spawn_follower(runtime.store().subscribe(), handle.tape.name().to_string(), last_id);

    println!();
    println!("  tapeloop — interactive mode");
    println!();
    println!("  Model:     {}", runtime.config().model);
    println!("  Tape:      {}", handle.tape.name());
    println!("  Workspace: {}", runtime.workspace().display());
    println!();
    println!("  `,help` lists commands, `$name args` runs an action,");
    println!("  `,quit` or Ctrl+C leaves.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            prompt()?;
            continue;
        }

        match runtime.submit(session, line).await {
            Ok(outcome) => {
                for out in outcome.immediate_output.lines() {
                    println!("  {out}");
                }
                if let Some(error) = &outcome.error {
                    eprintln!("  error: {error}");
                }
                if outcome.exit_requested {
                    break;
                }
            }
            Err(e) => eprintln!("  error: {e}"),
        }
        // Let the follower print before the next prompt.
        tokio::task::yield_now().await;
        prompt()?;
    }

    runtime.shutdown().await;
    follower.abort();
    println!();
    println!("  Goodbye!");
    Ok(())
}

fn prompt() -> std::io::Result<()> {
    print!("  You > ");
    std::io::stdout().flush()
}

/// Print assistant messages appended to `tape` after `last_seen`.
fn spawn_follower(events: broadcast::Receiver<TapeEvent>, tape: String, mut last_seen: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = BroadcastStream::new(events);
        while let Some(event) = events.next().await {
            match event {
                Ok(TapeEvent::Appended { tape: name, entry }) if name == tape => {
                    if entry.id <= last_seen {
                        continue;
                    }
                    last_seen = entry.id;
                    if let Some(text) = assistant_text(&entry) {
                        println!();
                        for line in text.lines() {
                            println!("  Assistant > {line}");
                        }
                    }
                }
                // IDs restart at 1 after a reset.
                Ok(TapeEvent::Reset { tape: name }) | Ok(TapeEvent::Archived { tape: name, .. })
                    if name == tape =>
                {
                    last_seen = 0;
                }
                Ok(_) => {}
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "tape follower lagged");
                }
            }
        }
    })
}

/// Visible assistant prose on `entry`, if any.
fn assistant_text(entry: &TapeEntry) -> Option<&str> {
    if entry.kind != EntryKind::Message || !entry.is_visible() {
        return None;
    }
    if entry.payload_str("role") != Some("assistant") {
        return None;
    }
    entry.payload_str("content").filter(|c| !c.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapeloop_tape::META_VIEW;

    #[test]
    fn only_visible_assistant_messages_render() {
        assert_eq!(assistant_text(&TapeEntry::message("assistant", "hi")), Some("hi"));
        assert_eq!(assistant_text(&TapeEntry::message("user", "hi")), None);
        assert_eq!(
            assistant_text(&TapeEntry::message("assistant", "hi").with_meta(META_VIEW, false)),
            None
        );
        assert_eq!(assistant_text(&TapeEntry::event("loop.step.start", serde_json::json!({}))), None);
    }
}
