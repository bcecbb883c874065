//! `tapeloop memory` — view and edit a session's memory zone.

use super::{CmdResult, open_inspector};
use chrono::NaiveDate;

pub async fn show(session: &str) -> CmdResult {
    let runtime = open_inspector()?;
    let handle = runtime.session(session).await?;
    let snapshot = handle.memory.read().await?;

    println!("Memory zone (version {})", snapshot.version);
    println!();
    if snapshot.long_term.is_empty() {
        println!("Long-term: (empty)");
    } else {
        println!("Long-term:");
        for line in snapshot.long_term.lines() {
            println!("  {line}");
        }
    }
    println!();
    if snapshot.dailies.is_empty() {
        println!("Daily notes: (none)");
    }
    for note in &snapshot.dailies {
        println!("{}:", note.date);
        for line in note.content.lines() {
            println!("  {line}");
        }
    }
    Ok(())
}

pub async fn save(session: &str, content: &str) -> CmdResult {
    let runtime = open_inspector()?;
    let handle = runtime.session(session).await?;
    let snapshot = handle.memory.save_long_term(content).await?;
    println!("Saved long-term memory (version {}).", snapshot.version);
    Ok(())
}

pub async fn daily(session: &str, content: &str, date: Option<&str>) -> CmdResult {
    let date = date
        .map(|raw| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| format!("invalid date '{raw}', expected YYYY-MM-DD"))
        })
        .transpose()?;
    let runtime = open_inspector()?;
    let handle = runtime.session(session).await?;
    let snapshot = handle.memory.append_daily(content, date).await?;
    println!("Appended to daily notes (version {}).", snapshot.version);
    Ok(())
}

pub async fn clear(session: &str, confirm: bool) -> CmdResult {
    if !confirm {
        println!("This empties long-term memory and every daily note.");
        println!("Run with --confirm to proceed:");
        println!("  tapeloop memory clear --confirm");
        return Ok(());
    }
    let runtime = open_inspector()?;
    let handle = runtime.session(session).await?;
    let snapshot = handle.memory.clear().await?;
    println!("Memory cleared (version {}).", snapshot.version);
    Ok(())
}
