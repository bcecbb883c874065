//! `tapeloop tape` — read-only views of a session tape, plus reset.

use super::{CmdResult, open_inspector};

pub async fn list() -> CmdResult {
    let runtime = open_inspector()?;
    let tapes = runtime.store().list_tapes().await?;
    if tapes.is_empty() {
        println!("No tapes in this workspace yet.");
        return Ok(());
    }
    for name in tapes {
        println!("{name}");
    }
    Ok(())
}

pub async fn info(session: &str) -> CmdResult {
    let runtime = open_inspector()?;
    let handle = runtime.session(session).await?;
    let info = handle.tape.info().await?;
    println!("Tape:        {}", info.name);
    println!("Entries:     {}", info.entries);
    println!("Anchors:     {}", info.anchors);
    println!("Last anchor: {}", info.last_anchor.as_deref().unwrap_or("-"));
    Ok(())
}

pub async fn search(session: &str, query: &str, limit: usize) -> CmdResult {
    let runtime = open_inspector()?;
    let handle = runtime.session(session).await?;
    let hits = handle.tape.search(query, limit).await?;
    if hits.is_empty() {
        println!("No entries match \"{query}\".");
        return Ok(());
    }
    for entry in hits {
        println!("#{:<5} {:<11} {}", entry.id, entry.kind.as_str(), serde_json::to_string(&entry.payload)?);
    }
    Ok(())
}

pub async fn anchors(session: &str, limit: usize) -> CmdResult {
    let runtime = open_inspector()?;
    let handle = runtime.session(session).await?;
    for anchor in handle.tape.anchors(limit).await? {
        println!("#{:<5} {} {}", anchor.id, anchor.name, serde_json::to_string(&anchor.state)?);
    }
    Ok(())
}

pub async fn reset(session: &str, archive: bool) -> CmdResult {
    let runtime = open_inspector()?;
    let handle = runtime.session(session).await?;
    let result = handle.tape.reset(archive).await?;
    handle.memory.ensure_fresh().await?;
    println!("{result}");
    Ok(())
}
