//! `tapeloop run` — one line in, one JSON turn outcome out.

use super::{CmdResult, open_runtime};

pub async fn run(session: &str, message: &str) -> CmdResult {
    let runtime = open_runtime()?;
    let outcome = runtime.submit(session, message).await?;
    runtime.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
