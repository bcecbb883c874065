pub mod chat;
pub mod init;
pub mod memory;
pub mod run;
pub mod tape;

use std::sync::Arc;
use tapeloop_agent::{EchoProvider, Runtime};
use tapeloop_config::AppConfig;
use tapeloop_tape::{FileTapeStore, TapeStore};

pub type CmdResult = Result<(), Box<dyn std::error::Error>>;

fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

/// Runtime for the current directory with the configured model.
pub fn open_runtime() -> Result<Runtime, Box<dyn std::error::Error>> {
    let config = load_config()?;
    let workspace = std::env::current_dir()?;
    Ok(Runtime::from_config(config, &workspace)?)
}

/// Runtime for inspection commands: same tapes, but never calls a model, so
/// it works whatever `model` is configured.
pub fn open_inspector() -> Result<Runtime, Box<dyn std::error::Error>> {
    let config = load_config()?;
    let workspace = std::env::current_dir()?;
    let store: Arc<dyn TapeStore> = Arc::new(FileTapeStore::new(config.tapes_dir(), &workspace));
    Ok(Runtime::new(config, workspace, store, Arc::new(EchoProvider)))
}
