//! Built-in tools for tapeloop.
//!
//! Tools are what `$name` actions and comma commands run: the shell
//! passthrough, control signals, tape inspection, memory, and file access.
//! Tape and memory tools are bound to one session, so a registry is built per
//! session from a [`ToolContext`].

pub mod args;
pub mod bash;
pub mod control;
pub mod fs;
pub mod memory_tools;
pub mod tape_tools;

use std::path::PathBuf;
use std::sync::Arc;
use tapeloop_config::ShellConfig;
use tapeloop_core::tool::{Tool, ToolRegistry};
use tapeloop_tape::{MemoryZone, TapeService};

pub use bash::BashTool;

/// Everything the session-bound tools need.
#[derive(Clone)]
pub struct ToolContext {
    pub tape: TapeService,
    pub memory: Arc<MemoryZone>,
    pub workspace: PathBuf,
    pub shell: ShellConfig,
}

/// Create a registry with every built-in tool bound to `ctx`.
pub fn builtin_registry(ctx: &ToolContext) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Box::new(BashTool::new(ctx.workspace.clone(), &ctx.shell)));
    registry.register(Box::new(control::HelpTool));
    registry.register(Box::new(control::SignalTool::quit()));
    registry.register(Box::new(control::SignalTool::done()));
    registry.register(Box::new(control::SignalTool::debug()));

    registry.register(Box::new(tape_tools::TapeInfoTool::new(ctx.tape.clone())));
    registry.register(Box::new(tape_tools::TapeSearchTool::new(ctx.tape.clone())));
    registry.register(Box::new(tape_tools::TapeAnchorsTool::new(ctx.tape.clone())));
    registry.register(Box::new(tape_tools::TapeHandoffTool::new(ctx.tape.clone())));
    registry.register(Box::new(tape_tools::TapeReadTool::new(ctx.tape.clone())));
    registry.register(Box::new(tape_tools::TapeResetTool::new(
        ctx.tape.clone(),
        Arc::clone(&ctx.memory),
    )));

    registry.register(Box::new(memory_tools::MemorySaveTool::new(Arc::clone(&ctx.memory))));
    registry.register(Box::new(memory_tools::MemoryDailyTool::new(Arc::clone(&ctx.memory))));
    registry.register(Box::new(memory_tools::MemoryRecallTool::new(Arc::clone(&ctx.memory))));
    registry.register(Box::new(memory_tools::MemoryClearTool::new(Arc::clone(&ctx.memory))));
    registry.register(Box::new(memory_tools::MemoryShowTool::new(Arc::clone(&ctx.memory))));

    registry.register(Box::new(fs::FsReadTool::new(ctx.workspace.clone())));
    registry.register(Box::new(fs::FsWriteTool::new(ctx.workspace.clone())));

    // The catalog tools list everything, themselves included.
    let mut catalog = registry.definitions();
    let empty = Arc::new(Vec::new());
    catalog.push(control::ToolsTool::new(Arc::clone(&empty)).to_definition());
    catalog.push(control::ToolDescribeTool::new(empty).to_definition());
    catalog.sort_by(|a, b| a.name.cmp(&b.name));
    let catalog = Arc::new(catalog);
    registry.register(Box::new(control::ToolsTool::new(Arc::clone(&catalog))));
    registry.register(Box::new(control::ToolDescribeTool::new(catalog)));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapeloop_core::tool::ToolCall;
    use tapeloop_tape::InMemoryTapeStore;

    fn context() -> ToolContext {
        let tape = TapeService::new(Arc::new(InMemoryTapeStore::new()), "t");
        ToolContext {
            memory: Arc::new(MemoryZone::new(tape.clone())),
            tape,
            workspace: std::env::temp_dir(),
            shell: ShellConfig::default(),
        }
    }

    #[test]
    fn registry_has_all_builtins() {
        let registry = builtin_registry(&context());
        for name in [
            "bash",
            "help",
            "tools",
            "tool.describe",
            "quit",
            "done",
            "debug",
            "tape.info",
            "tape.search",
            "tape.anchors",
            "tape.handoff",
            "tape.reset",
            "tape.read",
            "memory.save",
            "memory.daily",
            "memory.recall",
            "memory.clear",
            "memory.show",
            "fs.read",
            "fs.write",
        ] {
            assert!(registry.contains(name), "missing {name}");
        }
    }

    #[tokio::test]
    async fn tools_listing_includes_itself() {
        let registry = builtin_registry(&context());
        let call = ToolCall {
            id: "c1".into(),
            name: "tools".into(),
            arguments: serde_json::json!({}),
        };
        let result = registry.execute(&call).await.unwrap();
        assert_eq!(result.call_id, "c1");
        assert!(result.output.contains("tools: List available tools."));
        assert!(result.output.contains("tool.describe:"));
    }
}
