//! tapeloop CLI — the main entry point.
//!
//! Commands:
//! - `init`    — Write the default config
//! - `chat`    — Interactive session on a tape
//! - `run`     — Submit one line and print the turn as JSON
//! - `tape`    — Inspect or reset a session tape
//! - `memory`  — Inspect or edit a session's memory zone

use clap::{Parser, Subcommand};
use tapeloop_agent::DEFAULT_SESSION;

mod commands;

#[derive(Parser)]
#[command(
    name = "tapeloop",
    about = "tapeloop — a tape-backed agent loop for the shell",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Chat interactively
    Chat {
        #[arg(short, long, default_value = DEFAULT_SESSION)]
        session: String,
    },

    /// Submit one line and print the turn outcome as JSON
    Run {
        #[arg(short, long)]
        message: String,

        #[arg(short, long, default_value = DEFAULT_SESSION)]
        session: String,
    },

    /// Inspect the session tape
    Tape {
        #[arg(short, long, default_value = DEFAULT_SESSION)]
        session: String,

        #[command(subcommand)]
        action: TapeAction,
    },

    /// Inspect or edit session memory
    Memory {
        #[arg(short, long, default_value = DEFAULT_SESSION)]
        session: String,

        #[command(subcommand)]
        action: MemoryAction,
    },
}

#[derive(Subcommand)]
enum TapeAction {
    /// List tapes of this workspace
    List,
    /// Entry and anchor counts
    Info,
    /// Case-insensitive search over entries
    Search {
        query: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// List anchors
    Anchors {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Clear the tape
    Reset {
        /// Keep a timestamped copy first
        #[arg(long)]
        archive: bool,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Print long-term memory and daily notes
    Show,
    /// Replace long-term memory
    Save { content: String },
    /// Append to a daily note
    Daily {
        content: String,
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        date: Option<String>,
    },
    /// Empty the memory zone
    Clear {
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so `run` output stays machine-readable.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init { force } => commands::init::run(force).await?,
        Commands::Chat { session } => commands::chat::run(&session).await?,
        Commands::Run { message, session } => commands::run::run(&session, &message).await?,
        Commands::Tape { session, action } => match action {
            TapeAction::List => commands::tape::list().await?,
            TapeAction::Info => commands::tape::info(&session).await?,
            TapeAction::Search { query, limit } => commands::tape::search(&session, &query, limit).await?,
            TapeAction::Anchors { limit } => commands::tape::anchors(&session, limit).await?,
            TapeAction::Reset { archive } => commands::tape::reset(&session, archive).await?,
        },
        Commands::Memory { session, action } => match action {
            MemoryAction::Show => commands::memory::show(&session).await?,
            MemoryAction::Save { content } => commands::memory::save(&session, &content).await?,
            MemoryAction::Daily { content, date } => {
                commands::memory::daily(&session, &content, date.as_deref()).await?
            }
            MemoryAction::Clear { confirm } => commands::memory::clear(&session, confirm).await?,
        },
    }

    Ok(())
}
