use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "loomrun",
    about = "A durable, resumable orchestration runtime for composable agent pipelines",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (overrides auto-discovery).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline from scratch.
    Run {
        /// Path to a YAML pipeline description.
        #[arg(long)]
        pipeline: PathBuf,
        /// Resume into an existing session instead of creating a new one.
        #[arg(long)]
        session: Option<String>,
        /// Seed user message.
        #[arg(long)]
        input: Option<String>,
    },
    /// Resume a session that previously yielded on a tool call.
    Resume {
        #[arg(long)]
        session: String,
        /// External input answering the pending yielding tool call(s), as a
        /// JSON value. Defaults to `true` if omitted.
        #[arg(long)]
        input: Option<String>,
        /// Path to the same YAML pipeline the session was started with —
        /// required so the structural fingerprint can be checked.
        #[arg(long)]
        pipeline: PathBuf,
    },
    /// Session management.
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// List all saved sessions.
    List,
    /// Print a session's full event log.
    Show {
        session_id: String,
    },
}
