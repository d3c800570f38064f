//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Foreman - PM-driven multi-agent pipeline orchestrator
#[derive(Parser)]
#[command(
    name = "fm",
    about = "PM-driven task-graph orchestrator for teams of AI agents",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Create a pipeline run and start a worker for it
    Run {
        /// Project identifier
        #[arg(short, long, default_value = "default")]
        project: String,

        /// The request to orchestrate
        request: String,

        /// Run the worker in this process instead of detaching
        #[arg(long)]
        foreground: bool,
    },

    /// Internal: drive an existing run (used by `run`)
    #[command(hide = true)]
    Worker {
        /// Run identifier
        run_id: String,
    },

    /// Show the state of a run
    Status {
        /// Run identifier
        run_id: String,
    },

    /// Show a project's live pipeline log
    Logs {
        /// Project identifier
        #[arg(short, long, default_value = "default")]
        project: String,
    },

    /// Signal a project's worker to abort
    Abort {
        /// Project identifier
        #[arg(short, long, default_value = "default")]
        project: String,
    },

    /// List available agent definitions
    Agents,

    /// List provider adapters and their availability
    Providers {
        /// Re-probe instead of using the cached scan
        #[arg(long)]
        refresh: bool,
    },
}
