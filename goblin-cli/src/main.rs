// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Goblin CLI
//!
//! Command-line interface for freezing and thawing goblin processes.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// Goblin - checkpoint, restore and re-checkpoint long-running processes
#[derive(Parser)]
#[command(name = "goblin")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (defaults apply if it does not exist)
    #[arg(short, long, default_value = "goblin.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Spawn a command and track it as a new goblin
    Launch {
        /// Command line to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Track an already running process
    Adopt {
        /// Process id to adopt
        #[arg(long, conflicts_with = "pgrep", required_unless_present = "pgrep")]
        pid: Option<u32>,

        /// Resolve the process with `pgrep -f <pattern>` (must match exactly one)
        #[arg(long)]
        pgrep: Option<String>,
    },

    /// Checkpoint a goblin to disk
    Freeze {
        /// Goblin id
        id: String,

        /// Process to dump (required when the goblin is Failed)
        #[arg(long)]
        pid: Option<u32>,

        /// Engine timeout override in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Keep the process running after the dump
        #[arg(long)]
        leave_running: bool,
    },

    /// Restore a goblin from its latest (or a given) image
    Thaw {
        /// Goblin id
        id: String,

        /// Image directory to restore from
        #[arg(long)]
        dir: Option<String>,

        /// Engine timeout override in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Freeze a running goblin and restore it from the new image
    Beam {
        /// Goblin id
        id: String,

        /// Process to dump (must match the tracked pid)
        #[arg(long)]
        pid: Option<u32>,

        /// Engine timeout override in milliseconds, for both steps
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Keep the image directory after the restore
        #[arg(long)]
        no_cleanup: bool,
    },

    /// Show one goblin or all goblins
    Status {
        /// Goblin id (all goblins if omitted)
        id: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Remove a non-running goblin from the registry (images stay on disk)
    Forget {
        /// Goblin id
        id: String,
    },

    /// Check that this host can freeze and thaw goblins
    Doctor,

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file (defaults to --config)
        file: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Dispatch to command handlers
    match cli.command {
        Commands::Launch { command } => commands::launch::execute(&cli.config, command).await,
        Commands::Adopt { pid, pgrep } => commands::adopt::execute(&cli.config, pid, pgrep).await,
        Commands::Freeze {
            id,
            pid,
            timeout_ms,
            leave_running,
        } => commands::freeze::execute(&cli.config, &id, pid, timeout_ms, leave_running).await,
        Commands::Thaw { id, dir, timeout_ms } => {
            commands::thaw::execute(&cli.config, &id, dir, timeout_ms).await
        }
        Commands::Beam {
            id,
            pid,
            timeout_ms,
            no_cleanup,
        } => commands::beam::execute(&cli.config, &id, pid, timeout_ms, no_cleanup).await,
        Commands::Status { id, json } => commands::status::execute(&cli.config, id, json).await,
        Commands::Forget { id } => commands::forget::execute(&cli.config, &id).await,
        Commands::Doctor => commands::doctor::execute(&cli.config).await,
        Commands::Validate { file } => {
            let file = file.unwrap_or_else(|| cli.config.clone());
            commands::validate::execute(&file).await
        }
    }
}
