//! recsync: reconcile versioned source records with a remote API.
//!
//! # Usage
//!
//! ```text
//! recsync [--config <path>] run <job> [--limit <n>]
//! recsync jobs list [--json]
//! recsync jobs enable|disable|cancel <job>
//! recsync jobs schedule <job> "<[day] HH:MM>"
//! recsync records show|retry <job> <key>
//! recsync records ignore <job> <key> [--message <text>]
//! recsync mappings list [--type <map_type>] [--json]
//! recsync mappings set <map_type> <source_id> <remote_id> [--name <text>]
//! recsync audit [--job <job>] [--limit <n>] [--json]
//! recsync daemon start|stop|status|run <job>
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    audit::AuditArgs, daemon::DaemonCommand, jobs::JobsCommand, mappings::MappingsCommand,
    records::RecordsCommand, run::RunArgs, Session,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "recsync",
    version,
    about = "Reconcile versioned source records with a remote API",
    long_about = None,
)]
struct Cli {
    /// Config file to use instead of ~/.recsync/config.yaml.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one job to completion in this process.
    Run(RunArgs),

    /// Inspect and administer configured jobs.
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },

    /// Retry, ignore, or inspect individual source rows.
    Records {
        #[command(subcommand)]
        command: RecordsCommand,
    },

    /// Manage local value-to-remote-id mappings.
    Mappings {
        #[command(subcommand)]
        command: MappingsCommand,
    },

    /// Show recent run history.
    Audit(AuditArgs),

    /// Control the scheduling daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let session = Session::new(cli.config)?;
    match cli.command {
        Commands::Run(args) => args.run(&session),
        Commands::Jobs { command } => commands::jobs::run(&session, command),
        Commands::Records { command } => commands::records::run(&session, command),
        Commands::Mappings { command } => commands::mappings::run(&session, command),
        Commands::Audit(args) => args.run(&session),
        Commands::Daemon { command } => commands::daemon::run(&session, command),
    }
}
