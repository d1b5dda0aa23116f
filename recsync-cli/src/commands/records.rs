//! `recsync records`: inspect a job's source table and act on single rows.

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use recsync_core::{RecordKey, SyncStatus, VersionRecord};
use recsync_store::RecordStore;

use super::Session;

#[derive(Subcommand, Debug)]
pub enum RecordsCommand {
    /// Count version groups by the status of their newest row.
    Stats(StatsArgs),
    /// List rows in one status, newest first.
    List(ListArgs),
    /// Print one row as JSON.
    Show(RecordArgs),
    /// Put a FAILED row back to PENDING so the next run picks it up.
    Retry(RecordArgs),
    /// Mark a SKIPPED row IGNORED so it is never synced.
    Ignore(IgnoreArgs),
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    pub job: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    pub job: String,

    /// pending, skipped, synced, failed, superseded or ignored.
    #[arg(long, short, default_value = "failed", value_parser = parse_status)]
    pub status: SyncStatus,

    #[arg(long, default_value_t = 100)]
    pub limit: usize,

    /// Emit machine-readable JSON, including every column.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// Job whose source table holds the row.
    pub job: String,
    /// Primary key of the row.
    pub key: String,
}

#[derive(Args, Debug)]
pub struct IgnoreArgs {
    #[command(flatten)]
    pub record: RecordArgs,

    /// Reason stored in the row's message column.
    #[arg(long, short, default_value = "Ignored by operator")]
    pub message: String,
}

#[derive(Tabled)]
struct StatRow {
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "count")]
    count: usize,
}

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "key")]
    key: String,
    #[tabled(rename = "group")]
    group: String,
    #[tabled(rename = "seq")]
    sequence: i64,
    #[tabled(rename = "remote id")]
    remote_id: String,
    #[tabled(rename = "message")]
    message: String,
}

fn parse_status(raw: &str) -> Result<SyncStatus, String> {
    SyncStatus::from_db(Some(raw))
        .filter(|_| !raw.trim().is_empty())
        .ok_or_else(|| format!("unknown status '{raw}'"))
}

pub fn run(session: &Session, command: RecordsCommand) -> Result<()> {
    let config = session.load_config()?;
    let job_id = match &command {
        RecordsCommand::Stats(args) => &args.job,
        RecordsCommand::List(args) => &args.job,
        RecordsCommand::Show(args) | RecordsCommand::Retry(args) => &args.job,
        RecordsCommand::Ignore(args) => &args.record.job,
    };
    let spec = super::job(&config, job_id)?.table.clone();

    let pipeline = session.pipeline(config)?;
    let store = pipeline.store();

    match command {
        RecordsCommand::Stats(args) => {
            let stats = store.table_stats(&spec)?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&stats).context("failed to serialize stats JSON")?
                );
                return Ok(());
            }
            let rows = vec![
                StatRow { status: "groups".bold().to_string(), count: stats.groups },
                StatRow { status: SyncStatus::Synced.as_str().green().to_string(), count: stats.synced },
                StatRow { status: SyncStatus::Pending.as_str().to_string(), count: stats.pending },
                StatRow { status: SyncStatus::Skipped.as_str().yellow().to_string(), count: stats.skipped },
                StatRow { status: SyncStatus::Failed.as_str().red().to_string(), count: stats.failed },
                StatRow { status: SyncStatus::Ignored.as_str().bright_black().to_string(), count: stats.ignored },
                StatRow { status: "SUPERSEDED (rows)".bright_black().to_string(), count: stats.superseded },
            ];
            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{}", spec.table.bold());
            println!("{table}");
        }
        RecordsCommand::List(args) => {
            if args.limit == 0 {
                bail!("--limit must be at least 1");
            }
            let records = store.records_with_status(&spec, args.status, args.limit)?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&records)
                        .context("failed to serialize records JSON")?
                );
                return Ok(());
            }
            if records.is_empty() {
                println!("No {} rows in {}.", args.status, spec.table);
                return Ok(());
            }
            let rows: Vec<RecordRow> = records.iter().map(record_row).collect();
            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{table}");
        }
        RecordsCommand::Show(args) => {
            let key = RecordKey::parse(&args.key);
            let record = store
                .get_record(&spec, &key)?
                .with_context(|| format!("no row with key {} in {}", args.key, spec.table))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&record).context("failed to serialize record JSON")?
            );
        }
        RecordsCommand::Retry(args) => {
            let key = RecordKey::parse(&args.key);
            if store.reset_to_pending(&spec, &key)? == 0 {
                bail!(
                    "no row with key {} in {}, or it is not in FAILED state",
                    args.key,
                    spec.table
                );
            }
            println!("✓ {} {} reset to PENDING", spec.table, args.key);
        }
        RecordsCommand::Ignore(args) => {
            let key = RecordKey::parse(&args.record.key);
            if store.mark_ignored(&spec, &key, &args.message)? == 0 {
                bail!(
                    "no row with key {} in {}, or it is not in SKIPPED state",
                    args.record.key,
                    spec.table
                );
            }
            println!("✓ {} {} marked IGNORED", spec.table, args.record.key);
        }
    }
    Ok(())
}

fn record_row(record: &VersionRecord) -> RecordRow {
    RecordRow {
        key: record.primary_key.to_string(),
        group: record.grouping_key.to_string(),
        sequence: record.sequence,
        remote_id: record.remote_id.clone().unwrap_or_default(),
        message: record.message.clone().unwrap_or_default(),
    }
}
