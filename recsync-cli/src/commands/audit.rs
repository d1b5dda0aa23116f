//! `recsync audit`: newest-first run history.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use recsync_core::{AuditEntry, AuditStatus, JobId};
use recsync_store::AuditLog;

use super::Session;

/// Arguments for `recsync audit`.
#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Only entries for this job.
    #[arg(long)]
    pub job: Option<String>,

    /// How many entries to show.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,

    /// Emit machine-readable JSON, including entry details.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct AuditRow {
    #[tabled(rename = "time (UTC)")]
    time: String,
    #[tabled(rename = "age")]
    age: String,
    #[tabled(rename = "job")]
    job: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "duration")]
    duration: String,
    #[tabled(rename = "message")]
    message: String,
}

impl AuditArgs {
    pub fn run(self, session: &Session) -> Result<()> {
        if self.limit == 0 {
            bail!("--limit must be at least 1");
        }
        let pipeline = session.pipeline(session.load_config()?)?;
        let job_id = self.job.as_deref().map(JobId::from);
        let entries = pipeline.store().recent(job_id.as_ref(), self.limit)?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&entries).context("failed to serialize audit JSON")?
            );
            return Ok(());
        }

        if entries.is_empty() {
            println!("No audit entries.");
            return Ok(());
        }
        let now = Utc::now();
        let rows: Vec<AuditRow> = entries.iter().map(|e| row(e, now)).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn row(entry: &AuditEntry, now: DateTime<Utc>) -> AuditRow {
    AuditRow {
        time: entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        age: format_age(entry.timestamp, now),
        job: entry.job_id.to_string(),
        status: status_label(entry.status),
        duration: entry
            .duration_seconds
            .map(|s| format!("{s:.1}s"))
            .unwrap_or_default(),
        message: entry.message.clone(),
    }
}

fn format_age(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = now.signed_duration_since(timestamp).num_seconds().max(0);
    match seconds {
        s if s < 60 => format!("{s}s ago"),
        s if s < 60 * 60 => format!("{}m ago", s / 60),
        s if s < 60 * 60 * 24 => format!("{}h ago", s / (60 * 60)),
        s => format!("{}d ago", s / (60 * 60 * 24)),
    }
}

fn status_label(status: AuditStatus) -> String {
    match status {
        AuditStatus::Started => status.as_str().bright_black().to_string(),
        AuditStatus::Success => status.as_str().green().bold().to_string(),
        AuditStatus::Failure => status.as_str().red().bold().to_string(),
    }
}
