//! `recsync jobs`: list jobs and change their operator-controlled state.

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use recsync_core::{JobDescriptor, Schedule};
use recsync_daemon::{request_status, DaemonError};
use recsync_store::JobStore;

use super::Session;

#[derive(Subcommand, Debug)]
pub enum JobsCommand {
    /// List configured jobs with their schedule and run state.
    List(ListArgs),
    /// Allow the scheduler to run a job.
    Enable(JobArg),
    /// Stop the scheduler from running a job. Manual runs still work.
    Disable(JobArg),
    /// Change when a job fires, e.g. "02:30" or "sun 02:30" (UTC).
    Schedule(ScheduleArgs),
    /// Ask a running job to stop before its next work unit.
    Cancel(JobArg),
    /// Clear run locks left by an interrupted foreground run. Refused while
    /// the daemon is up; the daemon clears them itself on start.
    Unlock(UnlockArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct JobArg {
    pub job: String,
}

#[derive(Args, Debug)]
pub struct UnlockArgs {
    /// Only this job; every job when omitted.
    pub job: Option<String>,
}

#[derive(Args, Debug)]
pub struct ScheduleArgs {
    pub job: String,
    /// `HH:MM` for daily, `<weekday> HH:MM` for weekly.
    pub when: String,
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "job")]
    job: String,
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "enabled")]
    enabled: String,
    #[tabled(rename = "schedule (UTC)")]
    schedule: String,
    #[tabled(rename = "state")]
    state: String,
}

#[derive(Serialize)]
struct JobJson<'a> {
    job_id: &'a str,
    name: &'a str,
    enabled: bool,
    schedule: String,
    running: bool,
    cancellation_requested: bool,
}

pub fn run(session: &Session, command: JobsCommand) -> Result<()> {
    let config = session.load_config()?;
    match &command {
        JobsCommand::Enable(arg) | JobsCommand::Disable(arg) | JobsCommand::Cancel(arg) => {
            super::job(&config, &arg.job)?;
        }
        JobsCommand::Schedule(args) => {
            super::job(&config, &args.job)?;
        }
        JobsCommand::Unlock(UnlockArgs { job: Some(job) }) => {
            super::job(&config, job)?;
        }
        JobsCommand::List(_) | JobsCommand::Unlock(_) => {}
    }

    let pipeline = session.pipeline(config)?;
    let store = pipeline.store();

    match command {
        JobsCommand::List(args) => list(store.list_jobs()?, args.json)?,
        JobsCommand::Enable(arg) => set_enabled(store.as_ref(), &arg.job, true)?,
        JobsCommand::Disable(arg) => set_enabled(store.as_ref(), &arg.job, false)?,
        JobsCommand::Schedule(args) => {
            let schedule: Schedule = args
                .when
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("invalid schedule '{}'", args.when))?;
            if !store.set_schedule(&args.job.as_str().into(), &schedule)? {
                bail!("job '{}' has no descriptor", args.job);
            }
            println!("✓ '{}' now runs {schedule} UTC", args.job);
        }
        JobsCommand::Cancel(arg) => {
            if pipeline.supervisor().request_cancel(&arg.job.as_str().into())? {
                println!("✓ cancellation requested for '{}'", arg.job);
            } else {
                println!("'{}' is not running; nothing to cancel", arg.job);
            }
        }
        JobsCommand::Unlock(args) => {
            ensure_daemon_stopped(session)?;
            match args.job {
                Some(job) => {
                    if pipeline.supervisor().unlock(&job.as_str().into())? {
                        println!("✓ '{job}' unlocked");
                    } else {
                        println!("'{job}' holds no lock; nothing to do");
                    }
                }
                None => {
                    let reset = pipeline.supervisor().recover()?;
                    println!("✓ cleared {reset} lock(s)");
                }
            }
        }
    }
    Ok(())
}

/// Locks of a live daemon belong to its runs; only orphaned ones may be cleared.
fn ensure_daemon_stopped(session: &Session) -> Result<()> {
    match request_status(&session.home) {
        Ok(_) => bail!("the daemon is running; cancel its job or stop the daemon instead"),
        Err(DaemonError::DaemonNotRunning { .. }) => Ok(()),
        Err(err) => Err(err).context("failed to check whether the daemon is running"),
    }
}

fn set_enabled(store: &dyn JobStore, job: &str, enabled: bool) -> Result<()> {
    if !store.set_enabled(&job.into(), enabled)? {
        bail!("job '{job}' has no descriptor");
    }
    let verb = if enabled { "enabled" } else { "disabled" };
    println!("✓ '{job}' {verb}");
    Ok(())
}

fn list(jobs: Vec<JobDescriptor>, json: bool) -> Result<()> {
    if json {
        let payload: Vec<JobJson<'_>> = jobs
            .iter()
            .map(|d| JobJson {
                job_id: d.job_id.as_str(),
                name: &d.name,
                enabled: d.enabled,
                schedule: d.schedule.to_string(),
                running: d.is_running,
                cancellation_requested: d.cancellation_requested,
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to serialize jobs JSON")?
        );
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs configured.");
        return Ok(());
    }

    let rows: Vec<JobRow> = jobs
        .iter()
        .map(|d| JobRow {
            job: d.job_id.to_string(),
            name: d.name.clone(),
            enabled: if d.enabled {
                "yes".green().to_string()
            } else {
                "no".bright_black().to_string()
            },
            schedule: d.schedule.to_string(),
            state: state_label(d),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn state_label(d: &JobDescriptor) -> String {
    match (d.is_running, d.cancellation_requested) {
        (true, true) => "CANCELLING".yellow().bold().to_string(),
        (true, false) => "RUNNING".cyan().bold().to_string(),
        _ => "idle".to_string(),
    }
}
