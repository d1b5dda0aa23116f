//! `recsync run`: execute one job in the foreground.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use recsync_sync::{NullSink, ProgressSink, RunReport};

use super::Session;

/// Arguments for `recsync run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Job id from the config file.
    pub job: String,

    /// Process at most this many work units (overrides RECSYNC_RECORD_LIMIT).
    #[arg(long)]
    pub limit: Option<usize>,

    /// Print only the final summary.
    #[arg(long, short)]
    pub quiet: bool,
}

impl RunArgs {
    pub fn run(self, session: &Session) -> Result<()> {
        let mut config = session.load_config()?;
        let job_id = super::job(&config, &self.job)?.id.clone();
        if let Some(limit) = self.limit {
            if limit == 0 {
                bail!("--limit must be at least 1");
            }
            config.record_limit = Some(limit);
        }

        let pipeline = session.pipeline(config)?;
        let sink: &dyn ProgressSink = if self.quiet { &NullSink } else { &StdoutSink };
        let report = pipeline
            .run_job(&job_id, sink)
            .with_context(|| format!("job '{job_id}' did not complete"))?;

        print_report(&report);
        if !report.failed.is_empty() {
            bail!(
                "{} unit(s) were rejected by the remote API",
                report.failed.len()
            );
        }
        Ok(())
    }
}

/// Progress goes straight to the terminal.
struct StdoutSink;

impl ProgressSink for StdoutSink {
    fn line(&self, line: &str) {
        println!("{line}");
    }
}

fn print_report(report: &RunReport) {
    let headline = format!("'{}': {}", report.job_id, report.summary());
    if report.failed.is_empty() {
        println!("{} {headline} ({:.1}s)", "✓".green().bold(), report.duration_seconds);
    } else {
        println!("{} {headline} ({:.1}s)", "✗".red().bold(), report.duration_seconds);
        for issue in &report.failed {
            println!("  {} {}: {}", "✗".red(), issue.unit, issue.reason);
        }
    }
}
