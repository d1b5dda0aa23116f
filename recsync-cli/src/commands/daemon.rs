//! `recsync daemon`: scheduler lifecycle and remote-controlled runs.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use recsync_daemon::paths::socket_path;
use recsync_daemon::{request_run, request_status, request_stop, start_blocking, DaemonError};

use super::Session;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (scheduler + socket server).
    Start(StartArgs),
    /// Request graceful daemon shutdown over the unix socket.
    Stop,
    /// Query daemon runtime status over the unix socket.
    Status,
    /// Run a job inside the daemon and stream its progress here.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Log as JSON lines instead of plain text.
    #[arg(long)]
    pub json_logs: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    pub job: String,
}

pub fn run(session: &Session, command: DaemonCommand) -> Result<()> {
    let home = &session.home;

    match command {
        DaemonCommand::Start(args) => {
            let config = session.load_config()?;
            start_blocking(home, config, args.json_logs).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(home) {
            Ok(status) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let payload = serde_json::json!({
                    "running": false,
                    "socket": socket_path(home).display().to_string(),
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Run(args) => {
            let report = request_run(home, &args.job, |line| println!("{line}"))
                .with_context(|| format!("daemon run of '{}' failed", args.job))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to render run report")?
            );
        }
    }

    Ok(())
}
