use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::MissedTickBehavior;

use recsync_core::{Config, JobDescriptor, JobId};
use recsync_store::{JobStore, SqliteStore};
use recsync_sync::pipeline::open as open_pipeline;
use recsync_sync::{LockError, NullSink, Pipeline, ProgressSink, RunReport, SyncError};

use crate::error::{io_err, DaemonError};
use crate::paths::{recsync_root, socket_path, SCHEDULER_TICK};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Outcome of the most recent run of a job, as shown by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub job_id: JobId,
    pub source: String,
    pub outcome: String,
    pub summary: String,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    fn new(job_id: JobId, source: &str, result: &Result<RunReport, SyncError>) -> Self {
        let (outcome, summary) = match result {
            Ok(report) => (report.status().as_str().to_string(), report.summary()),
            Err(SyncError::Lock(err @ LockError::Conflict { .. })) => {
                ("BLOCKED".to_string(), err.to_string())
            }
            Err(err) => ("ERROR".to_string(), err.to_string()),
        };
        Self {
            job_id,
            source: source.to_string(),
            outcome,
            summary,
            finished_at: Utc::now(),
        }
    }
}

/// State shared by every daemon task.
struct DaemonContext {
    home: PathBuf,
    pipeline: Pipeline<SqliteStore>,
    last_runs: RwLock<HashMap<JobId, RunSummary>>,
    started_at: DateTime<Utc>,
}

/// Forwards progress lines to the socket writer of a streaming `run`.
struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ProgressSink for ChannelSink {
    fn line(&self, line: &str) {
        // A closed receiver means the client went away; the run carries on.
        let _ = self.tx.send(line.to_string());
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path, config: Config, json_logs: bool) -> Result<(), DaemonError> {
    init_tracing(json_logs);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Run the daemon: recover locks, register jobs, then serve the scheduler
/// and the control socket until `stop` or ctrl-c.
pub async fn run(home: PathBuf, config: Config) -> Result<(), DaemonError> {
    let root = recsync_root(&home);
    fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;

    let pipeline = tokio::task::spawn_blocking(move || open_pipeline(config))
        .await
        .map_err(|err| DaemonError::Protocol(format!("startup join error: {err}")))??;
    tracing::info!(jobs = pipeline.config().jobs.len(), "daemon pipeline ready");

    let ctx = Arc::new(DaemonContext {
        home,
        pipeline,
        last_runs: RwLock::new(HashMap::new()),
        started_at: Utc::now(),
    });
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = scheduler_task(ctx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(ctx, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (scheduler_result, socket_result, signal_result) =
        tokio::join!(scheduler_handle, socket_handle, signal_handle);

    handle_join("scheduler", scheduler_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

async fn scheduler_task(
    ctx: Arc<DaemonContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(SCHEDULER_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;
    let mut last_check = Utc::now();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let now = Utc::now();
                let descriptors = match list_descriptors(&ctx).await {
                    Ok(descriptors) => descriptors,
                    Err(err) => {
                        tracing::error!(error = %err, "scheduler cannot read job descriptors");
                        continue;
                    }
                };
                let due = due_jobs(&descriptors, last_check, now);
                last_check = now;

                for job_id in due {
                    tracing::info!(job = %job_id, "scheduled run due");
                    match execute_job(&ctx, job_id.clone(), "scheduler", NullSink).await {
                        Ok(Ok(report)) => {
                            tracing::info!(job = %job_id, summary = %report.summary(), "scheduled run finished");
                        }
                        Ok(Err(SyncError::Lock(err @ LockError::Conflict { .. }))) => {
                            tracing::warn!(job = %job_id, error = %err, "scheduled run skipped");
                        }
                        Ok(Err(err)) => {
                            tracing::error!(job = %job_id, error = %err, "scheduled run failed");
                        }
                        Err(err) => {
                            tracing::error!(job = %job_id, error = %err, "scheduled run worker failed");
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Enabled jobs with a fire time in `(since, now]`.
fn due_jobs(descriptors: &[JobDescriptor], since: DateTime<Utc>, now: DateTime<Utc>) -> Vec<JobId> {
    descriptors
        .iter()
        .filter(|d| d.enabled && d.schedule.next_after(since) <= now)
        .map(|d| d.job_id.clone())
        .collect()
}

/// Run one job on a blocking worker and remember how it ended.
async fn execute_job<K: ProgressSink + 'static>(
    ctx: &Arc<DaemonContext>,
    job_id: JobId,
    source: &'static str,
    sink: K,
) -> Result<Result<RunReport, SyncError>, DaemonError> {
    let worker_ctx = ctx.clone();
    let worker_job = job_id.clone();
    let outcome =
        tokio::task::spawn_blocking(move || worker_ctx.pipeline.run_job(&worker_job, &sink))
            .await
            .map_err(|err| DaemonError::Protocol(format!("job worker join error: {err}")))?;

    let summary = RunSummary::new(job_id.clone(), source, &outcome);
    ctx.last_runs.write().await.insert(job_id, summary);
    Ok(outcome)
}

async fn list_descriptors(ctx: &Arc<DaemonContext>) -> Result<Vec<JobDescriptor>, DaemonError> {
    let ctx = ctx.clone();
    let descriptors = tokio::task::spawn_blocking(move || ctx.pipeline.store().list_jobs())
        .await
        .map_err(|err| DaemonError::Protocol(format!("job listing join error: {err}")))??;
    Ok(descriptors)
}

async fn socket_server_task(
    ctx: Arc<DaemonContext>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&ctx.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = ctx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, ctx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    ctx: Arc<DaemonContext>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => match list_descriptors(&ctx).await {
                Ok(descriptors) => {
                    let last_runs = ctx.last_runs.read().await.clone();
                    DaemonResponse::ok(status_payload(
                        &ctx.home,
                        &descriptors,
                        &last_runs,
                        ctx.started_at,
                        Utc::now(),
                    ))
                }
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "run" => match configured_job(&ctx, request.job.as_deref()) {
                Ok(job_id) => match stream_run(&ctx, job_id, &mut writer).await {
                    Some(response) => response,
                    None => break,
                },
                Err(response) => response,
            },
            "cancel" => match request.job.as_deref() {
                Some(job) => cancel_job(&ctx, JobId::from(job)).await,
                None => DaemonResponse::error("cancel requires a job"),
            },
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

fn configured_job(ctx: &DaemonContext, job: Option<&str>) -> Result<JobId, DaemonResponse> {
    let Some(job) = job else {
        return Err(DaemonResponse::error("run requires a job"));
    };
    let job_id = JobId::from(job);
    match ctx.pipeline.config().job(&job_id) {
        Some(_) => Ok(job_id),
        None => Err(DaemonResponse::error(format!("job '{job}' is not configured"))),
    }
}

/// Execute a manual run, writing each progress line to the client as it is
/// produced. Returns the final response, or `None` once the client is gone.
async fn stream_run(
    ctx: &Arc<DaemonContext>,
    job_id: JobId,
    writer: &mut OwnedWriteHalf,
) -> Option<DaemonResponse> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let worker = {
        let ctx = ctx.clone();
        tokio::spawn(async move { execute_job(&ctx, job_id, "socket", ChannelSink { tx }).await })
    };

    let mut client_gone = false;
    while let Some(line) = rx.recv().await {
        if client_gone {
            continue;
        }
        if let Err(err) = write_response(writer, &DaemonResponse::log_line(line)).await {
            tracing::warn!(error = %err, "run client disconnected; job continues");
            client_gone = true;
        }
    }

    let response = match worker.await {
        Ok(Ok(Ok(report))) => DaemonResponse::ok(json!(report)),
        Ok(Ok(Err(err))) => DaemonResponse::error(err.to_string()),
        Ok(Err(err)) => DaemonResponse::error(err.to_string()),
        Err(err) => DaemonResponse::error(format!("run task join failure: {err}")),
    };
    (!client_gone).then_some(response)
}

async fn cancel_job(ctx: &Arc<DaemonContext>, job_id: JobId) -> DaemonResponse {
    let worker_ctx = ctx.clone();
    let worker_job = job_id.clone();
    let latched = tokio::task::spawn_blocking(move || {
        worker_ctx.pipeline.supervisor().request_cancel(&worker_job)
    })
    .await;
    match latched {
        Ok(Ok(cancelled)) => DaemonResponse::ok(json!({ "job": job_id, "cancelled": cancelled })),
        Ok(Err(err)) => DaemonResponse::error(err.to_string()),
        Err(err) => DaemonResponse::error(format!("cancel task join failure: {err}")),
    }
}

fn status_payload(
    home: &Path,
    descriptors: &[JobDescriptor],
    last_runs: &HashMap<JobId, RunSummary>,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Value {
    let jobs: Vec<Value> = descriptors
        .iter()
        .map(|d| {
            json!({
                "job_id": d.job_id,
                "name": d.name,
                "enabled": d.enabled,
                "schedule": d.schedule.to_string(),
                "running": d.is_running,
                "cancellation_requested": d.cancellation_requested,
                "next_run": d.enabled.then(|| d.schedule.next_after(now)),
                "last_run": last_runs.get(&d.job_id),
            })
        })
        .collect();

    json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": started_at,
        "socket": socket_path(home).display().to_string(),
        "jobs": jobs,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// filter; records from the `log` facade are bridged in.
pub fn init_tracing(json_logs: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = if json_logs {
        fmt().json().with_env_filter(filter).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
