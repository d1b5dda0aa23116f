//! The generic sync loop: discover, attempt each unit, classify, finalize,
//! and record the run in the audit log.
//!
//! Units are processed strictly in order on the caller's thread. Every
//! per-unit failure is converted to a status at the unit boundary; only
//! errors outside the loop (authentication, discovery, audit writes) abort
//! the run.

use std::collections::BTreeMap;
use std::time::Instant;

use recsync_core::{
    Action, AuditEntry, AuditStatus, JobConfig, JobId, RecordKey, SyncStatus, VersionRecord,
    WorkUnit,
};
use recsync_store::{AuditLog, RecordStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::classify::{classify, Attempt};
use crate::error::{SyncError, UnitError};
use crate::finalize::Finalizer;
use crate::lookup::{DependencyLookup, MappingLookup};
use crate::payload::{BuildContext, PayloadBuilder};
use crate::reconcile::discover;
use crate::remote::{ApiRequest, RemoteApiClient};

/// Label used for the synthetic entry written when a run is cancelled.
pub const ALL_REMAINING: &str = "ALL REMAINING";

/// Receives human-readable progress lines (e.g. to stream to an operator).
pub trait ProgressSink: Send + Sync {
    fn line(&self, line: &str);
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn line(&self, _line: &str) {}
}

/// Polled between units, never during one.
pub trait CancelSignal {
    fn should_cancel(&self) -> bool;
}

impl<F: Fn() -> bool> CancelSignal for F {
    fn should_cancel(&self) -> bool {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitIssue {
    pub unit: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub job_id: JobId,
    pub discovered: usize,
    pub synced: Vec<String>,
    pub failed: Vec<UnitIssue>,
    pub skipped: Vec<UnitIssue>,
    pub cancelled: bool,
    pub duration_seconds: f64,
}

impl RunReport {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            discovered: 0,
            synced: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            cancelled: false,
            duration_seconds: 0.0,
        }
    }

    /// `Failure` if any unit was rejected.
    pub fn status(&self) -> AuditStatus {
        if self.failed.is_empty() {
            AuditStatus::Success
        } else {
            AuditStatus::Failure
        }
    }

    pub fn summary(&self) -> String {
        if self.discovered == 0 {
            return "Nothing to do".to_owned();
        }
        format!(
            "{} unit(s): {} synced, {} failed, {} skipped{}",
            self.discovered,
            self.synced.len(),
            self.failed.len(),
            self.skipped.len(),
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }

    pub fn details(&self) -> Value {
        json!({
            "discovered": self.discovered,
            "cancelled": self.cancelled,
            "counts": {
                "synced": self.synced.len(),
                "failed": self.failed.len(),
                "skipped": self.skipped.len(),
            },
            "synced": self.synced,
            "failed": self.failed,
            "skipped": self.skipped,
        })
    }
}

/// One run of one job, with every collaborator injected.
pub struct SyncJob<'a> {
    pub job: &'a JobConfig,
    pub records: &'a dyn RecordStore,
    pub audit: &'a dyn AuditLog,
    pub client: &'a dyn RemoteApiClient,
    pub payload: &'a dyn PayloadBuilder,
    pub mappings: &'a dyn MappingLookup,
    pub dependencies: &'a dyn DependencyLookup,
    /// Hard cap on units for this run.
    pub record_limit: Option<usize>,
    pub sink: &'a dyn ProgressSink,
}

impl SyncJob<'_> {
    pub fn run(&self, cancel: &dyn CancelSignal) -> Result<RunReport, SyncError> {
        let started = Instant::now();
        let mut report = RunReport::new(self.job.id.clone());

        self.audit.append(&AuditEntry::new(
            self.job.id.clone(),
            AuditStatus::Started,
            format!("Job '{}' started", self.job.display_name()),
        ))?;
        self.emit(&format!("Starting job '{}'", self.job.display_name()));

        let outcome = self.execute(cancel, &mut report);
        report.duration_seconds = started.elapsed().as_secs_f64();

        match outcome {
            Ok(()) => {
                let summary = report.summary();
                self.audit.append(
                    &AuditEntry::new(self.job.id.clone(), report.status(), summary.clone())
                        .with_duration(report.duration_seconds)
                        .with_details(report.details()),
                )?;
                self.emit(&format!("Finished: {summary}"));
                Ok(report)
            }
            Err(err) => {
                tracing::error!("job '{}' failed: {err}", self.job.id);
                self.emit(&format!("Job failed: {err}"));
                let entry = AuditEntry::new(self.job.id.clone(), AuditStatus::Failure, err.to_string())
                    .with_duration(report.duration_seconds)
                    .with_details(json!({
                        "error": err.to_string(),
                        "chain": error_chain(&err),
                        "progress": report.details(),
                    }));
                if let Err(audit_err) = self.audit.append(&entry) {
                    tracing::error!("job '{}': could not record failure: {audit_err}", self.job.id);
                }
                Err(err)
            }
        }
    }

    fn execute(&self, cancel: &dyn CancelSignal, report: &mut RunReport) -> Result<(), SyncError> {
        self.client.authenticate()?;

        let batch = match self.record_limit {
            Some(limit) => {
                tracing::warn!("job '{}': record limit {limit} active", self.job.id);
                self.emit(&format!("Record limit active: at most {limit} unit(s)"));
                self.job.batch_size.min(limit)
            }
            None => self.job.batch_size,
        };
        let mut units = discover(self.records, &self.job.table, batch, self.job.table.watermark)?;
        if let Some(limit) = self.record_limit {
            units.truncate(limit);
        }
        report.discovered = units.len();
        if units.is_empty() {
            self.emit("Nothing to do");
            return Ok(());
        }
        self.emit(&format!("Discovered {} unit(s)", units.len()));

        let finalizer = Finalizer::new(self.records, &self.job.table);
        for (index, unit) in units.iter().enumerate() {
            if cancel.should_cancel() {
                let remaining = units.len() - index;
                report.cancelled = true;
                report.skipped.push(UnitIssue {
                    unit: ALL_REMAINING.to_owned(),
                    reason: format!("cancelled by operator; {remaining} unit(s) not processed"),
                });
                tracing::warn!("job '{}' cancelled with {remaining} unit(s) left", self.job.id);
                self.emit(&format!("Cancelled: {remaining} unit(s) left unprocessed"));
                break;
            }
            self.process(unit, &finalizer, report);
        }
        Ok(())
    }

    fn process(&self, unit: &WorkUnit, finalizer: &Finalizer<'_>, report: &mut RunReport) {
        let label = unit.label();
        let (status, remote_id, message) = match self.attempt(unit) {
            Ok((action, remote_id)) => {
                let message = match action {
                    Action::Create => format!("Created remote entity {remote_id}"),
                    Action::Update => format!("Updated remote entity {remote_id}"),
                };
                (SyncStatus::Synced, Some(remote_id), message)
            }
            Err(err) => (err.status(), None, err.to_string()),
        };

        if let Err(err) = finalizer.finalize(unit, status, remote_id.as_deref(), Some(message.as_str())) {
            tracing::error!("{}: could not finalize {label}: {err}", self.job.table.table);
            self.emit(&format!("[{}] {label}: finalize failed: {err}", unit.action));
            report.skipped.push(UnitIssue {
                unit: label,
                reason: format!("finalize failed: {err}"),
            });
            return;
        }

        tracing::info!("[{}] {label} -> {status}: {message}", unit.action);
        self.emit(&format!("[{}] {label} -> {status}: {message}", unit.action));
        match status {
            SyncStatus::Synced => report.synced.push(label),
            SyncStatus::Failed => report.failed.push(UnitIssue { unit: label, reason: message }),
            _ => report.skipped.push(UnitIssue { unit: label, reason: message }),
        }
    }

    /// One attempt, with the single stale-update fallback to create.
    fn attempt(&self, unit: &WorkUnit) -> Result<(Action, String), UnitError> {
        let dependencies = self.resolve_dependencies(&unit.representative)?;
        let first = self.send(unit, unit.action, unit.remote_id.as_deref(), &dependencies)?;
        match first {
            Attempt::StaleReference { status, detail } => {
                tracing::warn!(
                    "{}: remote {} for {} is gone (HTTP {status}: {detail}); retrying as CREATE",
                    self.job.table.table,
                    unit.remote_id.as_deref().unwrap_or("?"),
                    unit.label()
                );
                self.emit(&format!("  stale remote reference ({detail}); retrying as CREATE"));
                let retry = self.send(unit, Action::Create, None, &dependencies)?;
                retry.into_result().map(|id| (Action::Create, id))
            }
            other => other.into_result().map(|id| (unit.action, id)),
        }
    }

    fn send(
        &self,
        unit: &WorkUnit,
        action: Action,
        remote_id: Option<&str>,
        dependencies: &BTreeMap<String, String>,
    ) -> Result<Attempt, UnitError> {
        let ctx = BuildContext {
            action,
            remote_id,
            dependencies,
            mappings: self.mappings,
        };
        let payload = self.payload.build(&unit.representative, &ctx)?;

        let endpoints = &self.job.endpoints;
        let endpoint = match action {
            Action::Create => &endpoints.create,
            Action::Update => &endpoints.update,
        };
        let mut request = ApiRequest::new(endpoint.method, endpoint.path.clone()).with_body(payload);
        if let (Action::Update, Some(id)) = (action, remote_id) {
            request = request.with_path_param(endpoints.id_param.clone(), id);
        }
        let response = self.client.request(&request);
        Ok(classify(action, remote_id, &response, endpoints, &self.job.table))
    }

    /// Remote ids of every referenced dependency, keyed by source column.
    /// A null reference needs nothing; an unsynced one is not ready.
    fn resolve_dependencies(&self, record: &VersionRecord) -> Result<BTreeMap<String, String>, UnitError> {
        let mut resolved = BTreeMap::new();
        for dep in &self.job.dependencies {
            let key = match record.field(&dep.column) {
                Some(Value::Number(n)) => n.as_i64().map(RecordKey::Int),
                Some(Value::String(s)) if !s.trim().is_empty() => Some(RecordKey::Text(s.trim().to_owned())),
                _ => None,
            };
            let Some(key) = key else {
                continue;
            };
            match self.dependencies.remote_id(&dep.job, &key)? {
                Some(id) => {
                    resolved.insert(dep.column.clone(), id);
                }
                None => {
                    return Err(UnitError::DependencyNotReady {
                        entity: dep.job.clone(),
                        key: key.to_string(),
                    })
                }
            }
        }
        Ok(resolved)
    }

    fn emit(&self, line: &str) {
        self.sink.line(line);
    }
}

fn error_chain(err: &dyn std::error::Error) -> Vec<String> {
    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain
}
