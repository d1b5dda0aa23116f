//! Shared sync pipeline entrypoint used by CLI and daemon.
//!
//! A [`Pipeline`] ties a loaded [`Config`] to a store and a remote client,
//! and runs configured jobs through the [`Supervisor`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use recsync_core::{Config, JobDescriptor, JobId};
use recsync_store::{AuditLog, JobStore, MappingStore, RecordStore, SqliteStore};

use crate::engine::{ProgressSink, RunReport, SyncJob};
use crate::error::SyncError;
use crate::http::{HttpApiClient, LoginToken, StaticToken};
use crate::lookup::{Memoized, StoreDependencies, StoreMappings};
use crate::payload::{FieldMapPayloadBuilder, PayloadBuilder};
use crate::remote::RemoteApiClient;
use crate::supervisor::Supervisor;

/// Every storage contract the pipeline needs, in one bound.
pub trait Store: RecordStore + JobStore + AuditLog + MappingStore {}

impl<T: RecordStore + JobStore + AuditLog + MappingStore> Store for T {}

pub struct Pipeline<S> {
    config: Config,
    store: Arc<S>,
    client: Arc<dyn RemoteApiClient>,
    supervisor: Supervisor,
    builders: HashMap<JobId, Box<dyn PayloadBuilder>>,
}

impl<S: Store + 'static> Pipeline<S> {
    pub fn new(config: Config, store: Arc<S>, client: Arc<dyn RemoteApiClient>) -> Self {
        let supervisor = Supervisor::new(store.clone());
        Self {
            config,
            store,
            client,
            supervisor,
            builders: HashMap::new(),
        }
    }

    /// Replace the config-driven payload builder for one job.
    pub fn with_payload_builder(mut self, job_id: JobId, builder: Box<dyn PayloadBuilder>) -> Self {
        self.builders.insert(job_id, builder);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Seed a descriptor for every configured job. Returns how many were new.
    pub fn register_jobs(&self) -> Result<usize, SyncError> {
        let mut created = 0;
        for job in &self.config.jobs {
            let descriptor = JobDescriptor::new(
                job.id.clone(),
                job.display_name(),
                job.schedule,
                job.enabled,
            );
            if self.store.ensure_job(&descriptor)? {
                tracing::info!("registered job '{}'", job.id);
                created += 1;
            }
        }
        Ok(created)
    }

    /// Run one job to completion under the global lock.
    ///
    /// Does not consult the `enabled` flag; that gates scheduled runs only.
    pub fn run_job(&self, job_id: &JobId, sink: &dyn ProgressSink) -> Result<RunReport, SyncError> {
        let job = self
            .config
            .job(job_id)
            .ok_or_else(|| SyncError::UnknownJob(job_id.clone()))?;

        self.supervisor.run(job_id, |cancel| {
            let default_builder;
            let payload: &dyn PayloadBuilder = match self.builders.get(job_id) {
                Some(builder) => builder.as_ref(),
                None => {
                    default_builder = FieldMapPayloadBuilder::from_job(job);
                    &default_builder
                }
            };
            let mappings = Memoized::new(StoreMappings::new(self.store.as_ref()));
            let dependencies =
                Memoized::new(StoreDependencies::new(self.store.as_ref(), &self.config.jobs));

            SyncJob {
                job,
                records: self.store.as_ref(),
                audit: self.store.as_ref(),
                client: self.client.as_ref(),
                payload,
                mappings: &mappings,
                dependencies: &dependencies,
                record_limit: self.config.record_limit,
                sink,
            }
            .run(cancel)
        })
    }
}

/// Production wiring for the process that owns scheduling: [`connect`], then
/// clear every lock left behind by an unclean shutdown.
pub fn open(config: Config) -> Result<Pipeline<SqliteStore>, SyncError> {
    let pipeline = connect(config)?;
    pipeline.supervisor().recover()?;
    Ok(pipeline)
}

/// SQLite store at the configured path plus the HTTP client, with every
/// configured job registered. Leaves existing locks alone.
pub fn connect(config: Config) -> Result<Pipeline<SqliteStore>, SyncError> {
    let store = Arc::new(SqliteStore::open(config.database_path()?)?);
    let remote = &config.remote;
    let base_url = remote
        .base_url
        .clone()
        .ok_or(recsync_core::ConfigError::Missing("remote.base_url"))?;
    let timeout = Duration::from_secs(remote.timeout_secs);
    let client: Arc<dyn RemoteApiClient> = match &remote.login {
        Some(login) => Arc::new(HttpApiClient::new(
            base_url.clone(),
            timeout,
            LoginToken::new(&base_url, login, timeout),
        )),
        None => Arc::new(HttpApiClient::new(
            base_url,
            timeout,
            StaticToken(remote.token.clone()),
        )),
    };
    let pipeline = Pipeline::new(config, store, client);
    pipeline.register_jobs()?;
    Ok(pipeline)
}
