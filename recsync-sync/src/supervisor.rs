//! Job lock and supervisor: global single-flight execution, crash-safe
//! release, and cooperative cancellation.
//!
//! Lock state lives in the job descriptor table, so it is shared by every
//! process using the same database. The supervisor itself holds no state
//! beyond the store handle.

use std::sync::Arc;

use recsync_core::JobId;
use recsync_store::{JobStore, LockAttempt, StoreError};

use crate::engine::CancelSignal;
use crate::error::LockError;

pub struct Supervisor {
    jobs: Arc<dyn JobStore>,
}

impl Supervisor {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    /// Startup recovery: clears every lock and cancel flag left by an
    /// unclean shutdown. Returns how many descriptors were reset.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let reset = self.jobs.reset_all_locks()?;
        if reset > 0 {
            tracing::warn!("reset {reset} stale job lock(s) from a previous run");
        }
        Ok(reset)
    }

    /// Run `body` under the global lock.
    ///
    /// Refuses to start while any job (this one included) is running. The
    /// lock is released when `body` returns, fails, or panics.
    pub fn run<T, E, F>(&self, job_id: &JobId, body: F) -> Result<T, E>
    where
        F: FnOnce(&CancelCheck<'_>) -> Result<T, E>,
        E: From<LockError>,
    {
        match self.jobs.try_acquire(job_id).map_err(LockError::Store)? {
            LockAttempt::Acquired => {}
            LockAttempt::Blocked { by } => {
                tracing::warn!("job '{job_id}' not started: job '{by}' is running");
                return Err(LockError::Conflict {
                    requested: job_id.clone(),
                    blocking: by,
                }
                .into());
            }
            LockAttempt::UnknownJob => return Err(LockError::UnknownJob(job_id.clone()).into()),
        }

        let _guard = LockGuard {
            jobs: self.jobs.as_ref(),
            job_id,
        };
        tracing::info!("job '{job_id}' acquired the run lock");
        body(&CancelCheck {
            jobs: self.jobs.as_ref(),
            job_id,
        })
    }

    /// Release one job's lock by hand, e.g. after a foreground run was
    /// killed. `false` if the job was not marked running.
    pub fn unlock(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let held = self
            .jobs
            .get_job(job_id)?
            .map_or(false, |descriptor| descriptor.is_running);
        if held {
            self.jobs.release(job_id)?;
            tracing::warn!("job '{job_id}': run lock released by operator");
        }
        Ok(held)
    }

    /// Latch cancellation for a running job. `false` if it was not running.
    pub fn request_cancel(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let latched = self.jobs.request_cancel(job_id)?;
        if latched {
            tracing::info!("cancellation requested for job '{job_id}'");
        }
        Ok(latched)
    }
}

struct LockGuard<'a> {
    jobs: &'a dyn JobStore,
    job_id: &'a JobId,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match self.jobs.release(self.job_id) {
            Ok(()) => tracing::info!("job '{}' released the run lock", self.job_id),
            Err(e) => tracing::error!("job '{}': failed to release run lock: {e}", self.job_id),
        }
    }
}

/// Re-reads the persisted cancel flag on every check.
pub struct CancelCheck<'a> {
    jobs: &'a dyn JobStore,
    job_id: &'a JobId,
}

impl CancelCheck<'_> {
    pub fn job_id(&self) -> &JobId {
        self.job_id
    }
}

impl CancelSignal for CancelCheck<'_> {
    fn should_cancel(&self) -> bool {
        match self.jobs.cancellation_requested(self.job_id) {
            Ok(flag) => flag,
            Err(e) => {
                tracing::warn!("job '{}': cannot read cancel flag: {e}", self.job_id);
                false
            }
        }
    }
}
