//! Error types for recsync-sync.

use thiserror::Error;

use recsync_core::error::ConfigError;
use recsync_core::{JobId, SyncStatus};
use recsync_store::StoreError;

/// Whole-run errors. Anything here aborts the run before or outside the
/// per-unit loop.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("job '{0}' is not configured")]
    UnknownJob(JobId),
}

/// Why the supervisor refused to start a job body.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("job '{requested}' not started: job '{blocking}' is already running")]
    Conflict { requested: JobId, blocking: JobId },

    #[error("job '{0}' has no descriptor; register it first")]
    UnknownJob(JobId),

    #[error("job lock store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures of the remote client that are not an HTTP response.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error("endpoint '{template}' needs path parameter '{param}'")]
    MissingPathParam { template: String, param: String },
}

/// A per-unit failure. Caught at the unit boundary and turned into a status.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnitError {
    #[error("dependency not ready: {entity} '{key}' has no remote id yet")]
    DependencyNotReady { entity: JobId, key: String },

    #[error("mapping missing: no '{map_type}' mapping for '{key}'")]
    MappingMissing { map_type: String, key: String },

    #[error("HTTP {status}: {detail}")]
    RemoteRejected { status: u16, detail: String },

    #[error("transient remote error: {0}")]
    RemoteTransient(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("store error: {0}")]
    Store(String),
}

impl UnitError {
    /// Only a definitive client-side rejection is terminal; everything else
    /// is retried on the next run.
    pub fn status(&self) -> SyncStatus {
        match self {
            UnitError::RemoteRejected { .. } => SyncStatus::Failed,
            _ => SyncStatus::Skipped,
        }
    }
}

impl From<StoreError> for UnitError {
    fn from(err: StoreError) -> Self {
        UnitError::Store(err.to_string())
    }
}
