//! # recsync-sync
//!
//! Reconciliation engine, finalizer, job supervisor, and the generic sync
//! loop that drives a remote API from versioned source tables.
//!
//! Call [`pipeline::open`] to wire a loaded config to SQLite and HTTP, then
//! [`Pipeline::run_job`] to run one job under the global lock.

pub mod classify;
pub mod engine;
pub mod error;
pub mod finalize;
pub mod http;
pub mod lookup;
pub mod payload;
pub mod pipeline;
pub mod reconcile;
pub mod remote;
pub mod supervisor;

pub use engine::{CancelSignal, NullSink, ProgressSink, RunReport, SyncJob, UnitIssue};
pub use error::{LockError, RemoteError, SyncError, UnitError};
pub use finalize::Finalizer;
pub use pipeline::{Pipeline, Store};
pub use reconcile::discover;
pub use remote::{ApiRequest, ApiResponse, RemoteApiClient};
pub use supervisor::{CancelCheck, Supervisor};
