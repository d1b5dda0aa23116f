//! recsync core library: domain types, configuration, errors.
//!
//! - [`types`]: newtypes and domain structs shared by every crate
//! - [`config`]: YAML config load / overrides / validation
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, JobConfig, TableSpec};
pub use error::ConfigError;
pub use types::{
    Action, AuditEntry, AuditStatus, JobDescriptor, JobId, RecordKey, Schedule, SyncStatus,
    TableStats, ValueMapping, VersionRecord, WorkUnit,
};
