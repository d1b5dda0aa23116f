//! Storage for recsync: versioned source tables, job descriptors, audit
//! history, and value mappings.
//!
//! The traits in [`backend`] are the contract the sync engine consumes;
//! [`SqliteStore`] implements all of them over one `rusqlite` connection.

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::{AuditLog, JobStore, LockAttempt, MappingStore, RecordStore};
pub use error::StoreError;
pub use sqlite::{SqliteStore, SUPERSEDED_MESSAGE};
