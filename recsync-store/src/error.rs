//! Store error types.

use recsync_core::SyncStatus;

/// Errors produced by the storage traits in [`crate::backend`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("{table}: unrecognised status value '{value}'")]
    UnknownStatus { table: String, value: String },

    #[error("{table}: column '{column}' is missing or null")]
    MissingValue { table: String, column: String },

    /// Only `Skipped`, `Synced` and `Failed` close or park a work unit.
    #[error("{0} is not a valid finalize outcome")]
    InvalidFinalStatus(SyncStatus),

    #[error("invalid stored timestamp '{0}'")]
    Timestamp(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StoreError>;
