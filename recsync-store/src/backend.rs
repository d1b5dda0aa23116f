//! Storage trait definitions.
//!
//! Four contracts, all implemented by [`crate::SqliteStore`]:
//! - [`RecordStore`]: versioned source tables (discovery reads, finalize writes)
//! - [`JobStore`]: job descriptors with the global run lock and cancel flag
//! - [`AuditLog`]: append-only run history
//! - [`MappingStore`]: local value-to-remote-id mappings
//!
//! Implementations must be `Send + Sync` for use behind `Arc<dyn ...>`.

use recsync_core::{
    AuditEntry, JobDescriptor, JobId, RecordKey, Schedule, SyncStatus, TableSpec, TableStats,
    ValueMapping, VersionRecord, WorkUnit,
};

use crate::error;

/// Outcome of [`JobStore::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// Some job (possibly the requester itself) is already running.
    Blocked { by: JobId },
    /// No descriptor exists for the requested job.
    UnknownJob,
}

/// Read and write access to versioned source tables.
pub trait RecordStore: Send + Sync {
    /// Distinct grouping keys with at least one `Pending`/`Skipped` row, ascending, capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn pending_group_keys(
        &self,
        spec: &TableSpec,
        limit: usize,
        watermark: Option<i64>,
    ) -> error::Result<Vec<RecordKey>>;

    /// Every row whose grouping key is in `keys`, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure
    /// or when a row carries an unrecognised status.
    fn fetch_groups(
        &self,
        spec: &TableSpec,
        keys: &[RecordKey],
        watermark: Option<i64>,
    ) -> error::Result<Vec<VersionRecord>>;

    /// A single row by primary key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn get_record(&self, spec: &TableSpec, key: &RecordKey)
        -> error::Result<Option<VersionRecord>>;

    /// Write a unit's outcome. `Skipped` touches only the representative;
    /// `Synced`/`Failed` update every key of the group in one statement,
    /// superseding the non-representative rows. `remote_id` is already resolved.
    ///
    /// Returns the number of rows affected.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidFinalStatus`](crate::error::StoreError::InvalidFinalStatus)
    /// for any other status.
    fn finalize(
        &self,
        spec: &TableSpec,
        unit: &WorkUnit,
        status: SyncStatus,
        remote_id: Option<&str>,
        message: Option<&str>,
    ) -> error::Result<usize>;

    /// Manual retry: a `Failed` row goes back to `Pending`, message cleared.
    /// Rows in any other state are left alone; returns rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn reset_to_pending(&self, spec: &TableSpec, key: &RecordKey) -> error::Result<usize>;

    /// Mark a `Skipped` row `Ignored`; it is never discovered again.
    /// Rows in any other state are left alone; returns rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn mark_ignored(&self, spec: &TableSpec, key: &RecordKey, message: &str)
        -> error::Result<usize>;

    /// Group and row counts by sync status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure
    /// or an unrecognised status value.
    fn table_stats(&self, spec: &TableSpec) -> error::Result<TableStats>;

    /// Rows in `status`, newest sequence first, capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn records_with_status(
        &self,
        spec: &TableSpec,
        status: SyncStatus,
        limit: usize,
    ) -> error::Result<Vec<VersionRecord>>;

    /// Remote id of the most recent row whose `column` equals `key` and whose
    /// remote id is not a sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn latest_remote_id(
        &self,
        spec: &TableSpec,
        column: &str,
        key: &RecordKey,
    ) -> error::Result<Option<String>>;
}

/// Persisted job descriptors.
///
/// At most one descriptor system-wide may have `is_running = true`.
pub trait JobStore: Send + Sync {
    /// Insert a descriptor if absent. Existing rows keep their operator-set
    /// `enabled` flag and schedule; only the display name is refreshed.
    ///
    /// Returns `true` when a row was created.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn ensure_job(&self, job: &JobDescriptor) -> error::Result<bool>;

    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn get_job(&self, job_id: &JobId) -> error::Result<Option<JobDescriptor>>;

    /// All descriptors ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn list_jobs(&self) -> error::Result<Vec<JobDescriptor>>;

    /// Returns `false` when the job does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn set_enabled(&self, job_id: &JobId, enabled: bool) -> error::Result<bool>;

    /// Returns `false` when the job does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn set_schedule(&self, job_id: &JobId, schedule: &Schedule) -> error::Result<bool>;

    /// Check-and-set in one transaction: fails if *any* job is running,
    /// otherwise marks `job_id` running with its cancel flag cleared.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn try_acquire(&self, job_id: &JobId) -> error::Result<LockAttempt>;

    /// Clear `is_running` and `cancellation_requested` for `job_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn release(&self, job_id: &JobId) -> error::Result<()>;

    /// Latch the cancel flag, but only on a running job. Returns whether it was set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn request_cancel(&self, job_id: &JobId) -> error::Result<bool>;

    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn cancellation_requested(&self, job_id: &JobId) -> error::Result<bool>;

    /// Startup recovery: clear every lock and cancel flag. Returns rows touched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn reset_all_locks(&self) -> error::Result<usize>;
}

/// Append-only run history.
pub trait AuditLog: Send + Sync {
    /// Returns the new entry's row id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn append(&self, entry: &AuditEntry) -> error::Result<i64>;

    /// Newest first, optionally filtered to one job.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn recent(&self, job_id: Option<&JobId>, limit: usize) -> error::Result<Vec<AuditEntry>>;
}

/// `(map_type, source_id) -> remote_id` translations.
pub trait MappingStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn get_mapping(&self, map_type: &str, source_id: &str) -> error::Result<Option<ValueMapping>>;

    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn upsert_mapping(&self, mapping: &ValueMapping) -> error::Result<()>;

    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn list_mappings(&self, map_type: Option<&str>) -> error::Result<Vec<ValueMapping>>;
}
