//! Finalizer: write a unit's outcome back and converge its version group.

use recsync_core::{SyncStatus, TableSpec, WorkUnit};
use recsync_store::{RecordStore, StoreError};

pub struct Finalizer<'a> {
    records: &'a dyn RecordStore,
    spec: &'a TableSpec,
}

impl<'a> Finalizer<'a> {
    pub fn new(records: &'a dyn RecordStore, spec: &'a TableSpec) -> Self {
        Self { records, spec }
    }

    /// `Skipped` parks only the representative; `Synced`/`Failed` close the
    /// whole group. A missing `remote_id` falls back to the id the unit was
    /// discovered with, so a failed update never loses a known binding.
    pub fn finalize(
        &self,
        unit: &WorkUnit,
        status: SyncStatus,
        remote_id: Option<&str>,
        message: Option<&str>,
    ) -> Result<usize, StoreError> {
        let resolved = remote_id.or(unit.remote_id.as_deref());
        let affected = self
            .records
            .finalize(self.spec, unit, status, resolved, message)?;

        let expected = if status.is_terminal() {
            unit.all_keys_in_group.len()
        } else {
            1
        };
        if affected != expected {
            tracing::warn!(
                "{}: finalize {} as {status} touched {affected} row(s), expected {expected}",
                self.spec.table,
                unit.label()
            );
        }
        Ok(affected)
    }
}
