//! Reconciliation: turn pending version rows into work units.
//!
//! Discovery is read-only. It selects a bounded, ordered batch of grouping
//! keys with actionable rows, fetches every version of those groups in one
//! set-based read, and emits at most one [`WorkUnit`] per group.

use recsync_core::{Action, RecordKey, TableSpec, VersionRecord, WorkUnit};
use recsync_store::{RecordStore, StoreError};

/// Discover up to `batch_size` actionable groups.
///
/// `watermark` excludes rows with a lower sequence from both the key
/// selection and the group fetch.
pub fn discover(
    records: &dyn RecordStore,
    spec: &TableSpec,
    batch_size: usize,
    watermark: Option<i64>,
) -> Result<Vec<WorkUnit>, StoreError> {
    let keys = records.pending_group_keys(spec, batch_size, watermark)?;
    if keys.is_empty() {
        tracing::debug!("{}: no pending groups", spec.table);
        return Ok(Vec::new());
    }
    let rows = records.fetch_groups(spec, &keys, watermark)?;
    let units = build_work_units(rows, spec);
    tracing::info!(
        "{}: {} pending group(s), {} work unit(s)",
        spec.table,
        keys.len(),
        units.len()
    );
    Ok(units)
}

/// Group rows by grouping key and pick each group's representative and action.
///
/// Output is ordered by grouping key.
pub fn build_work_units(mut rows: Vec<VersionRecord>, spec: &TableSpec) -> Vec<WorkUnit> {
    rows.sort_by(|a, b| {
        a.grouping_key
            .cmp(&b.grouping_key)
            .then_with(|| b.sequence.cmp(&a.sequence))
    });

    let mut units = Vec::new();
    let mut start = 0;
    while start < rows.len() {
        let key = &rows[start].grouping_key;
        let end = rows[start..]
            .iter()
            .position(|r| &r.grouping_key != key)
            .map_or(rows.len(), |offset| start + offset);
        if let Some(unit) = unit_for_group(&rows[start..end], spec) {
            units.push(unit);
        }
        start = end;
    }
    units
}

/// `group` is sorted newest first.
fn unit_for_group(group: &[VersionRecord], spec: &TableSpec) -> Option<WorkUnit> {
    let Some(representative) = group.iter().find(|r| r.status.is_actionable()) else {
        tracing::warn!(
            "{}: group '{}' has no pending or skipped row; skipping",
            spec.table,
            group.first().map(|r| &r.grouping_key).map_or_else(String::new, RecordKey::to_string)
        );
        return None;
    };

    let remote_id = group
        .iter()
        .filter_map(|r| r.remote_id.as_deref())
        .map(str::trim)
        .find(|id| !spec.is_sentinel(id))
        .map(str::to_owned);

    Some(WorkUnit {
        action: if remote_id.is_some() {
            Action::Update
        } else {
            Action::Create
        },
        representative: representative.clone(),
        remote_id,
        all_keys_in_group: group.iter().map(|r| r.primary_key.clone()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use recsync_core::SyncStatus;
    use rstest::rstest;

    use super::*;

    fn spec() -> TableSpec {
        serde_json::from_value(serde_json::json!({
            "table": "widget",
            "primary_key": "vid",
            "grouping_key": "gid",
            "remote_id": "aid",
        }))
        .expect("spec")
    }

    fn rec(pk: i64, group: &str, seq: i64, status: SyncStatus, remote: Option<&str>) -> VersionRecord {
        VersionRecord {
            primary_key: RecordKey::Int(pk),
            grouping_key: RecordKey::from(group),
            sequence: seq,
            status,
            message: None,
            remote_id: remote.map(str::to_owned),
            fields: Default::default(),
        }
    }

    #[test]
    fn representative_is_newest_actionable_row() {
        let rows = vec![
            rec(1, "G1", 7, SyncStatus::Superseded, None),
            rec(2, "G1", 10, SyncStatus::Pending, None),
            rec(3, "G1", 12, SyncStatus::Ignored, None),
        ];
        let units = build_work_units(rows, &spec());
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].action, Action::Create);
        assert_eq!(units[0].representative.sequence, 10);
        assert_eq!(units[0].all_keys_in_group.len(), 3);
    }

    #[rstest]
    #[case::order_a([None, None, Some("5")])]
    #[case::order_b([Some("5"), None, None])]
    #[case::order_c([None, Some("5"), None])]
    fn any_valid_remote_id_means_update(#[case] ids: [Option<&str>; 3]) {
        let rows = ids
            .iter()
            .enumerate()
            .map(|(i, id)| rec(i as i64, "G1", i as i64, SyncStatus::Pending, *id))
            .collect();
        let units = build_work_units(rows, &spec());
        assert_eq!(units[0].action, Action::Update);
        assert_eq!(units[0].remote_id.as_deref(), Some("5"));
    }

    #[test]
    fn sentinel_remote_ids_mean_create() {
        let rows = vec![
            rec(1, "G1", 1, SyncStatus::Pending, None),
            rec(2, "G1", 2, SyncStatus::Superseded, Some("0")),
            rec(3, "G1", 3, SyncStatus::Superseded, Some("1")),
        ];
        let units = build_work_units(rows, &spec());
        assert_eq!(units[0].action, Action::Create);
        assert_eq!(units[0].remote_id, None);
    }

    #[test]
    fn newest_valid_remote_id_wins() {
        let rows = vec![
            rec(1, "G1", 1, SyncStatus::Superseded, Some("3")),
            rec(2, "G1", 2, SyncStatus::Synced, Some(" 4 ")),
            rec(3, "G1", 3, SyncStatus::Pending, None),
        ];
        let units = build_work_units(rows, &spec());
        assert_eq!(units[0].remote_id.as_deref(), Some("4"));
    }

    #[test]
    fn one_unit_per_group_and_groups_without_candidates_are_dropped() {
        let rows = vec![
            rec(1, "G2", 1, SyncStatus::Pending, None),
            rec(2, "G1", 2, SyncStatus::Skipped, None),
            rec(3, "G2", 3, SyncStatus::Pending, None),
            rec(4, "G3", 4, SyncStatus::Synced, Some("9")),
            rec(5, "G1", 5, SyncStatus::Superseded, None),
        ];
        let units = build_work_units(rows, &spec());
        let groups: Vec<_> = units.iter().map(|u| u.grouping_key().to_string()).collect();
        assert_eq!(groups, vec!["G1", "G2"]);
        assert_eq!(units[1].representative.primary_key, RecordKey::Int(3));
    }
}
