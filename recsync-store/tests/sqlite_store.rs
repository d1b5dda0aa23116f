//! SqliteStore integration tests over an in-memory database.

use recsync_core::{
    Action, AuditEntry, AuditStatus, JobDescriptor, JobId, RecordKey, Schedule, SyncStatus,
    TableSpec, TableStats, ValueMapping, VersionRecord, WorkUnit,
};
use recsync_store::{
    AuditLog, JobStore, LockAttempt, MappingStore, RecordStore, SqliteStore, StoreError,
    SUPERSEDED_MESSAGE,
};
use rstest::rstest;
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn widget_spec() -> TableSpec {
    TableSpec {
        table: "widget".into(),
        primary_key: "vid".into(),
        grouping_key: Some("gid".into()),
        sequence: "idd".into(),
        status_column: "fetchStatus".into(),
        message_column: "fetchMessage".into(),
        remote_id: "aid".into(),
        sentinels: vec!["".into(), "0".into(), "1".into()],
        watermark: None,
    }
}

fn store_with_widgets(rows: &str) -> SqliteStore {
    let store = SqliteStore::in_memory().expect("store");
    store
        .execute_batch(&format!(
            "CREATE TABLE widget (vid INTEGER PRIMARY KEY, gid TEXT, idd INTEGER, \
             fetchStatus TEXT, fetchMessage TEXT, aid TEXT, title TEXT);\n{rows}"
        ))
        .expect("seed");
    store
}

fn row(store: &SqliteStore, vid: i64) -> VersionRecord {
    store
        .get_record(&widget_spec(), &RecordKey::Int(vid))
        .expect("get")
        .expect("row exists")
}

fn unit(store: &SqliteStore, rep: i64, keys: &[i64], remote_id: Option<&str>) -> WorkUnit {
    WorkUnit {
        action: if remote_id.is_some() { Action::Update } else { Action::Create },
        representative: row(store, rep),
        remote_id: remote_id.map(str::to_owned),
        all_keys_in_group: keys.iter().copied().map(RecordKey::Int).collect(),
    }
}

fn job(id: &str) -> JobDescriptor {
    JobDescriptor::new(JobId::from(id), id.to_uppercase(), Schedule::daily(3, 0), true)
}

// ---------------------------------------------------------------------------
// 1. Discovery reads
// ---------------------------------------------------------------------------

#[test]
fn pending_keys_are_distinct_ordered_and_capped() {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES \
         (1, 'G2', 1, NULL, NULL, NULL, 'a'), \
         (2, 'G1', 2, 'SKIPPED', 'later', NULL, 'b'), \
         (3, 'G2', 3, NULL, NULL, NULL, 'c'), \
         (4, 'G3', 4, 'SYNCED', NULL, '9', 'd'), \
         (5, 'G4', 5, NULL, NULL, NULL, 'e');",
    );
    let keys = store.pending_group_keys(&widget_spec(), 2, None).expect("keys");
    assert_eq!(keys, vec![RecordKey::from("G1"), RecordKey::from("G2")]);

    let all = store.pending_group_keys(&widget_spec(), 200, None).expect("keys");
    assert_eq!(all.len(), 3, "G3 is synced and must not appear");
}

#[test]
fn pending_keys_respect_watermark() {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES (1, 'G1', 50, NULL, NULL, NULL, 'x');",
    );
    let keys = store.pending_group_keys(&widget_spec(), 200, Some(100)).expect("keys");
    assert!(keys.is_empty());
}

#[test]
fn fetch_groups_returns_every_version_with_fields() {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES \
         (1, 'G1', 7, 'SUPERSEDED', 'old', NULL, 'first'), \
         (2, 'G1', 10, NULL, NULL, NULL, 'second'), \
         (3, 'G2', 11, NULL, NULL, NULL, 'other');",
    );
    let rows = store
        .fetch_groups(&widget_spec(), &[RecordKey::from("G1")], None)
        .expect("fetch");
    assert_eq!(rows.len(), 2);
    let newest = rows.iter().find(|r| r.sequence == 10).expect("seq 10");
    assert_eq!(newest.status, SyncStatus::Pending);
    assert_eq!(newest.field("title"), Some(&json!("second")));
    let oldest = rows.iter().find(|r| r.sequence == 7).expect("seq 7");
    assert_eq!(oldest.status, SyncStatus::Superseded);
}

#[test]
fn unknown_status_is_an_error() {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES (1, 'G1', 1, 'WEIRD', NULL, NULL, 'x');",
    );
    let err = store
        .fetch_groups(&widget_spec(), &[RecordKey::from("G1")], None)
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownStatus { .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// 2. Finalize
// ---------------------------------------------------------------------------

#[test]
fn skipped_touches_only_the_representative() {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES \
         (1, 'G1', 1, NULL, NULL, NULL, 'a'), \
         (2, 'G1', 2, NULL, NULL, NULL, 'b');",
    );
    let u = unit(&store, 2, &[1, 2], None);
    let n = store
        .finalize(&widget_spec(), &u, SyncStatus::Skipped, None, Some("dependency not ready"))
        .expect("finalize");
    assert_eq!(n, 1);
    assert_eq!(row(&store, 2).status, SyncStatus::Skipped);
    assert_eq!(row(&store, 2).message.as_deref(), Some("dependency not ready"));
    assert_eq!(row(&store, 1).status, SyncStatus::Pending);
}

#[rstest]
#[case::synced(SyncStatus::Synced)]
#[case::failed(SyncStatus::Failed)]
fn terminal_status_converges_the_group(#[case] status: SyncStatus) {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES \
         (1, 'G1', 1, 'FAILED', 'bad', '7', 'a'), \
         (2, 'G1', 2, 'SKIPPED', NULL, NULL, 'b'), \
         (3, 'G1', 3, NULL, NULL, NULL, 'c');",
    );
    let u = unit(&store, 3, &[1, 2, 3], Some("7"));
    let n = store
        .finalize(&widget_spec(), &u, status, Some("7"), Some("done"))
        .expect("finalize");
    assert_eq!(n, 3);

    let rep = row(&store, 3);
    assert_eq!(rep.status, status);
    assert_eq!(rep.remote_id.as_deref(), Some("7"));
    for vid in [1, 2] {
        let other = row(&store, vid);
        assert_eq!(other.status, SyncStatus::Superseded);
        assert_eq!(other.message.as_deref(), Some(SUPERSEDED_MESSAGE));
    }
    // Non-representative remote ids are left untouched.
    assert_eq!(row(&store, 1).remote_id.as_deref(), Some("7"));
    assert_eq!(row(&store, 2).remote_id, None);
}

#[test]
fn terminal_finalize_is_idempotent() {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES \
         (1, 'G1', 1, NULL, NULL, NULL, 'a'), \
         (2, 'G1', 2, NULL, NULL, NULL, 'b');",
    );
    let u = unit(&store, 2, &[1, 2], None);
    let spec = widget_spec();
    store.finalize(&spec, &u, SyncStatus::Synced, Some("42"), None).expect("first");
    let before = (row(&store, 1), row(&store, 2));
    store.finalize(&spec, &u, SyncStatus::Synced, Some("42"), None).expect("second");
    assert_eq!((row(&store, 1), row(&store, 2)), before);
}

#[test]
fn missing_remote_id_keeps_the_stored_one() {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES (1, 'G1', 1, NULL, NULL, '5', 'a');",
    );
    let u = unit(&store, 1, &[1], Some("5"));
    store
        .finalize(&widget_spec(), &u, SyncStatus::Failed, None, Some("HTTP 422"))
        .expect("finalize");
    assert_eq!(row(&store, 1).remote_id.as_deref(), Some("5"));
}

#[rstest]
#[case::pending(SyncStatus::Pending)]
#[case::superseded(SyncStatus::Superseded)]
#[case::ignored(SyncStatus::Ignored)]
fn non_outcome_status_is_rejected(#[case] status: SyncStatus) {
    let store = store_with_widgets("INSERT INTO widget VALUES (1, 'G1', 1, NULL, NULL, NULL, 'a');");
    let u = unit(&store, 1, &[1], None);
    let err = store.finalize(&widget_spec(), &u, status, None, None).unwrap_err();
    assert!(matches!(err, StoreError::InvalidFinalStatus(s) if s == status));
}

// ---------------------------------------------------------------------------
// 3. Operator record actions and dependency lookup
// ---------------------------------------------------------------------------

#[test]
fn retry_and_ignore_flip_a_single_row() {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES \
         (1, 'G1', 1, 'FAILED', 'HTTP 400', NULL, 'a'), \
         (2, 'G2', 2, 'skipped ', 'HTTP 503', NULL, 'b');",
    );
    let spec = widget_spec();
    assert_eq!(store.reset_to_pending(&spec, &RecordKey::Int(1)).expect("retry"), 1);
    assert_eq!(row(&store, 1).status, SyncStatus::Pending);
    assert_eq!(row(&store, 1).message, None);

    assert_eq!(store.mark_ignored(&spec, &RecordKey::Int(2), "manual").expect("ignore"), 1);
    assert_eq!(row(&store, 2).status, SyncStatus::Ignored);
    assert_eq!(row(&store, 2).message.as_deref(), Some("manual"));
    assert_eq!(
        store.pending_group_keys(&spec, 10, None).expect("keys"),
        vec![RecordKey::Text("G1".into())]
    );

    assert_eq!(store.reset_to_pending(&spec, &RecordKey::Int(99)).expect("retry"), 0);
}

#[rstest]
#[case::superseded("SUPERSEDED")]
#[case::synced("SYNCED")]
#[case::skipped("SKIPPED")]
#[case::pending("NULL")]
fn retry_only_touches_failed_rows(#[case] status: &str) {
    let store = store_with_widgets(&format!(
        "INSERT INTO widget VALUES (1, 'G1', 1, {}, 'kept', '8', 'a');",
        if status == "NULL" { status.to_owned() } else { format!("'{status}'") }
    ));
    let before = row(&store, 1);
    assert_eq!(store.reset_to_pending(&widget_spec(), &RecordKey::Int(1)).expect("retry"), 0);
    assert_eq!(row(&store, 1), before);
}

#[rstest]
#[case::synced("SYNCED")]
#[case::failed("FAILED")]
#[case::superseded("SUPERSEDED")]
#[case::pending("NULL")]
fn ignore_only_touches_skipped_rows(#[case] status: &str) {
    let store = store_with_widgets(&format!(
        "INSERT INTO widget VALUES (1, 'G1', 1, {}, 'kept', '8', 'a');",
        if status == "NULL" { status.to_owned() } else { format!("'{status}'") }
    ));
    let before = row(&store, 1);
    assert_eq!(store.mark_ignored(&widget_spec(), &RecordKey::Int(1), "x").expect("ignore"), 0);
    assert_eq!(row(&store, 1), before);
}

#[test]
fn retrying_a_superseded_version_cannot_reopen_a_converged_group() {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES \
         (1, 'G1', 1, 'SUPERSEDED', 'Superseded by a newer entry', '8', 'old title'), \
         (2, 'G1', 2, 'SYNCED', NULL, '8', 'new title');",
    );
    let spec = widget_spec();
    assert_eq!(store.reset_to_pending(&spec, &RecordKey::Int(1)).expect("retry"), 0);
    assert_eq!(store.mark_ignored(&spec, &RecordKey::Int(2), "x").expect("ignore"), 0);
    assert!(store.pending_group_keys(&spec, 10, None).expect("keys").is_empty());
    assert_eq!(row(&store, 2).status, SyncStatus::Synced);
}

#[test]
fn stats_count_groups_by_newest_row_and_superseded_rows() {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES \
         (1, 'G1', 1, 'SUPERSEDED', NULL, '8', 'a'), \
         (2, 'G1', 2, 'SYNCED', NULL, '8', 'b'), \
         (3, 'G2', 3, 'FAILED', 'HTTP 422', NULL, 'c'), \
         (4, 'G2', 4, NULL, NULL, NULL, 'd'), \
         (5, 'G3', 5, 'SKIPPED', NULL, NULL, 'e'), \
         (6, 'G4', 6, 'IGNORED', 'dup', NULL, 'f'), \
         (7, 'G5', 7, 'FAILED', 'HTTP 400', NULL, 'g');",
    );
    let stats = store.table_stats(&widget_spec()).expect("stats");
    assert_eq!(
        stats,
        TableStats {
            groups: 5,
            pending: 1,
            skipped: 1,
            synced: 1,
            failed: 1,
            ignored: 1,
            superseded: 1,
        }
    );
}

#[test]
fn records_with_status_are_newest_first_and_capped() {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES \
         (1, 'G1', 1, 'FAILED', 'a', NULL, 'a'), \
         (2, 'G2', 2, 'FAILED', 'b', NULL, 'b'), \
         (3, 'G3', 3, 'SKIPPED', 'c', NULL, 'c'), \
         (4, 'G4', 4, 'failed', 'd', NULL, 'd'), \
         (5, 'G5', 5, '', NULL, NULL, 'e');",
    );
    let spec = widget_spec();
    let failed = store.records_with_status(&spec, SyncStatus::Failed, 2).expect("failed");
    let keys: Vec<_> = failed.iter().map(|r| r.primary_key.clone()).collect();
    assert_eq!(keys, vec![RecordKey::Int(4), RecordKey::Int(2)]);

    let pending = store.records_with_status(&spec, SyncStatus::Pending, 10).expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].primary_key, RecordKey::Int(5));
}

#[test]
fn latest_remote_id_skips_sentinels_and_prefers_newest() {
    let store = store_with_widgets(
        "INSERT INTO widget VALUES \
         (1, 'G1', 1, 'SUPERSEDED', NULL, '11', 'a'), \
         (2, 'G1', 2, 'SYNCED', NULL, '12', 'b'), \
         (3, 'G1', 3, NULL, NULL, '0', 'c'), \
         (4, 'G2', 4, NULL, NULL, '1', 'd');",
    );
    let spec = widget_spec();
    assert_eq!(
        store.latest_remote_id(&spec, "gid", &RecordKey::from("G1")).expect("lookup"),
        Some("12".to_owned())
    );
    assert_eq!(
        store.latest_remote_id(&spec, "gid", &RecordKey::from("G2")).expect("lookup"),
        None
    );
}

// ---------------------------------------------------------------------------
// 4. Jobs and the global lock
// ---------------------------------------------------------------------------

#[test]
fn ensure_job_keeps_operator_settings() {
    let store = SqliteStore::in_memory().expect("store");
    assert!(store.ensure_job(&job("a")).expect("create"));
    store.set_enabled(&JobId::from("a"), false).expect("disable");
    store
        .set_schedule(&JobId::from("a"), &Schedule::daily(5, 30))
        .expect("schedule");

    assert!(!store.ensure_job(&job("a")).expect("again"));
    let stored = store.get_job(&JobId::from("a")).expect("get").expect("exists");
    assert!(!stored.enabled);
    assert_eq!(stored.schedule, Schedule::daily(5, 30));
}

#[test]
fn lock_is_global_across_jobs() {
    let store = SqliteStore::in_memory().expect("store");
    store.ensure_job(&job("a")).expect("a");
    store.ensure_job(&job("b")).expect("b");

    assert_eq!(store.try_acquire(&JobId::from("a")).expect("a"), LockAttempt::Acquired);
    assert_eq!(
        store.try_acquire(&JobId::from("b")).expect("b"),
        LockAttempt::Blocked { by: JobId::from("a") }
    );
    assert_eq!(
        store.try_acquire(&JobId::from("a")).expect("a again"),
        LockAttempt::Blocked { by: JobId::from("a") }
    );
    assert!(!store.get_job(&JobId::from("b")).expect("get").expect("b").is_running);

    store.release(&JobId::from("a")).expect("release");
    assert_eq!(store.try_acquire(&JobId::from("b")).expect("b"), LockAttempt::Acquired);
}

#[test]
fn acquire_unknown_job() {
    let store = SqliteStore::in_memory().expect("store");
    assert_eq!(
        store.try_acquire(&JobId::from("ghost")).expect("attempt"),
        LockAttempt::UnknownJob
    );
}

#[test]
fn cancel_only_latches_on_running_job() {
    let store = SqliteStore::in_memory().expect("store");
    let id = JobId::from("a");
    store.ensure_job(&job("a")).expect("a");
    assert!(!store.request_cancel(&id).expect("idle cancel"));
    assert!(!store.cancellation_requested(&id).expect("flag"));

    store.try_acquire(&id).expect("acquire");
    assert!(store.request_cancel(&id).expect("cancel"));
    assert!(store.cancellation_requested(&id).expect("flag"));

    store.release(&id).expect("release");
    assert!(!store.cancellation_requested(&id).expect("flag cleared"));
}

#[test]
fn reset_all_locks_recovers_stale_state() {
    let store = SqliteStore::in_memory().expect("store");
    store.ensure_job(&job("a")).expect("a");
    store.ensure_job(&job("b")).expect("b");
    store.try_acquire(&JobId::from("a")).expect("acquire");
    store.request_cancel(&JobId::from("a")).expect("cancel");

    assert_eq!(store.reset_all_locks().expect("reset"), 1);
    assert!(store.list_jobs().expect("list").iter().all(|j| !j.is_running && !j.cancellation_requested));
}

// ---------------------------------------------------------------------------
// 5. Audit and mappings
// ---------------------------------------------------------------------------

#[test]
fn audit_is_newest_first_and_filterable() {
    let store = SqliteStore::in_memory().expect("store");
    let a = JobId::from("a");
    store.append(&AuditEntry::new(a.clone(), AuditStatus::Started, "go")).expect("1");
    store
        .append(
            &AuditEntry::new(a.clone(), AuditStatus::Success, "done")
                .with_duration(1.5)
                .with_details(json!({"synced": ["G1"]})),
        )
        .expect("2");
    store
        .append(&AuditEntry::new(JobId::from("b"), AuditStatus::Failure, "boom"))
        .expect("3");

    let all = store.recent(None, 10).expect("all");
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].status, AuditStatus::Failure);

    let only_a = store.recent(Some(&a), 10).expect("a");
    assert_eq!(only_a.len(), 2);
    assert_eq!(only_a[0].duration_seconds, Some(1.5));
    assert_eq!(only_a[0].details, json!({"synced": ["G1"]}));
    assert_eq!(only_a[1].details, serde_json::Value::Null);

    assert_eq!(store.recent(None, 1).expect("limited").len(), 1);
}

#[test]
fn mappings_upsert_and_list() {
    let store = SqliteStore::in_memory().expect("store");
    let mut red = ValueMapping {
        map_type: "color".into(),
        source_id: "R".into(),
        source_name: Some("Red".into()),
        remote_id: "100".into(),
    };
    store.upsert_mapping(&red).expect("insert");
    red.remote_id = "101".into();
    store.upsert_mapping(&red).expect("update");
    store
        .upsert_mapping(&ValueMapping {
            map_type: "size".into(),
            source_id: "L".into(),
            source_name: None,
            remote_id: "3".into(),
        })
        .expect("insert size");

    assert_eq!(
        store.get_mapping("color", "R").expect("get").map(|m| m.remote_id),
        Some("101".to_owned())
    );
    assert!(store.get_mapping("color", "G").expect("get").is_none());
    assert_eq!(store.list_mappings(None).expect("all").len(), 2);
    assert_eq!(store.list_mappings(Some("size")).expect("size").len(), 1);
}
