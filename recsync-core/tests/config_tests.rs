//! Config load, error-message, and validation integration tests.

use assert_fs::prelude::*;
use predicates::prelude::predicate;
use recsync_core::{
    config::{self, FieldKind, HttpMethod},
    types::{JobId, Schedule},
    ConfigError,
};
use rstest::rstest;

const FULL: &str = r#"
database: /var/lib/recsync/source.db
remote:
  base_url: https://crm.example.test/api
  timeout_secs: 10
record_limit: 25
jobs:
  - id: sync_people
    name: People
    schedule: { hour: 1, minute: 15 }
    table:
      table: person
      primary_key: pid
      remote_id: crm_id
    endpoints:
      create: { method: POST, path: /people }
      update: { method: PUT, path: "/people/{id}" }
    fields:
      - { target: fullName, column: full_name, kind: string }
  - id: sync_widgets
    schedule: { hour: 2, day_of_week: Mon }
    enabled: false
    batch_size: 50
    table:
      table: widget
      primary_key: vid
      grouping_key: gid
      remote_id: aid
      watermark: 100
    endpoints:
      create: { method: POST, path: /widgets }
      update: { method: PATCH, path: "/widgets/{id}" }
      update_id_field: widgetId
    fields:
      - { target: title, column: title, kind: string }
      - { target: price, column: price, kind: float, default: 0.0 }
      - { target: colorId, column: color, map: color, required: true }
    dependencies:
      - { job: sync_people, column: owner_pid, target: ownerId }
"#;

fn no_env(_: &str) -> Option<String> {
    None
}

fn write_config(home: &assert_fs::TempDir, body: &str) -> std::path::PathBuf {
    let file = home.child(".recsync").child("config.yaml");
    file.write_str(body).expect("write config");
    file.path().to_path_buf()
}

// ---------------------------------------------------------------------------
// 1. Load
// ---------------------------------------------------------------------------

#[test]
fn full_config_loads() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = write_config(&home, FULL);

    let config = config::load_from_with_env(&path, no_env).expect("load");
    assert_eq!(config.jobs.len(), 2);
    assert_eq!(config.record_limit, Some(25));
    assert_eq!(config.remote.timeout_secs, 10);

    let widgets = config.job(&JobId::from("sync_widgets")).expect("widgets job");
    assert!(!widgets.enabled);
    assert_eq!(widgets.batch_size, 50);
    assert_eq!(widgets.table.grouping_key(), "gid");
    assert_eq!(widgets.table.watermark, Some(100));
    assert_eq!(widgets.endpoints.update.method, HttpMethod::Patch);
    assert_eq!(widgets.fields[1].kind, FieldKind::Float);
    assert_eq!(widgets.fields[2].kind, FieldKind::Raw);
    assert!(widgets.fields[2].required);
    assert_eq!(widgets.dependencies[0].job, JobId::from("sync_people"));
    assert_eq!(
        widgets.schedule,
        Schedule {
            hour: 2,
            minute: 0,
            day_of_week: Some(chrono::Weekday::Mon)
        }
    );
}

#[test]
fn config_path_is_under_dot_recsync() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = config::config_path_at(home.path());
    assert!(path.ends_with(".recsync/config.yaml"));
    home.child(".recsync").assert(predicate::path::missing());
}

#[test]
fn load_missing_returns_not_found() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = write_config(&home, ": : corrupt : yaml : !!!\n  - broken: [unclosed");

    let err = config::load_from_with_env(&path, no_env).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"));
}

// ---------------------------------------------------------------------------
// 2. Overrides
// ---------------------------------------------------------------------------

#[test]
fn env_supplies_missing_settings() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = write_config(&home, "jobs: []\n");

    let config = config::load_from_with_env(&path, |key| match key {
        config::ENV_DATABASE => Some("/tmp/x.db".into()),
        config::ENV_API_BASE_URL => Some("http://localhost:9".into()),
        config::ENV_API_TOKEN => Some("secret".into()),
        _ => None,
    })
    .expect("load");
    assert_eq!(config.remote.token.as_deref(), Some("secret"));
    assert_eq!(config.remote.base_url.as_deref(), Some("http://localhost:9"));
}

#[test]
fn login_settings_load_with_password_from_env() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let body = FULL.replacen(
        "  timeout_secs: 10\n",
        "  timeout_secs: 10\n  login:\n    path: /auth/login\n    credentials: { mobile: \"0912\", customerId: 7 }\n",
        1,
    );
    let path = write_config(&home, &body);

    let config = config::load_from_with_env(&path, |key| {
        (key == config::ENV_API_PASSWORD).then(|| "hunter2".to_string())
    })
    .expect("load");
    let login = config.remote.login.expect("login");
    assert_eq!(login.path, "/auth/login");
    assert_eq!(login.token_field, "access_token");
    assert_eq!(login.credentials["customerId"], 7);
    assert_eq!(login.credentials["password"], "hunter2");
}

#[test]
fn password_env_without_login_is_ignored() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = write_config(&home, FULL);
    let config = config::load_from_with_env(&path, |key| {
        (key == config::ENV_API_PASSWORD).then(|| "hunter2".to_string())
    })
    .expect("load");
    assert!(config.remote.login.is_none());
}

#[test]
fn empty_env_value_does_not_override() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = write_config(&home, FULL);
    let config = config::load_from_with_env(&path, |key| {
        (key == config::ENV_DATABASE).then(String::new)
    })
    .expect("load");
    assert_eq!(
        config.database.as_deref(),
        Some(std::path::Path::new("/var/lib/recsync/source.db"))
    );
}

// ---------------------------------------------------------------------------
// 3. Validation
// ---------------------------------------------------------------------------

#[rstest]
#[case::no_database("remote: { base_url: http://x }\n", "database")]
#[case::no_base_url("database: /tmp/a.db\n", "remote.base_url")]
fn missing_required_setting(#[case] body: &str, #[case] key: &str) {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = write_config(&home, body);
    let err = config::load_from_with_env(&path, no_env).unwrap_err();
    assert!(matches!(err, ConfigError::Missing(k) if k == key), "got: {err}");
}

#[rstest]
#[case::duplicate_job("sync_widgets", "sync_people")]
fn duplicate_job_rejected(#[case] from: &str, #[case] to: &str) {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let body = FULL.replacen(&format!("id: {from}"), &format!("id: {to}"), 1);
    let path = write_config(&home, &body);
    let err = config::load_from_with_env(&path, no_env).unwrap_err();
    assert!(matches!(err, ConfigError::DuplicateJob(_)), "got: {err}");
}

#[rstest]
#[case::zero_batch("batch_size: 50", "batch_size: 0")]
#[case::bad_hour("hour: 2, day_of_week", "hour: 24, day_of_week")]
fn invalid_job_settings(#[case] from: &str, #[case] to: &str) {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let body = FULL.replacen(from, to, 1);
    let path = write_config(&home, &body);
    let err = config::load_from_with_env(&path, no_env).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }), "got: {err}");
}

#[test]
fn blank_login_path_rejected() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let body = FULL.replacen("  timeout_secs: 10\n", "  timeout_secs: 10\n  login: { path: \" \" }\n", 1);
    let path = write_config(&home, &body);
    let err = config::load_from_with_env(&path, no_env).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }), "got: {err}");
}

#[test]
fn quoted_identifier_rejected() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let body = FULL.replacen("table: widget", "table: \"widget\\\"x\"", 1);
    let path = write_config(&home, &body);
    let err = config::load_from_with_env(&path, no_env).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidIdentifier { .. }), "got: {err}");
}
