use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use recsync_store::SqliteStore;
use tempfile::TempDir;

fn recsync_bin() -> PathBuf {
    PathBuf::from(assert_cmd::cargo::cargo_bin!("recsync"))
}

fn recsync(home: &Path) -> Command {
    let mut cmd = Command::new(recsync_bin());
    cmd.env("HOME", home).env("USERPROFILE", home);
    cmd
}

struct DaemonProcess {
    child: Child,
    home: PathBuf,
}

impl DaemonProcess {
    fn start(home: PathBuf) -> Self {
        let child = recsync(&home)
            .args(["daemon", "start"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        Self { child, home }
    }

    fn stop(&mut self) {
        let _ = recsync(&self.home).args(["daemon", "stop"]).status();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn status(home: &Path) -> Option<serde_json::Value> {
    let output = recsync(home).args(["daemon", "status"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    serde_json::from_slice(&output.stdout).ok()
}

fn daemon_running(home: &Path) -> bool {
    status(home)
        .and_then(|v| v.get("running").and_then(|r| r.as_bool()))
        .unwrap_or(false)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

fn setup(home: &Path) {
    let database = home.join("data.db");
    SqliteStore::open(&database)
        .expect("open db")
        .execute_batch(
            "CREATE TABLE widget (vid INTEGER PRIMARY KEY, gid TEXT, idd INTEGER, fetchStatus TEXT,
                                  fetchMessage TEXT, aid TEXT, title TEXT);",
        )
        .expect("schema");
    let root = home.join(".recsync");
    fs::create_dir_all(&root).expect("root");
    fs::write(
        root.join("config.yaml"),
        format!(
            r#"
database: "{}"
remote:
  base_url: "http://127.0.0.1:9"
jobs:
  - id: sync_widgets
    schedule: {{ hour: 2 }}
    table: {{ table: widget, primary_key: vid, grouping_key: gid, remote_id: aid }}
    endpoints:
      create: {{ method: POST, path: /widgets }}
      update: {{ method: PUT, path: "/widgets/{{id}}" }}
"#,
            database.display()
        ),
    )
    .expect("write config");
}

#[test]
fn status_reports_not_running_without_a_daemon() {
    let home = TempDir::new().expect("home");
    let value = status(home.path()).expect("status output");
    assert_eq!(value["running"], false);
}

#[test]
fn daemon_serves_status_and_streamed_runs() {
    let home = TempDir::new().expect("home");
    setup(home.path());

    let mut daemon = DaemonProcess::start(home.path().to_path_buf());
    assert!(
        wait_until(Duration::from_secs(5), || daemon_running(home.path())),
        "daemon did not report running state in time",
    );

    let value = status(home.path()).expect("status");
    assert_eq!(value["jobs"][0]["job_id"], "sync_widgets");
    assert!(value["jobs"][0]["next_run"].is_string());

    let output = recsync(home.path())
        .args(["daemon", "run", "sync_widgets"])
        .output()
        .expect("daemon run");
    assert!(
        output.status.success(),
        "daemon run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Starting job"), "stdout: {stdout}");
    assert!(stdout.contains("Nothing to do"), "stdout: {stdout}");

    let refused = recsync(home.path())
        .args(["daemon", "run", "sync_gadgets"])
        .output()
        .expect("daemon run");
    assert!(!refused.status.success());

    let unlock = recsync(home.path())
        .args(["jobs", "unlock"])
        .output()
        .expect("jobs unlock");
    assert!(!unlock.status.success());
    assert!(
        String::from_utf8_lossy(&unlock.stderr).contains("daemon is running"),
        "stderr: {}",
        String::from_utf8_lossy(&unlock.stderr)
    );

    daemon.stop();
    assert!(
        wait_until(Duration::from_secs(2), || !daemon_running(home.path())),
        "daemon still reports running after stop",
    );
}
