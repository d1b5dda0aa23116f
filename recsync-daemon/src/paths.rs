use std::path::{Path, PathBuf};
use std::time::Duration;

use recsync_core::config::root_at;

pub const DAEMON_SOCKET: &str = "daemon.sock";

/// How often the scheduler wakes to look for due jobs.
pub const SCHEDULER_TICK: Duration = Duration::from_secs(30);

pub fn recsync_root(home: &Path) -> PathBuf {
    root_at(home)
}

pub fn socket_path(home: &Path) -> PathBuf {
    recsync_root(home).join(DAEMON_SOCKET)
}
