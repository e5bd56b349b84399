//! Per-file pid markers
//!
//! Every launched child gets a marker file `<task>-<file>.pid` in the pids
//! folder, holding the child pid in plain text. Markers answer two
//! questions the ledger cannot:
//! - is a file currently owned by a live process (dedup across restarts)?
//! - after a crash, which recorded tasks are actually still running?

use hotfolder_foundation::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What a marker file says about its task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// No marker file
    Absent,

    /// Marker present and the recorded pid is alive
    Live(u32),

    /// Marker present but the pid is dead or the file is unreadable
    Stale(u32),
}

/// The folder of pid marker files
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Marker path for a task/file pair: `<pids_dir>/<task>-<file>.pid`
    pub fn marker_path(&self, task_name: &str, input: &Path) -> PathBuf {
        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.dir.join(format!("{task_name}-{file_name}.pid"))
    }

    /// Write the marker for a freshly launched child
    pub fn create(&self, task_name: &str, input: &Path, pid: u32) -> Result<()> {
        let path = self.marker_path(task_name, input);
        std::fs::write(&path, pid.to_string())
            .map_err(|e| Error::Task(format!("cannot write marker '{}': {e}", path.display())))?;
        debug!(marker = %path.display(), pid, "marker created");
        Ok(())
    }

    /// Remove the marker. A missing marker is not an error; finalization
    /// paths may race with each other.
    pub fn remove(&self, task_name: &str, input: &Path) -> Result<()> {
        let path = self.marker_path(task_name, input);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Task(format!(
                "cannot remove marker '{}': {e}",
                path.display()
            ))),
        }
    }

    /// Read the marker and check whether its pid is still alive
    pub fn inspect(&self, task_name: &str, input: &Path) -> MarkerState {
        let path = self.marker_path(task_name, input);
        let contents = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return MarkerState::Absent,
            Err(e) => {
                warn!(marker = %path.display(), error = %e, "unreadable marker treated as stale");
                return MarkerState::Stale(0);
            }
        };

        let pid = match contents.trim().parse::<u32>() {
            Ok(pid) => pid,
            Err(_) => {
                warn!(marker = %path.display(), "corrupt marker treated as stale");
                return MarkerState::Stale(0);
            }
        };

        if pid_alive(pid) {
            MarkerState::Live(pid)
        } else {
            MarkerState::Stale(pid)
        }
    }
}

/// Signal-0 liveness probe. EPERM still means the pid exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_marker_roundtrip() {
        let dir = tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        let input = Path::new("/in/report.csv");

        assert_eq!(store.inspect("convert", input), MarkerState::Absent);

        // our own pid is certainly alive
        let pid = std::process::id();
        store.create("convert", input, pid).unwrap();
        assert_eq!(store.inspect("convert", input), MarkerState::Live(pid));

        store.remove("convert", input).unwrap();
        assert_eq!(store.inspect("convert", input), MarkerState::Absent);
    }

    #[test]
    fn test_remove_missing_marker_is_ok() {
        let dir = tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        assert!(store.remove("convert", Path::new("/in/gone.txt")).is_ok());
    }

    #[test]
    fn test_dead_pid_is_stale() {
        let dir = tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        let input = Path::new("/in/report.csv");

        // pid_max on Linux defaults to well below this
        store.create("convert", input, 4_000_000).unwrap();
        assert_eq!(store.inspect("convert", input), MarkerState::Stale(4_000_000));
    }

    #[test]
    fn test_corrupt_marker_is_stale() {
        let dir = tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        let input = Path::new("/in/report.csv");

        std::fs::write(store.marker_path("convert", input), "not a pid").unwrap();
        assert_eq!(store.inspect("convert", input), MarkerState::Stale(0));
    }

    #[test]
    fn test_marker_name_embeds_task_and_file() {
        let store = MarkerStore::new("/var/run/pids");
        let path = store.marker_path("convert", Path::new("/in/a.txt"));
        assert_eq!(path, PathBuf::from("/var/run/pids/convert-a.txt.pid"));
    }
}
