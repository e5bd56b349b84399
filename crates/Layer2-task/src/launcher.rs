//! Child process launching
//!
//! One external process per file. The child gets the input path as its
//! last argument, runs in its own process group so daemon signals do not
//! reach it, and reports progress by writing to the shared ledger itself.
//!
//! Launch failure is terminal for the submission: the active row moves to
//! history as Aborted and the file is relocated to the failed folder.

use crate::marker::MarkerStore;
use hotfolder_foundation::{ActiveUpdate, Error, Ledger, Result, TaskKind, TaskStatus};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// A launched child under supervision
pub struct TaskHandle {
    pub kind: Arc<TaskKind>,
    pub identity: PathBuf,
    pub pid: u32,
    child: Child,
}

impl TaskHandle {
    /// Non-blocking exit check. `Ok(None)` while the child is still
    /// running; the exit code once it has finished. A signal death maps
    /// to -1 so callers can treat it as any nonzero exit.
    pub fn poll_exit(&mut self) -> Result<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(status.code().unwrap_or(-1))),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Task(format!(
                "cannot poll child {} for '{}': {e}",
                self.pid,
                self.identity.display()
            ))),
        }
    }
}

/// Spawns children and records the outcome of each launch attempt
pub struct Launcher {
    ledger: Arc<Ledger>,
    markers: MarkerStore,
}

impl Launcher {
    pub fn new(ledger: Arc<Ledger>, markers: MarkerStore) -> Self {
        Self { ledger, markers }
    }

    /// Launch the executor for one file. On success the active row is
    /// Running with the child pid and a marker exists. On failure the
    /// submission is finalized and the file moved aside.
    pub fn launch(&self, kind: Arc<TaskKind>, input: &Path) -> Result<TaskHandle> {
        match self.try_spawn(&kind, input) {
            Ok(handle) => {
                // ledger failure after a successful spawn leaves the child
                // running; the marker still covers dedup, so log and carry on
                if let Err(e) = self
                    .ledger
                    .update_active(&input.to_string_lossy(), &ActiveUpdate::running(handle.pid))
                {
                    warn!(error = %e, file = %input.display(), "failed to record Running state");
                }
                info!(task = %kind.name, file = %input.display(), pid = handle.pid, "task launched");
                Ok(handle)
            }
            Err(e) => {
                error!(task = %kind.name, file = %input.display(), error = %e, "launch failed");
                // secondary failures must not stop the finalization; a
                // launch failure never leaves a Pending row behind
                if let Err(marker_err) = self.markers.remove(&kind.name, input) {
                    warn!(error = %marker_err, file = %input.display(), "marker removal failed");
                }
                if let Err(ledger_err) = self.ledger.move_to_history(
                    &input.to_string_lossy(),
                    TaskStatus::Aborted,
                    &format!("launch failed: {e}"),
                ) {
                    warn!(error = %ledger_err, file = %input.display(), "could not finalize failed launch");
                }
                if let Err(move_err) = relocate(input, &kind.failed_dir) {
                    warn!(error = %move_err, file = %input.display(), "could not move failed file");
                }
                Err(e)
            }
        }
    }

    fn try_spawn(&self, kind: &Arc<TaskKind>, input: &Path) -> Result<TaskHandle> {
        let argv = kind.command_line(input)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Launch(format!("empty command for task '{}'", kind.name)))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // own process group, so Ctrl-C to the daemon does not kill children
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| Error::Launch(format!("cannot spawn '{program}': {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Launch("spawned child has no pid".to_string()))?;

        // marker goes down before the row flips to Running, so there is
        // never a Running row without a marker
        self.markers.create(&kind.name, input, pid)?;

        Ok(TaskHandle {
            kind: kind.clone(),
            identity: input.to_path_buf(),
            pid,
            child,
        })
    }
}

/// Move `file` into `dest_dir`, keeping its name. Falls back to
/// copy-and-delete when rename crosses a filesystem boundary.
pub fn relocate(file: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = file
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("no file name in '{}'", file.display())))?;
    let dest = dest_dir.join(name);

    match std::fs::rename(file, &dest) {
        Ok(()) => Ok(dest),
        Err(_) => {
            std::fs::copy(file, &dest)
                .map_err(|e| Error::Task(format!("cannot copy to '{}': {e}", dest.display())))?;
            std::fs::remove_file(file)
                .map_err(|e| Error::Task(format!("cannot remove '{}': {e}", file.display())))?;
            Ok(dest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_relocate_moves_file() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in").join("a.txt");
        let dest_dir = dir.path().join("done");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        std::fs::create_dir_all(&dest_dir).unwrap();
        std::fs::write(&src, b"payload").unwrap();

        let dest = relocate(&src, &dest_dir).unwrap();

        assert!(!src.exists());
        assert_eq!(dest, dest_dir.join("a.txt"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }
}
