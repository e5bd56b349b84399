//! Operator commands
//!
//! Abort a running task or send a failed file back for another attempt.
//! Both work purely through the ledger, the marker store and signals, so
//! they can run from a CLI process separate from the daemon.

use crate::marker::{pid_alive, MarkerStore};
use hotfolder_foundation::{Error, Ledger, Result, TaskKind, TaskStatus};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// What an abort request amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortOutcome {
    /// SIGTERM delivered to this pid
    SignalSent(u32),

    /// The task was already finished; nothing to signal
    AlreadyFinished(String),
}

/// Abort and retry, addressed by file identity
pub struct Controller {
    ledger: std::sync::Arc<Ledger>,
    markers: MarkerStore,
    abort_grace: Duration,
}

impl Controller {
    pub fn new(
        ledger: std::sync::Arc<Ledger>,
        markers: MarkerStore,
        abort_grace: Duration,
    ) -> Self {
        Self {
            ledger,
            markers,
            abort_grace,
        }
    }

    /// Abort the task working on `file_path`.
    ///
    /// - no record anywhere, or no pid recorded yet: `Err(NotFound)`
    /// - already in history: `AlreadyFinished`, idempotent success
    /// - recorded pid dead: record closed as Aborted, `AlreadyFinished`
    /// - pid alive: SIGTERM, then SIGKILL after the grace period unless
    ///   the process exited on its own (grace 0 disables the escalation)
    pub async fn abort(&self, file_path: &str) -> Result<AbortOutcome> {
        let Some(record) = self.ledger.get_active(file_path)? else {
            return match self.ledger.latest_history(file_path)? {
                Some(past) => Ok(AbortOutcome::AlreadyFinished(format!(
                    "finished at {} with status {}",
                    past.end_time, past.final_status
                ))),
                None => Err(Error::NotFound(format!("no task for file '{file_path}'"))),
            };
        };

        let Some(pid) = record.executor_pid else {
            return Err(Error::NotFound(format!(
                "task for '{file_path}' has not started yet, status {}",
                record.status
            )));
        };

        if !pid_alive(pid) {
            info!(file_path, pid, "process already gone, record closed");
            self.markers.remove(&record.task_name, Path::new(file_path))?;
            self.ledger
                .move_to_history(file_path, TaskStatus::Aborted, "process not found")?;
            return Ok(AbortOutcome::AlreadyFinished(
                "process was no longer running".to_string(),
            ));
        }

        send_signal(pid, Signal::Term)?;
        info!(file_path, pid, "abort signal sent");

        if !self.abort_grace.is_zero() {
            let grace = self.abort_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if pid_alive(pid) {
                    warn!(pid, "process survived the grace period, killing");
                    if let Err(e) = send_signal(pid, Signal::Kill) {
                        warn!(pid, error = %e, "force kill failed");
                    }
                }
            });
        }

        Ok(AbortOutcome::SignalSent(pid))
    }

    /// Move a file from a task's failed folder back into its input
    /// folder. `file_name` must be a bare name, not a path.
    pub fn retry(&self, kind: &TaskKind, file_name: &str) -> Result<()> {
        if file_name.contains('/') || file_name.contains('\\') {
            return Err(Error::InvalidInput(format!(
                "expected a bare file name, got '{file_name}'"
            )));
        }

        let source = kind.failed_dir.join(file_name);
        if !source.is_file() {
            return Err(Error::NotFound(format!(
                "no failed file '{}' for task '{}'",
                file_name, kind.name
            )));
        }

        let dest = kind.input_dir.join(file_name);
        std::fs::rename(&source, &dest).map_err(|e| {
            Error::Task(format!(
                "cannot move '{}' back to input: {e}",
                source.display()
            ))
        })?;

        info!(task = %kind.name, file_name, "failed file resubmitted");
        Ok(())
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, signo) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Task(format!(
            "cannot signal pid {pid}: {}",
            std::io::Error::last_os_error()
        )))
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) -> Result<()> {
    Err(Error::Task("signals are not supported here".to_string()))
}
