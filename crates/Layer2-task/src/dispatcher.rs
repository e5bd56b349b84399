//! FIFO dispatcher
//!
//! Single scheduling loop over three collections:
//! - `queue`: admitted files waiting for a free slot, strictly FIFO
//! - `active`: running children we supervise directly
//! - `adopted`: children that survived a daemon restart; we only watch
//!   their pids, counted against capacity like any other slot
//!
//! Each tick reaps finished children, retries any finalization that failed
//! against the ledger, and admits queued files up to the concurrency limit.
//! A finished child is always dropped from the active set in the same tick,
//! whether or not its ledger finalization succeeded; unfinished ledger
//! moves are parked and retried with a growing backoff.

use crate::launcher::{relocate, Launcher, TaskHandle};
use crate::marker::{pid_alive, MarkerState, MarkerStore};
use hotfolder_foundation::{Ledger, Result, TaskKind, TaskStatus};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const PARK_BACKOFF_START: Duration = Duration::from_secs(1);
const PARK_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Dispatcher timings and limits
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent: usize,
    pub tick_interval: Duration,
    pub error_backoff: Duration,
}

/// One admitted file waiting for a slot
struct QueuedFile {
    kind: Arc<TaskKind>,
    path: PathBuf,
}

/// A terminal ledger move that failed and is waiting for a retry
struct ParkedFinalize {
    identity: String,
    status: TaskStatus,
    message: String,
    next_attempt: Instant,
    backoff: Duration,
}

/// The scheduling core. Shared as `Arc`; all collections are behind
/// async mutexes so the watcher and CLI-facing paths can feed it while
/// the loop runs.
pub struct Dispatcher {
    ledger: Arc<Ledger>,
    markers: MarkerStore,
    launcher: Launcher,
    kinds: Vec<Arc<TaskKind>>,
    config: DispatcherConfig,
    queue: Mutex<VecDeque<QueuedFile>>,
    active: Mutex<HashMap<PathBuf, TaskHandle>>,
    adopted: Mutex<HashMap<PathBuf, (Arc<TaskKind>, u32)>>,
    parked: Mutex<Vec<ParkedFinalize>>,
    settle_until: Mutex<HashMap<String, Instant>>,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<Ledger>,
        markers: MarkerStore,
        kinds: Vec<Arc<TaskKind>>,
        config: DispatcherConfig,
    ) -> Self {
        let launcher = Launcher::new(ledger.clone(), markers.clone());
        Self {
            ledger,
            markers,
            launcher,
            kinds,
            config,
            queue: Mutex::new(VecDeque::new()),
            active: Mutex::new(HashMap::new()),
            adopted: Mutex::new(HashMap::new()),
            parked: Mutex::new(Vec::new()),
            settle_until: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Offer a file for processing. Returns `true` when the file was
    /// admitted to the queue, `false` when it was filtered out (hidden,
    /// not a regular file, already owned, already active).
    pub async fn enqueue(&self, kind: Arc<TaskKind>, path: PathBuf) -> Result<bool> {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Ok(false);
        };
        if name.starts_with('.') {
            debug!(file = %path.display(), "hidden file ignored");
            return Ok(false);
        }
        if !path.is_file() {
            return Ok(false);
        }

        match self.markers.inspect(&kind.name, &path) {
            MarkerState::Live(pid) => {
                debug!(file = %path.display(), pid, "file owned by a live process, skipped");
                return Ok(false);
            }
            MarkerState::Stale(pid) => {
                // leftovers of a crashed run; clear them and admit fresh
                info!(file = %path.display(), pid, "stale marker cleared before re-admission");
                if let Err(e) = self.markers.remove(&kind.name, &path) {
                    warn!(file = %path.display(), error = %e, "stale marker removal failed");
                }
                self.ledger.move_to_history(
                    &path.to_string_lossy(),
                    TaskStatus::Aborted,
                    "orphaned by an earlier crash",
                )?;
            }
            MarkerState::Absent => {}
        }

        if !self
            .ledger
            .insert_pending(&kind.name, &path.to_string_lossy())?
        {
            debug!(file = %path.display(), "already active, skipped");
            return Ok(false);
        }

        info!(task = %kind.name, file = %path.display(), "file queued");
        self.queue.lock().await.push_back(QueuedFile { kind, path });
        Ok(true)
    }

    // ========================================================================
    // The tick
    // ========================================================================

    /// One scheduling pass. Returns `true` when anything happened, so the
    /// caller can skip the idle pause.
    pub async fn tick(&self) -> Result<bool> {
        let mut did_work = false;
        did_work |= self.reap().await?;
        did_work |= self.check_adopted().await;
        did_work |= self.retry_parked().await;
        did_work |= self.admit().await?;
        Ok(did_work)
    }

    /// Drive ticks forever. Idle ticks pause for the tick interval; a
    /// failed tick pauses for the error backoff instead of crashing the
    /// daemon.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.config.tick_interval).await,
                Err(e) => {
                    error!(error = %e, "scheduling tick failed");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }
    }

    /// Poll every supervised child and finalize the finished ones. A
    /// child that finished leaves the active set in this tick no matter
    /// what; only the ledger move may be deferred.
    async fn reap(&self) -> Result<bool> {
        let mut finished = Vec::new();
        {
            let mut active = self.active.lock().await;
            let mut done_keys = Vec::new();
            for (identity, handle) in active.iter_mut() {
                match handle.poll_exit() {
                    Ok(Some(code)) => done_keys.push((identity.clone(), Some(code))),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(file = %identity.display(), error = %e, "child poll failed");
                        done_keys.push((identity.clone(), None));
                    }
                }
            }
            for (identity, code) in done_keys {
                if let Some(handle) = active.remove(&identity) {
                    finished.push((handle, code));
                }
            }
        }

        let any = !finished.is_empty();
        for (handle, code) in finished {
            self.finish(&handle.kind, &handle.identity, code).await;
        }
        Ok(any)
    }

    /// Watch adopted pids. We cannot read their exit codes, so death is
    /// always recorded as Aborted.
    async fn check_adopted(&self) -> bool {
        let dead: Vec<(PathBuf, Arc<TaskKind>, u32)> = {
            let mut adopted = self.adopted.lock().await;
            let gone: Vec<PathBuf> = adopted
                .iter()
                .filter(|(_, (_, pid))| !pid_alive(*pid))
                .map(|(identity, _)| identity.clone())
                .collect();
            gone.into_iter()
                .filter_map(|identity| {
                    adopted
                        .remove(&identity)
                        .map(|(kind, pid)| (identity, kind, pid))
                })
                .collect()
        };

        let any = !dead.is_empty();
        for (identity, kind, pid) in dead {
            info!(file = %identity.display(), pid, "adopted process exited");
            if let Err(e) = self.markers.remove(&kind.name, &identity) {
                warn!(error = %e, "marker removal failed");
            }
            if identity.is_file() {
                if let Err(e) = relocate(&identity, &kind.failed_dir) {
                    warn!(error = %e, file = %identity.display(), "could not move file");
                }
            }
            self.finalize(
                &identity.to_string_lossy(),
                TaskStatus::Aborted,
                "process exited while unsupervised".to_string(),
            )
            .await;
        }
        any
    }

    /// Record the outcome of a supervised child: relocate the file, drop
    /// the marker, move the ledger row to history.
    async fn finish(&self, kind: &TaskKind, identity: &Path, code: Option<i32>) {
        let (status, message) = match code {
            Some(0) => (TaskStatus::Completed, "exit code 0".to_string()),
            Some(-1) => (TaskStatus::Aborted, "terminated by signal".to_string()),
            Some(code) => (TaskStatus::Aborted, format!("exit code {code}")),
            None => (TaskStatus::Aborted, "lost track of process".to_string()),
        };

        info!(task = %kind.name, file = %identity.display(), status = %status, %message, "task finished");

        let dest = if status == TaskStatus::Completed {
            &kind.done_dir
        } else {
            &kind.failed_dir
        };
        if identity.is_file() {
            if let Err(e) = relocate(identity, dest) {
                warn!(error = %e, file = %identity.display(), "could not move finished file");
            }
        }
        if let Err(e) = self.markers.remove(&kind.name, identity) {
            warn!(error = %e, "marker removal failed");
        }

        if status == TaskStatus::Completed && kind.settle_secs > 0 {
            self.settle_until
                .lock()
                .await
                .insert(kind.name.clone(), Instant::now() + kind.settle());
        }

        self.finalize(&identity.to_string_lossy(), status, message)
            .await;
    }

    /// Move the row to history, parking the move for later when the
    /// ledger is unavailable.
    async fn finalize(&self, identity: &str, status: TaskStatus, message: String) {
        match self.ledger.move_to_history(identity, status, &message) {
            Ok(_) => {}
            Err(e) => {
                warn!(identity, error = %e, "finalization parked for retry");
                self.parked.lock().await.push(ParkedFinalize {
                    identity: identity.to_string(),
                    status,
                    message,
                    next_attempt: Instant::now() + PARK_BACKOFF_START,
                    backoff: PARK_BACKOFF_START,
                });
            }
        }
    }

    /// Retry parked finalizations that are due, doubling the backoff of
    /// the ones that fail again.
    async fn retry_parked(&self) -> bool {
        let mut parked = self.parked.lock().await;
        if parked.is_empty() {
            return false;
        }

        let now = Instant::now();
        let mut any = false;
        let mut keep = Vec::new();
        for mut entry in parked.drain(..) {
            if entry.next_attempt > now {
                keep.push(entry);
                continue;
            }
            match self
                .ledger
                .move_to_history(&entry.identity, entry.status, &entry.message)
            {
                Ok(_) => {
                    info!(identity = %entry.identity, "parked finalization succeeded");
                    any = true;
                }
                Err(e) => {
                    entry.backoff = (entry.backoff * 2).min(PARK_BACKOFF_CAP);
                    entry.next_attempt = now + entry.backoff;
                    warn!(identity = %entry.identity, error = %e, backoff = ?entry.backoff, "parked finalization failed again");
                    keep.push(entry);
                }
            }
        }
        *parked = keep;
        any
    }

    /// Launch queued files while slots are free. The queue is strictly
    /// FIFO; a head held back by a settling kind blocks the queue rather
    /// than being skipped and goes back to the front.
    ///
    /// The capacity check and the head pop happen atomically under the
    /// active-set lock; the spawn and its ledger writes run outside it.
    /// Only this loop ever fills a slot, so the slot claimed by the pop
    /// cannot be taken by anyone else before the handle is inserted.
    async fn admit(&self) -> Result<bool> {
        let mut any = false;
        loop {
            let next = {
                let active = self.active.lock().await;
                let occupied = active.len() + self.adopted.lock().await.len();
                if occupied >= self.config.max_concurrent {
                    return Ok(any);
                }
                let Some(next) = self.queue.lock().await.pop_front() else {
                    return Ok(any);
                };
                next
            };

            if let Some(until) = self.settle_until.lock().await.get(&next.kind.name) {
                if *until > Instant::now() {
                    self.queue.lock().await.push_front(next);
                    return Ok(any);
                }
            }

            if !next.path.is_file() {
                // vanished between queueing and launch
                warn!(file = %next.path.display(), "queued file disappeared");
                if let Err(e) = self.markers.remove(&next.kind.name, &next.path) {
                    warn!(error = %e, "marker removal failed");
                }
                self.finalize(
                    &next.path.to_string_lossy(),
                    TaskStatus::Aborted,
                    "input file disappeared before launch".to_string(),
                )
                .await;
                any = true;
                continue;
            }

            match self.launcher.launch(next.kind.clone(), &next.path) {
                Ok(handle) => {
                    self.active.lock().await.insert(next.path.clone(), handle);
                    any = true;
                }
                Err(e) => {
                    warn!(file = %next.path.display(), error = %e, "launch rejected");
                    // the launcher finalizes its own failures; if a ledger
                    // outage kept the row active, park the move for retry
                    let identity = next.path.to_string_lossy().into_owned();
                    if !matches!(self.ledger.get_active(&identity), Ok(None)) {
                        self.finalize(
                            &identity,
                            TaskStatus::Aborted,
                            format!("launch failed: {e}"),
                        )
                        .await;
                    }
                    any = true;
                }
            }
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Startup sweep over leftover ledger rows from a previous run. Rows
    /// whose marker pid is still alive are adopted; everything else is
    /// closed out as Aborted so the files can be re-admitted by the scan.
    pub async fn recover(&self) -> Result<()> {
        let leftover = self.ledger.list_active()?;
        if leftover.is_empty() {
            return Ok(());
        }
        info!(count = leftover.len(), "recovering leftover task records");

        for record in leftover {
            let path = PathBuf::from(&record.file_path);
            let Some(kind) = self.kinds.iter().find(|k| k.name == record.task_name) else {
                warn!(task = %record.task_name, file = %record.file_path, "unknown task kind, record closed");
                self.ledger.move_to_history(
                    &record.file_path,
                    TaskStatus::Aborted,
                    "task kind no longer configured",
                )?;
                continue;
            };

            match self.markers.inspect(&kind.name, &path) {
                MarkerState::Live(pid) => {
                    info!(file = %record.file_path, pid, "live process adopted after restart");
                    self.adopted
                        .lock()
                        .await
                        .insert(path, (kind.clone(), pid));
                }
                state => {
                    if state != MarkerState::Absent {
                        self.markers.remove(&kind.name, &path)?;
                    }
                    info!(file = %record.file_path, "interrupted record closed, file eligible for re-admission");
                    self.ledger.move_to_history(
                        &record.file_path,
                        TaskStatus::Aborted,
                        "interrupted by daemon restart",
                    )?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Occupied slots, supervised and adopted
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len() + self.adopted.lock().await.len()
    }

    /// Files waiting in the queue
    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.len()
    }
}
