//! Input folder watching
//!
//! One non-recursive notify watcher per enabled task kind, feeding a
//! single channel of (kind, path) arrivals. Duplicate events for the same
//! file are harmless; admission is deduplicated downstream.
//!
//! A startup scan covers files that arrived while no daemon was running.

use crate::dispatcher::Dispatcher;
use hotfolder_foundation::{Error, Result, TaskKind};
use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// File arrivals across all watched input folders
pub struct WatchService {
    // kept alive for the lifetime of the service; dropping a watcher
    // stops its notifications
    _watchers: Vec<RecommendedWatcher>,
    rx: mpsc::UnboundedReceiver<(Arc<TaskKind>, PathBuf)>,
}

fn interesting(event_kind: &EventKind) -> bool {
    matches!(
        event_kind,
        EventKind::Create(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    )
}

impl WatchService {
    /// Start watching the input folder of every enabled kind
    pub fn start(kinds: &[Arc<TaskKind>]) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watchers = Vec::new();

        for kind in kinds.iter().filter(|k| k.enabled) {
            let tx = tx.clone();
            let kind_for_events = kind.clone();

            let mut watcher =
                notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                    match res {
                        Ok(event) if interesting(&event.kind) => {
                            for path in event.paths {
                                // receiver gone means the daemon is shutting down
                                let _ = tx.send((kind_for_events.clone(), path));
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "watch event error"),
                    }
                })
                .map_err(|e| Error::Task(format!("cannot create watcher: {e}")))?;

            watcher
                .watch(&kind.input_dir, RecursiveMode::NonRecursive)
                .map_err(|e| {
                    Error::Task(format!(
                        "cannot watch '{}' for task '{}': {e}",
                        kind.input_dir.display(),
                        kind.name
                    ))
                })?;

            info!(task = %kind.name, dir = %kind.input_dir.display(), "watching input folder");
            watchers.push(watcher);
        }

        Ok(Self {
            _watchers: watchers,
            rx,
        })
    }

    /// Offer every file already sitting in the input folders, in name
    /// order per folder
    pub async fn scan_existing(
        kinds: &[Arc<TaskKind>],
        dispatcher: &Dispatcher,
    ) -> Result<()> {
        for kind in kinds.iter().filter(|k| k.enabled) {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&kind.input_dir)
                .map_err(|e| {
                    Error::Task(format!(
                        "cannot scan '{}': {e}",
                        kind.input_dir.display()
                    ))
                })?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .collect();
            entries.sort();

            for path in entries {
                if let Err(e) = dispatcher.enqueue(kind.clone(), path.clone()).await {
                    warn!(file = %path.display(), error = %e, "scan admission failed");
                }
            }
        }
        Ok(())
    }

    /// Consume arrivals forever, handing each to the dispatcher
    pub async fn forward(mut self, dispatcher: Arc<Dispatcher>) {
        while let Some((kind, path)) = self.rx.recv().await {
            debug!(task = %kind.name, file = %path.display(), "file arrival");
            if let Err(e) = dispatcher.enqueue(kind, path.clone()).await {
                warn!(file = %path.display(), error = %e, "admission failed");
            }
        }
    }
}
