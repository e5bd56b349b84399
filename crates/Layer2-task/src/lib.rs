//! hotfolder-task - the task engine
//!
//! Everything that happens to a file between arriving in a watched folder
//! and landing in its done or failed folder:
//! - `watcher`: notify-based folder watching plus the startup scan
//! - `dispatcher`: FIFO queue, concurrency limit, the scheduling tick
//! - `launcher`: child process spawning and launch-failure handling
//! - `marker`: per-file pid markers for dedup and crash recovery
//! - `control`: operator abort and retry

pub mod control;
pub mod dispatcher;
pub mod launcher;
pub mod marker;
pub mod watcher;

pub use control::{AbortOutcome, Controller};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use launcher::{Launcher, TaskHandle};
pub use marker::{pid_alive, MarkerState, MarkerStore};
pub use watcher::WatchService;
