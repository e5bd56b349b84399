//! hotfolder-foundation - shared foundation layer
//!
//! The bottom layer of the workspace. Holds everything the task engine and
//! the CLI both need:
//! - Configuration loading and validation (`config`)
//! - The central error type (`error`)
//! - The persistent task ledger (`storage`)
//!
//! Nothing in this crate spawns processes or watches folders; those live in
//! `hotfolder-task`.

pub mod config;
pub mod error;
pub mod storage;

pub use config::{TaskKind, WatcherConfig, CONFIG_FILE_NAME};
pub use error::{Error, Result};
pub use storage::{ActiveTaskRecord, ActiveUpdate, HistoryRecord, Ledger, TaskStatus};
