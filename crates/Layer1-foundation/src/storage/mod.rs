//! Storage - the persistent task ledger

pub mod ledger;

pub use ledger::{ActiveTaskRecord, ActiveUpdate, HistoryRecord, Ledger, TaskStatus};
