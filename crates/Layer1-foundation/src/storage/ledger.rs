//! SQLite task ledger
//!
//! Two tables:
//! - `active_tasks`: one row per in-flight file; `file_path` is UNIQUE and
//!   acts as the admission gate against duplicate processing.
//! - `task_history`: append-only terminal records.
//!
//! Every operation acquires and releases the connection lock on its own.
//! Callers must not assume anything holds between two separate calls; the
//! same database may be written by the daemon, the CLI, and the launched
//! child processes at the same time (WAL mode, busy timeout).

use crate::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

// ============================================================================
// Status
// ============================================================================

/// Task lifecycle status. Moves only forward:
/// Pending -> Running -> {Completed, Aborted}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Queued, not yet launched
    Pending,

    /// Child process is running
    Running,

    /// Child exited with code 0
    Completed,

    /// Child failed, was aborted, or never launched
    Aborted,
}

impl TaskStatus {
    /// Terminal states permit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Completed => "Completed",
            TaskStatus::Aborted => "Aborted",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Pending" => Ok(TaskStatus::Pending),
            "Running" => Ok(TaskStatus::Running),
            "Completed" => Ok(TaskStatus::Completed),
            "Aborted" => Ok(TaskStatus::Aborted),
            other => Err(Error::InvalidInput(format!("unknown task status: {other}"))),
        }
    }
}

// ============================================================================
// Record types
// ============================================================================

/// One in-flight file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTaskRecord {
    pub task_name: String,
    pub file_path: String,
    pub status: TaskStatus,
    pub current_stage: Option<String>,
    pub message: Option<String>,
    pub start_time: String,
    pub last_update_time: String,
    pub executor_pid: Option<u32>,
}

/// One terminal record in the append-only history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub task_name: String,
    pub file_path: String,
    pub final_status: TaskStatus,
    pub start_time: String,
    pub end_time: String,
    pub final_message: Option<String>,
}

/// Partial update of an active row. `None` fields are left untouched;
/// `last_update_time` is always refreshed.
#[derive(Debug, Clone, Default)]
pub struct ActiveUpdate {
    pub status: Option<TaskStatus>,
    pub stage: Option<String>,
    pub message: Option<String>,
    pub executor_pid: Option<u32>,
}

impl ActiveUpdate {
    /// The launch-time update: Running plus the executor pid
    pub fn running(pid: u32) -> Self {
        Self {
            status: Some(TaskStatus::Running),
            executor_pid: Some(pid),
            ..Default::default()
        }
    }

    /// A progress report from the child (stage and/or message)
    pub fn progress(stage: Option<String>, message: Option<String>) -> Self {
        Self {
            stage,
            message,
            ..Default::default()
        }
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Persistent store of active and historical task records
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Ledger {
    /// Open (and initialize if needed) the ledger at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create ledger directory: {e}")))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Storage(format!("Failed to open ledger database: {e}")))?;

        // WAL for concurrent daemon/CLI/child access; bounded busy wait so
        // a contended write fails loudly instead of hanging forever.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| Error::Storage(format!("Failed to set pragmas: {e}")))?;

        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.initialize_schema()?;
        Ok(ledger)
    }

    /// In-memory ledger for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory ledger: {e}")))?;

        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.initialize_schema()?;
        Ok(ledger)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            -- In-flight files; file_path uniqueness is the dedup gate
            CREATE TABLE IF NOT EXISTS active_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT NOT NULL,
                file_path TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL CHECK(status IN ('Pending', 'Running')),
                current_stage TEXT,
                message TEXT,
                start_time TEXT NOT NULL,
                last_update_time TEXT NOT NULL,
                executor_pid INTEGER
            );

            -- Terminal records, append-only
            CREATE TABLE IF NOT EXISTS task_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                final_status TEXT NOT NULL CHECK(final_status IN ('Completed', 'Aborted')),
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                final_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_active_start
                ON active_tasks(start_time);
            CREATE INDEX IF NOT EXISTS idx_history_end
                ON task_history(end_time DESC);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize ledger schema: {e}")))?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Ledger lock poisoned".to_string()))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert a Pending row for a newly detected file. Returns `false`
    /// when the identity already has an active record; this is the sole
    /// admission gate against processing the same file twice.
    pub fn insert_pending(&self, task_name: &str, file_path: &str) -> Result<bool> {
        let conn = self.lock()?;
        let now = now_rfc3339();

        let result = conn.execute(
            r#"
            INSERT INTO active_tasks (task_name, file_path, status, start_time, last_update_time)
            VALUES (?1, ?2, ?3, ?4, ?4)
            "#,
            params![task_name, file_path, TaskStatus::Pending.as_str(), now],
        );

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                debug!(file_path, "active record already exists, insert rejected");
                Ok(false)
            }
            Err(e) => Err(Error::Storage(format!("Failed to insert pending task: {e}"))),
        }
    }

    /// Partial update of an active row; unset fields keep their value.
    /// Returns `false` when no active row matched.
    pub fn update_active(&self, file_path: &str, update: &ActiveUpdate) -> Result<bool> {
        let conn = self.lock()?;
        let now = now_rfc3339();

        let rows = conn
            .execute(
                r#"
                UPDATE active_tasks SET
                    status = COALESCE(?2, status),
                    current_stage = COALESCE(?3, current_stage),
                    message = COALESCE(?4, message),
                    executor_pid = COALESCE(?5, executor_pid),
                    last_update_time = ?6
                WHERE file_path = ?1
                "#,
                params![
                    file_path,
                    update.status.map(|s| s.as_str()),
                    update.stage,
                    update.message,
                    update.executor_pid,
                    now,
                ],
            )
            .map_err(|e| Error::Storage(format!("Failed to update active task: {e}")))?;

        if rows == 0 {
            warn!(file_path, "no active task to update");
        }
        Ok(rows > 0)
    }

    /// Atomically move an active row to the history table. Either both
    /// halves happen (insert into history, delete from active) or the
    /// ledger is left untouched. Returns `false` when no active row
    /// exists for the identity.
    pub fn move_to_history(
        &self,
        file_path: &str,
        final_status: TaskStatus,
        final_message: &str,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Storage(format!("Failed to begin transaction: {e}")))?;

        let active: Option<(String, String)> = tx
            .query_row(
                "SELECT task_name, start_time FROM active_tasks WHERE file_path = ?1",
                params![file_path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| Error::Storage(format!("Failed to read active task: {e}")))?;

        let Some((task_name, start_time)) = active else {
            warn!(file_path, "no active task to move to history");
            return Ok(false);
        };

        let end_time = now_rfc3339();
        tx.execute(
            r#"
            INSERT INTO task_history (task_name, file_path, final_status, start_time, end_time, final_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                task_name,
                file_path,
                final_status.as_str(),
                start_time,
                end_time,
                final_message,
            ],
        )
        .map_err(|e| Error::Storage(format!("Failed to insert history record: {e}")))?;

        tx.execute(
            "DELETE FROM active_tasks WHERE file_path = ?1",
            params![file_path],
        )
        .map_err(|e| Error::Storage(format!("Failed to delete active task: {e}")))?;

        tx.commit()
            .map_err(|e| Error::Storage(format!("Failed to commit history move: {e}")))?;

        debug!(file_path, status = %final_status, "task moved to history");
        Ok(true)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Active records, oldest first
    pub fn list_active(&self) -> Result<Vec<ActiveTaskRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                r#"
                SELECT task_name, file_path, status, current_stage, message,
                       start_time, last_update_time, executor_pid
                FROM active_tasks
                ORDER BY start_time ASC
                "#,
            )
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {e}")))?;

        let records = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<u32>>(7)?,
                ))
            })
            .map_err(|e| Error::Storage(format!("Failed to query active tasks: {e}")))?
            .filter_map(|r| r.ok())
            .filter_map(|row| {
                Some(ActiveTaskRecord {
                    task_name: row.0,
                    file_path: row.1,
                    status: row.2.parse().ok()?,
                    current_stage: row.3,
                    message: row.4,
                    start_time: row.5,
                    last_update_time: row.6,
                    executor_pid: row.7,
                })
            })
            .collect();

        Ok(records)
    }

    /// One active record by identity
    pub fn get_active(&self, file_path: &str) -> Result<Option<ActiveTaskRecord>> {
        let conn = self.lock()?;

        conn.query_row(
            r#"
            SELECT task_name, file_path, status, current_stage, message,
                   start_time, last_update_time, executor_pid
            FROM active_tasks
            WHERE file_path = ?1
            "#,
            params![file_path],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<u32>>(7)?,
                ))
            },
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to get active task: {e}")))?
        .map(|row| {
            Ok(ActiveTaskRecord {
                task_name: row.0,
                file_path: row.1,
                status: row.2.parse()?,
                current_stage: row.3,
                message: row.4,
                start_time: row.5,
                last_update_time: row.6,
                executor_pid: row.7,
            })
        })
        .transpose()
    }

    /// History records, most recently finished first
    pub fn list_history(&self, limit: u32) -> Result<Vec<HistoryRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                r#"
                SELECT task_name, file_path, final_status, start_time, end_time, final_message
                FROM task_history
                ORDER BY end_time DESC, id DESC
                LIMIT ?1
                "#,
            )
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {e}")))?;

        let records = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(|e| Error::Storage(format!("Failed to query history: {e}")))?
            .filter_map(|r| r.ok())
            .filter_map(|row| {
                Some(HistoryRecord {
                    task_name: row.0,
                    file_path: row.1,
                    final_status: row.2.parse().ok()?,
                    start_time: row.3,
                    end_time: row.4,
                    final_message: row.5,
                })
            })
            .collect();

        Ok(records)
    }

    /// Most recent history record for an identity, if any
    pub fn latest_history(&self, file_path: &str) -> Result<Option<HistoryRecord>> {
        let conn = self.lock()?;

        conn.query_row(
            r#"
            SELECT task_name, file_path, final_status, start_time, end_time, final_message
            FROM task_history
            WHERE file_path = ?1
            ORDER BY end_time DESC, id DESC
            LIMIT 1
            "#,
            params![file_path],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to get history record: {e}")))?
        .map(|row| {
            Ok(HistoryRecord {
                task_name: row.0,
                file_path: row.1,
                final_status: row.2.parse()?,
                start_time: row.3,
                end_time: row.4,
                final_message: row.5,
            })
        })
        .transpose()
    }
}
