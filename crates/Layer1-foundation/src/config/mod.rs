//! Watcher configuration
//!
//! Static parameters supplied to the core at startup: the folder triad and
//! executable per task kind, the concurrency limit, and the loop timings.
//! Loaded once from a TOML file and never mutated during a run.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default config file name, looked up in the user's home directory
pub const CONFIG_FILE_NAME: &str = ".hotfolder.toml";

/// Example configuration written by `hotfolder init`
pub const EXAMPLE_CONFIG: &str = r#"# hotfolder configuration

# Where the task ledger database lives
database_path = "/var/lib/hotfolder/ledger.db"
# Where per-file pid markers live
pids_dir = "/var/run/hotfolder/pids"

# How many child processes may run at once
max_concurrent_tasks = 2
# Scheduling loop pause when idle, in seconds
tick_interval_secs = 1
# Pause after an internal scheduling error, in seconds
error_backoff_secs = 5
# Grace period before an aborted process is force-killed (0 disables)
abort_grace_secs = 10
# Default number of history rows shown by `hotfolder history`
history_limit = 100

[[task]]
name = "example"
executable = "/usr/bin/python3"
args = "/opt/hotfolder/tasks/example_task.py --verbose"
input_dir = "/srv/hotfolder/example/input"
done_dir = "/srv/hotfolder/example/done"
failed_dir = "/srv/hotfolder/example/failed"
enabled = true
# Optional pause after each completed file of this kind, in seconds
settle_secs = 0
"#;

// ============================================================================
// Task kind
// ============================================================================

/// One watched-folder configuration: the executable to run and the folder
/// triad files move through. Immutable after startup; passed around by
/// `Arc` reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskKind {
    /// Unique name of this task kind
    pub name: String,

    /// Executable to launch for each file
    pub executable: PathBuf,

    /// Fixed arguments, one shell-style string (shlex-split at launch)
    #[serde(default)]
    pub args: String,

    /// Watched input folder
    pub input_dir: PathBuf,

    /// Destination for successfully processed files
    pub done_dir: PathBuf,

    /// Destination for failed files
    pub failed_dir: PathBuf,

    /// Disabled kinds are neither watched nor scanned
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Pause after each completed file before admitting the next of this
    /// kind, in seconds
    #[serde(default)]
    pub settle_secs: u64,
}

fn default_enabled() -> bool {
    true
}

impl TaskKind {
    /// Build the full child argv: `<executable> <fixed args...> <input>`
    pub fn command_line(&self, input: &Path) -> Result<Vec<String>> {
        let mut argv = vec![self.executable.to_string_lossy().into_owned()];
        let fixed = shlex::split(&self.args).ok_or_else(|| {
            Error::Config(format!(
                "unparseable args for task '{}': {}",
                self.name, self.args
            ))
        })?;
        argv.extend(fixed);
        argv.push(input.to_string_lossy().into_owned());
        Ok(argv)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

// ============================================================================
// Watcher config
// ============================================================================

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Path of the SQLite ledger database
    pub database_path: PathBuf,

    /// Folder holding the per-file pid markers
    pub pids_dir: PathBuf,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,

    #[serde(default = "default_abort_grace")]
    pub abort_grace_secs: u64,

    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    /// Task kinds, one per watched folder
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskKind>,
}

fn default_max_concurrent() -> usize {
    1
}

fn default_tick_interval() -> u64 {
    1
}

fn default_error_backoff() -> u64 {
    5
}

fn default_abort_grace() -> u64 {
    10
}

fn default_history_limit() -> u32 {
    100
}

impl WatcherConfig {
    /// Default config location: `~/.hotfolder.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME))
    }

    /// Load and parse the configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        let config: WatcherConfig = toml::from_str(&contents).map_err(|e| {
            Error::Config(format!("cannot parse config '{}': {e}", path.display()))
        })?;
        info!(path = %path.display(), tasks = config.tasks.len(), "configuration loaded");
        Ok(config)
    }

    /// Write the example template to `path`. Fails if the file exists.
    pub fn write_example(path: &Path) -> Result<()> {
        if path.exists() {
            return Err(Error::InvalidInput(format!(
                "config file already exists: {}",
                path.display()
            )));
        }
        std::fs::write(path, EXAMPLE_CONFIG)
            .map_err(|e| Error::Config(format!("cannot write '{}': {e}", path.display())))?;
        Ok(())
    }

    /// Sanity checks before the daemon starts. Collects every problem
    /// rather than stopping at the first.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.max_concurrent_tasks == 0 {
            problems.push("max_concurrent_tasks must be at least 1".to_string());
        }
        if self.tick_interval_secs == 0 {
            problems.push("tick_interval_secs must be at least 1".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for kind in &self.tasks {
            if kind.name.is_empty() {
                problems.push("task with empty name".to_string());
                continue;
            }
            if !seen.insert(kind.name.clone()) {
                problems.push(format!("duplicate task name '{}'", kind.name));
            }
            if !kind.enabled {
                continue;
            }
            if !kind.input_dir.is_dir() {
                problems.push(format!(
                    "input_dir '{}' for task '{}' is not a directory",
                    kind.input_dir.display(),
                    kind.name
                ));
            }
            if kind.input_dir == kind.done_dir || kind.input_dir == kind.failed_dir {
                problems.push(format!(
                    "task '{}' reuses its input folder as a destination",
                    kind.name
                ));
            }
            if shlex::split(&kind.args).is_none() {
                problems.push(format!(
                    "task '{}' has unparseable args: {}",
                    kind.name, kind.args
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    /// Create the runtime folders the daemon writes to (pids, done and
    /// failed destinations). Input folders are never created here; a
    /// missing input folder is a configuration error.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.pids_dir)?;
        if let Some(parent) = self.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        for kind in self.tasks.iter().filter(|k| k.enabled) {
            std::fs::create_dir_all(&kind.done_dir)?;
            std::fs::create_dir_all(&kind.failed_dir)?;
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace_secs)
    }

    /// Look up a task kind by name
    pub fn task_by_name(&self, name: &str) -> Option<&TaskKind> {
        self.tasks.iter().find(|k| k.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: WatcherConfig = toml::from_str(EXAMPLE_CONFIG).expect("example must parse");
        assert_eq!(config.max_concurrent_tasks, 2);
        assert_eq!(config.tasks.len(), 1);
        assert_eq!(config.tasks[0].name, "example");
        assert!(config.tasks[0].enabled);
    }

    #[test]
    fn test_command_line_splits_args() {
        let kind = TaskKind {
            name: "t".to_string(),
            executable: PathBuf::from("/bin/convert"),
            args: "--mode fast -o \"out dir\"".to_string(),
            input_dir: PathBuf::from("/in"),
            done_dir: PathBuf::from("/done"),
            failed_dir: PathBuf::from("/failed"),
            enabled: true,
            settle_secs: 0,
        };

        let argv = kind.command_line(Path::new("/in/a.txt")).unwrap();
        assert_eq!(
            argv,
            vec!["/bin/convert", "--mode", "fast", "-o", "out dir", "/in/a.txt"]
        );
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config: WatcherConfig = toml::from_str(EXAMPLE_CONFIG).unwrap();
        config.tasks.clear();
        config.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_input_dir() {
        let mut config: WatcherConfig = toml::from_str(EXAMPLE_CONFIG).unwrap();
        config.max_concurrent_tasks = 1;
        config.tasks[0].input_dir = PathBuf::from("/definitely/not/a/real/dir");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("input_dir"));
    }

    #[test]
    fn test_validate_skips_disabled_tasks() {
        let mut config: WatcherConfig = toml::from_str(EXAMPLE_CONFIG).unwrap();
        config.tasks[0].input_dir = PathBuf::from("/definitely/not/a/real/dir");
        config.tasks[0].enabled = false;
        assert!(config.validate().is_ok());
    }
}
