//! End-to-end dispatcher tests driving real child processes through a
//! temporary folder triad.

#![cfg(unix)]

use hotfolder_foundation::{ActiveUpdate, Ledger, TaskKind, TaskStatus};
use hotfolder_task::{Dispatcher, DispatcherConfig, MarkerStore, WatchService};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

struct Rig {
    _dir: TempDir,
    root: PathBuf,
    ledger: Arc<Ledger>,
    markers: MarkerStore,
}

impl Rig {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        for sub in ["input", "done", "failed", "pids"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        Self {
            _dir: dir,
            markers: MarkerStore::new(root.join("pids")),
            ledger: Arc::new(Ledger::in_memory().unwrap()),
            root,
        }
    }

    /// Task kind running `sh -c <script>`; the input path lands in `$0`
    fn kind(&self, name: &str, script: &str) -> Arc<TaskKind> {
        Arc::new(TaskKind {
            name: name.to_string(),
            executable: PathBuf::from("/bin/sh"),
            args: format!("-c '{script}'"),
            input_dir: self.root.join("input"),
            done_dir: self.root.join("done"),
            failed_dir: self.root.join("failed"),
            enabled: true,
            settle_secs: 0,
        })
    }

    fn dispatcher(&self, kinds: Vec<Arc<TaskKind>>, max_concurrent: usize) -> Dispatcher {
        Dispatcher::new(
            self.ledger.clone(),
            self.markers.clone(),
            kinds,
            DispatcherConfig {
                max_concurrent,
                tick_interval: Duration::from_millis(10),
                error_backoff: Duration::from_millis(10),
            },
        )
    }

    fn drop_file(&self, name: &str) -> PathBuf {
        let path = self.root.join("input").join(name);
        std::fs::write(&path, name).unwrap();
        path
    }
}

/// Tick until the queue and active set drain, or fail the test
async fn drain(dispatcher: &Dispatcher) {
    for _ in 0..400 {
        dispatcher.tick().await.unwrap();
        if dispatcher.active_count().await == 0 && dispatcher.pending_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("dispatcher did not drain");
}

#[tokio::test]
async fn completed_task_moves_file_to_done() {
    let rig = Rig::new();
    let kind = rig.kind("ok", "exit 0");
    let dispatcher = rig.dispatcher(vec![kind.clone()], 2);

    let file = rig.drop_file("a.txt");
    assert!(dispatcher.enqueue(kind.clone(), file.clone()).await.unwrap());
    drain(&dispatcher).await;

    assert!(!file.exists());
    assert!(rig.root.join("done").join("a.txt").exists());
    assert!(rig.ledger.list_active().unwrap().is_empty());

    let history = rig.ledger.list_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].final_status, TaskStatus::Completed);
    assert_eq!(history[0].final_message.as_deref(), Some("exit code 0"));

    // marker must be gone so the name can come around again
    assert_eq!(
        rig.markers.inspect("ok", &file),
        hotfolder_task::MarkerState::Absent
    );
}

#[tokio::test]
async fn failed_task_moves_file_to_failed() {
    let rig = Rig::new();
    let kind = rig.kind("boom", "exit 17");
    let dispatcher = rig.dispatcher(vec![kind.clone()], 2);

    let file = rig.drop_file("b.txt");
    dispatcher.enqueue(kind.clone(), file.clone()).await.unwrap();
    drain(&dispatcher).await;

    assert!(rig.root.join("failed").join("b.txt").exists());
    let history = rig.ledger.list_history(10).unwrap();
    assert_eq!(history[0].final_status, TaskStatus::Aborted);
    assert_eq!(history[0].final_message.as_deref(), Some("exit code 17"));
}

#[tokio::test]
async fn duplicate_submission_is_rejected() {
    let rig = Rig::new();
    let kind = rig.kind("ok", "sleep 2");
    let dispatcher = rig.dispatcher(vec![kind.clone()], 1);

    let file = rig.drop_file("c.txt");
    assert!(dispatcher.enqueue(kind.clone(), file.clone()).await.unwrap());
    assert!(!dispatcher.enqueue(kind.clone(), file.clone()).await.unwrap());
    assert_eq!(dispatcher.pending_count().await, 1);
}

#[tokio::test]
async fn hidden_files_are_ignored() {
    let rig = Rig::new();
    let kind = rig.kind("ok", "exit 0");
    let dispatcher = rig.dispatcher(vec![kind.clone()], 1);

    let file = rig.drop_file(".partial-upload");
    assert!(!dispatcher.enqueue(kind, file).await.unwrap());
    assert_eq!(dispatcher.pending_count().await, 0);
}

#[tokio::test]
async fn queue_is_fifo_under_capacity_one() {
    let rig = Rig::new();
    let kind = rig.kind("ok", "sleep 0.1");
    let dispatcher = rig.dispatcher(vec![kind.clone()], 1);

    let first = rig.drop_file("first.txt");
    let second = rig.drop_file("second.txt");
    dispatcher.enqueue(kind.clone(), first.clone()).await.unwrap();
    dispatcher.enqueue(kind.clone(), second.clone()).await.unwrap();

    // one slot: the second file must wait
    dispatcher.tick().await.unwrap();
    assert_eq!(dispatcher.active_count().await, 1);
    assert_eq!(dispatcher.pending_count().await, 1);

    drain(&dispatcher).await;

    // history is newest first, so the first submission appears last
    let history = rig.ledger.list_history(10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].file_path, first.to_string_lossy());
    assert_eq!(history[0].file_path, second.to_string_lossy());
}

#[tokio::test]
async fn launch_failure_finalizes_the_submission() {
    let rig = Rig::new();
    let kind = Arc::new(TaskKind {
        name: "broken".to_string(),
        executable: PathBuf::from("/definitely/not/an/executable"),
        args: String::new(),
        input_dir: rig.root.join("input"),
        done_dir: rig.root.join("done"),
        failed_dir: rig.root.join("failed"),
        enabled: true,
        settle_secs: 0,
    });
    let dispatcher = rig.dispatcher(vec![kind.clone()], 1);

    let file = rig.drop_file("d.txt");
    dispatcher.enqueue(kind, file.clone()).await.unwrap();
    drain(&dispatcher).await;

    assert!(rig.root.join("failed").join("d.txt").exists());
    let history = rig.ledger.list_history(10).unwrap();
    assert_eq!(history[0].final_status, TaskStatus::Aborted);
    assert!(history[0]
        .final_message
        .as_deref()
        .unwrap()
        .starts_with("launch failed"));
}

#[tokio::test]
async fn recovery_closes_interrupted_records() {
    let rig = Rig::new();
    let kind = rig.kind("ok", "exit 0");
    let file = rig.drop_file("e.txt");
    let identity = file.to_string_lossy().into_owned();

    // simulate a crashed run: Running row plus a marker for a dead pid
    rig.ledger.insert_pending("ok", &identity).unwrap();
    rig.ledger
        .update_active(&identity, &ActiveUpdate::running(4_000_000))
        .unwrap();
    rig.markers.create("ok", &file, 4_000_000).unwrap();

    let dispatcher = rig.dispatcher(vec![kind.clone()], 1);
    dispatcher.recover().await.unwrap();

    assert!(rig.ledger.list_active().unwrap().is_empty());
    let latest = rig.ledger.latest_history(&identity).unwrap().unwrap();
    assert_eq!(latest.final_status, TaskStatus::Aborted);
    assert_eq!(
        latest.final_message.as_deref(),
        Some("interrupted by daemon restart")
    );

    // the file stayed in input and is admissible again
    assert!(file.exists());
    assert!(dispatcher.enqueue(kind, file).await.unwrap());
}

#[tokio::test]
async fn recovery_adopts_live_processes() {
    let rig = Rig::new();
    let kind = rig.kind("ok", "exit 0");
    let file = rig.drop_file("f.txt");
    let identity = file.to_string_lossy().into_owned();

    // a live pid we did not spawn: our own
    let pid = std::process::id();
    rig.ledger.insert_pending("ok", &identity).unwrap();
    rig.ledger
        .update_active(&identity, &ActiveUpdate::running(pid))
        .unwrap();
    rig.markers.create("ok", &file, pid).unwrap();

    let dispatcher = rig.dispatcher(vec![kind.clone()], 1);
    dispatcher.recover().await.unwrap();

    // the adopted slot counts against capacity and blocks new launches
    assert_eq!(dispatcher.active_count().await, 1);
    let other = rig.drop_file("g.txt");
    dispatcher.enqueue(kind, other).await.unwrap();
    dispatcher.tick().await.unwrap();
    assert_eq!(dispatcher.pending_count().await, 1);
}

#[tokio::test]
async fn stale_marker_is_cleared_on_admission() {
    let rig = Rig::new();
    let kind = rig.kind("ok", "exit 0");
    let dispatcher = rig.dispatcher(vec![kind.clone()], 1);

    let file = rig.drop_file("h.txt");
    rig.markers.create("ok", &file, 4_000_000).unwrap();

    assert!(dispatcher.enqueue(kind, file.clone()).await.unwrap());
    drain(&dispatcher).await;

    assert!(rig.root.join("done").join("h.txt").exists());
}

#[tokio::test]
async fn scan_picks_up_preexisting_files() {
    let rig = Rig::new();
    let kind = rig.kind("ok", "exit 0");
    let dispatcher = rig.dispatcher(vec![kind.clone()], 1);

    rig.drop_file("i.txt");
    rig.drop_file(".ignored");

    WatchService::scan_existing(&[kind], &dispatcher)
        .await
        .unwrap();
    assert_eq!(dispatcher.pending_count().await, 1);
}

#[tokio::test]
async fn watcher_feeds_new_arrivals() {
    let rig = Rig::new();
    let kind = rig.kind("ok", "exit 0");
    let dispatcher = Arc::new(rig.dispatcher(vec![kind.clone()], 1));

    let service = WatchService::start(&[kind]).unwrap();
    let forwarder = tokio::spawn(service.forward(dispatcher.clone()));

    rig.drop_file("j.txt");

    let done = rig.root.join("done").join("j.txt");
    for _ in 0..500 {
        dispatcher.tick().await.unwrap();
        if done.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(done.exists());
    forwarder.abort();
}

#[tokio::test]
async fn launch_failure_with_broken_marker_store_still_finalizes() {
    let rig = Rig::new();
    // every marker operation fails from here on: the pids path is a
    // plain file, not a directory
    std::fs::remove_dir(rig.root.join("pids")).unwrap();
    std::fs::write(rig.root.join("pids"), b"").unwrap();

    let kind = Arc::new(TaskKind {
        name: "broken".to_string(),
        executable: PathBuf::from("/definitely/not/an/executable"),
        args: String::new(),
        input_dir: rig.root.join("input"),
        done_dir: rig.root.join("done"),
        failed_dir: rig.root.join("failed"),
        enabled: true,
        settle_secs: 0,
    });
    let dispatcher = rig.dispatcher(vec![kind.clone()], 1);

    let file = rig.drop_file("m.txt");
    assert!(dispatcher.enqueue(kind, file.clone()).await.unwrap());
    drain(&dispatcher).await;

    // the marker error must not leave a dangling Pending row
    assert!(rig.ledger.list_active().unwrap().is_empty());
    let history = rig.ledger.list_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].final_status, TaskStatus::Aborted);
    assert!(history[0]
        .final_message
        .as_deref()
        .unwrap()
        .starts_with("launch failed"));
    assert!(rig.root.join("failed").join("m.txt").exists());
}

#[tokio::test]
async fn ledger_outage_parks_finalization_until_retry() {
    let rig = Rig::new();
    let db_path = rig.root.join("ledger.db");
    let ledger = Arc::new(Ledger::open(&db_path).unwrap());
    let kind = rig.kind("ok", "exit 0");
    let dispatcher = Dispatcher::new(
        ledger.clone(),
        rig.markers.clone(),
        vec![kind.clone()],
        DispatcherConfig {
            max_concurrent: 1,
            tick_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
        },
    );

    let file = rig.drop_file("n.txt");
    dispatcher.enqueue(kind, file.clone()).await.unwrap();
    dispatcher.tick().await.unwrap();
    assert_eq!(dispatcher.active_count().await, 1);

    // let the child exit before the ledger becomes unwritable
    tokio::time::sleep(Duration::from_millis(500)).await;

    // a held write transaction makes every ledger write time out
    let blocker = rusqlite::Connection::open(&db_path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    dispatcher.tick().await.unwrap();

    // the slot frees in the same tick even though the history move failed
    assert_eq!(dispatcher.active_count().await, 0);
    assert!(rig.root.join("done").join("n.txt").exists());
    assert!(ledger.list_history(10).unwrap().is_empty());

    blocker.execute_batch("COMMIT").unwrap();
    drop(blocker);

    // once the retry backoff elapses the parked move lands
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let mut landed = false;
    for _ in 0..50 {
        dispatcher.tick().await.unwrap();
        if !ledger.list_history(10).unwrap().is_empty() {
            landed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(landed, "parked finalization never landed");

    let history = ledger.list_history(10).unwrap();
    assert_eq!(history[0].final_status, TaskStatus::Completed);
    assert!(ledger.list_active().unwrap().is_empty());
}

#[tokio::test]
async fn vanished_queued_file_is_closed_out() {
    let rig = Rig::new();
    let kind = rig.kind("ok", "exit 0");
    let dispatcher = rig.dispatcher(vec![kind.clone()], 1);

    let file = rig.drop_file("k.txt");
    dispatcher.enqueue(kind, file.clone()).await.unwrap();
    std::fs::remove_file(&file).unwrap();

    drain(&dispatcher).await;

    let latest = rig
        .ledger
        .latest_history(&file.to_string_lossy())
        .unwrap()
        .unwrap();
    assert_eq!(latest.final_status, TaskStatus::Aborted);
    assert_eq!(
        latest.final_message.as_deref(),
        Some("input file disappeared before launch")
    );
}
