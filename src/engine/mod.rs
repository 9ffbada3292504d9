#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::catalog::Catalog;
use crate::error::MiniToolsError;
use crate::extensions::{self, ScanReport};
use crate::log::{LogLine, LogStream, OutputLog, now_rfc3339};
use crate::runner;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskSource {
    Action { identifier: String },
    Extension { identifier: String },
}

impl TaskSource {
    #[must_use]
    pub fn identifier(&self) -> &str {
        match self {
            Self::Action { identifier } | Self::Extension { identifier } => identifier,
        }
    }
}

/// Why a task ended in `Failed`. Distinguishes a process that never
/// started from one that ran and exited badly, so callers never have to
/// parse log text to tell them apart.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    /// The process could not be spawned; no output lines exist.
    SpawnFailed { message: String },
    /// The process ran to completion and returned a non-zero status.
    NonZeroExit { code: i32 },
    /// The process died from a signal outside our cancellation path.
    Signal,
    /// The runner lost track of the process after it started.
    Supervision { message: String },
}

/// Read-only view of one execution. The engine owns the live record and
/// hands out copies; a snapshot never regresses to an earlier state.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub task_id: u64,
    pub source: TaskSource,
    pub state: TaskState,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub exit_code: Option<i32>,
    /// Set exactly when `state` is `Failed`.
    pub failure: Option<TaskFailure>,
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Line(LogLine),
    /// Always delivered after the last `Line` for the task.
    Finished(TaskSnapshot),
}

/// Live view of a started task: process output lines followed by exactly
/// one terminal snapshot. Single-pass and finite.
#[derive(Debug)]
pub struct TaskHandle {
    pub task_id: u64,
    pub events: mpsc::UnboundedReceiver<TaskEvent>,
}

#[derive(Debug)]
pub enum Observation {
    /// The task is still running; events from now on, then the terminal
    /// snapshot.
    Live(TaskHandle),
    /// Only the retained final snapshot is left; history is not replayed.
    Finished(TaskSnapshot),
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub busy: bool,
    pub active: Option<TaskSnapshot>,
    pub last_finished: Option<TaskSnapshot>,
}

type EventSinks = Arc<Mutex<Vec<mpsc::UnboundedSender<TaskEvent>>>>;

struct ActiveTask {
    task_id: u64,
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
    sinks: EventSinks,
    snapshot: Arc<Mutex<TaskSnapshot>>,
}

#[derive(Default)]
struct EngineState {
    active: Option<ActiveTask>,
    last_finished: Option<TaskSnapshot>,
    next_task_id: u64,
}

/// The single point of truth for task execution.
///
/// Strictly one task may run at a time: built-ins mutate shared system
/// state (package databases, partition metadata), and interleaving them
/// with each other or with an arbitrary user script has no defined
/// combined semantics. A second request while one runs is rejected with
/// `EngineBusy` rather than queued.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: Catalog,
    log: OutputLog,
    kill_grace: Duration,
    extensions_dir: PathBuf,
    scan: RwLock<ScanReport>,
    state: Mutex<EngineState>,
}

impl TaskEngine {
    #[must_use]
    pub fn new(catalog: Catalog, extensions_dir: PathBuf, kill_grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                log: OutputLog::new(),
                kill_grace,
                extensions_dir,
                scan: RwLock::new(ScanReport::default()),
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    #[must_use]
    pub fn log(&self) -> &OutputLog {
        &self.inner.log
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    #[must_use]
    pub fn extensions_dir(&self) -> &std::path::Path {
        &self.inner.extensions_dir
    }

    /// Fresh discovery pass over the configured extensions directory.
    /// The previous snapshot is replaced wholesale.
    pub fn rescan(&self) -> Result<ScanReport, MiniToolsError> {
        let report = extensions::scan(&self.inner.extensions_dir)?;
        *lock_write(&self.inner.scan) = report.clone();
        Ok(report)
    }

    #[must_use]
    pub fn extensions_snapshot(&self) -> ScanReport {
        lock_read(&self.inner.scan).clone()
    }

    pub fn start_action(
        &self,
        identifier: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<TaskHandle, MiniToolsError> {
        let action = self
            .inner
            .catalog
            .lookup(identifier)
            .ok_or_else(|| MiniToolsError::UnknownAction(identifier.to_owned()))?;
        let argv = action.resolve(params)?;
        self.start(
            TaskSource::Action {
                identifier: identifier.to_owned(),
            },
            argv,
        )
    }

    /// Run an extension from the most recent discovery snapshot. Callers
    /// needing liveness call `rescan` first; the engine never re-scans
    /// implicitly.
    pub fn start_extension(&self, identifier: &str) -> Result<TaskHandle, MiniToolsError> {
        let argv = {
            let scan = lock_read(&self.inner.scan);
            let ext = scan
                .find(identifier)
                .ok_or_else(|| MiniToolsError::UnknownExtension(identifier.to_owned()))?;
            ext.command()
        };
        self.start(
            TaskSource::Extension {
                identifier: identifier.to_owned(),
            },
            argv,
        )
    }

    /// Request cancellation of the active task. The engine stays busy
    /// until the runner confirms the process is gone; the task then
    /// finishes as `Cancelled`.
    pub fn cancel(&self, task_id: u64) -> Result<(), MiniToolsError> {
        let state = lock(&self.inner.state);
        match &state.active {
            Some(active) if active.task_id == task_id => {
                let _ = active.cancel.send(true);
                self.inner.log.append(LogLine::now(
                    task_id,
                    LogStream::System,
                    "cancellation requested",
                ));
                Ok(())
            }
            _ => Err(MiniToolsError::NoActiveTask),
        }
    }

    /// Attach to a task by id. Live tasks yield their subsequent events;
    /// the most recently finished task yields only its retained snapshot.
    pub fn observe(&self, task_id: u64) -> Result<Observation, MiniToolsError> {
        let state = lock(&self.inner.state);
        if let Some(active) = &state.active
            && active.task_id == task_id
        {
            let (tx, rx) = mpsc::unbounded_channel();
            lock(&active.sinks).push(tx);
            return Ok(Observation::Live(TaskHandle {
                task_id,
                events: rx,
            }));
        }
        if let Some(last) = &state.last_finished
            && last.task_id == task_id
        {
            return Ok(Observation::Finished(last.clone()));
        }
        Err(MiniToolsError::NoActiveTask)
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        let state = lock(&self.inner.state);
        EngineStatus {
            busy: state.active.is_some(),
            active: state
                .active
                .as_ref()
                .map(|a| lock(&a.snapshot).clone()),
            last_finished: state.last_finished.clone(),
        }
    }

    /// Cancel any active task and wait for it to reach a terminal state.
    /// Uses the same graceful-then-forced path as `cancel`, so no process
    /// is left orphaned on exit.
    pub async fn shutdown(&self) {
        let waiter = {
            let state = lock(&self.inner.state);
            state.active.as_ref().map(|active| {
                let _ = active.cancel.send(true);
                active.done.clone()
            })
        };
        if let Some(mut done) = waiter {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    fn start(&self, source: TaskSource, argv: Vec<String>) -> Result<TaskHandle, MiniToolsError> {
        let (task_id, cancel_rx, done_tx, sinks, snapshot, events_rx) = {
            let mut state = lock(&self.inner.state);
            if state.active.is_some() {
                return Err(MiniToolsError::EngineBusy);
            }

            state.next_task_id += 1;
            let task_id = state.next_task_id;

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let (done_tx, done_rx) = watch::channel(false);
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let sinks: EventSinks = Arc::new(Mutex::new(vec![events_tx]));
            let snapshot = Arc::new(Mutex::new(TaskSnapshot {
                task_id,
                source: source.clone(),
                state: TaskState::Pending,
                started_at: None,
                ended_at: None,
                exit_code: None,
                failure: None,
            }));

            state.active = Some(ActiveTask {
                task_id,
                cancel: cancel_tx,
                done: done_rx,
                sinks: Arc::clone(&sinks),
                snapshot: Arc::clone(&snapshot),
            });
            (task_id, cancel_rx, done_tx, sinks, snapshot, events_rx)
        };

        self.inner.log.append(LogLine::now(
            task_id,
            LogStream::System,
            format!("starting {}: {}", source.identifier(), argv.join(" ")),
        ));

        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .drive(task_id, argv, cancel_rx, done_tx, sinks, snapshot)
                .await;
        });

        Ok(TaskHandle {
            task_id,
            events: events_rx,
        })
    }

    async fn drive(
        &self,
        task_id: u64,
        argv: Vec<String>,
        cancel_rx: watch::Receiver<bool>,
        done_tx: watch::Sender<bool>,
        sinks: EventSinks,
        snapshot: Arc<Mutex<TaskSnapshot>>,
    ) {
        {
            let mut snap = lock(&snapshot);
            snap.state = TaskState::Running;
            snap.started_at = Some(now_rfc3339());
        }

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let forwarder = {
            let engine = self.clone();
            let sinks = Arc::clone(&sinks);
            tokio::spawn(async move {
                while let Some((stream, text)) = line_rx.recv().await {
                    let line = LogLine::now(task_id, stream, text);
                    engine.inner.log.append(line.clone());
                    broadcast(&sinks, &TaskEvent::Line(line));
                }
            })
        };

        let result = runner::run(&argv, line_tx, cancel_rx, self.inner.kill_grace).await;

        // The runner has joined its stream readers, so the forwarder drains
        // every remaining line before the terminal event goes out.
        let _ = forwarder.await;

        let (state, exit_code, failure, note) = match &result {
            Ok(res) if res.was_cancelled => {
                (TaskState::Cancelled, res.exit_code, None, "cancelled".to_owned())
            }
            Ok(res) if res.exit_code == Some(0) => {
                (TaskState::Succeeded, res.exit_code, None, "succeeded".to_owned())
            }
            Ok(res) => match res.exit_code {
                Some(code) => (
                    TaskState::Failed,
                    Some(code),
                    Some(TaskFailure::NonZeroExit { code }),
                    format!("exited with code {code}"),
                ),
                None => (
                    TaskState::Failed,
                    None,
                    Some(TaskFailure::Signal),
                    "terminated by signal".to_owned(),
                ),
            },
            Err(e @ MiniToolsError::SpawnFailed { .. }) => (
                TaskState::Failed,
                None,
                Some(TaskFailure::SpawnFailed {
                    message: e.to_string(),
                }),
                e.to_string(),
            ),
            Err(e) => (
                TaskState::Failed,
                None,
                Some(TaskFailure::Supervision {
                    message: e.to_string(),
                }),
                e.to_string(),
            ),
        };

        let finished = {
            let mut snap = lock(&snapshot);
            snap.state = state;
            snap.exit_code = exit_code;
            snap.failure = failure;
            snap.ended_at = Some(now_rfc3339());
            snap.clone()
        };

        self.inner.log.append(LogLine::now(
            task_id,
            LogStream::System,
            format!("task {}: {note}", finished.source.identifier()),
        ));

        {
            let mut engine_state = lock(&self.inner.state);
            engine_state.last_finished = Some(finished.clone());
            engine_state.active = None;
        }

        broadcast(&sinks, &TaskEvent::Finished(finished));
        let _ = done_tx.send(true);
    }
}

fn broadcast(sinks: &EventSinks, event: &TaskEvent) {
    lock(sinks).retain(|tx| tx.send(event.clone()).is_ok());
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock_read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock_write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine(dir: &std::path::Path) -> TaskEngine {
        TaskEngine::new(
            Catalog::for_distro(Some("debian")),
            dir.to_path_buf(),
            Duration::from_secs(2),
        )
    }

    async fn wait_finished(handle: &mut TaskHandle) -> (Vec<LogLine>, TaskSnapshot) {
        let mut lines = Vec::new();
        while let Some(event) = handle.events.recv().await {
            match event {
                TaskEvent::Line(line) => lines.push(line),
                TaskEvent::Finished(snap) => return (lines, snap),
            }
        }
        panic!("handle closed without a terminal event");
    }

    #[tokio::test]
    async fn unknown_identifiers_are_rejected_while_idle() {
        let td = tempfile::tempdir().expect("tempdir");
        let engine = test_engine(td.path());

        let err = engine
            .start_action("no-such-action", &BTreeMap::new())
            .expect_err("unknown action");
        assert!(matches!(err, MiniToolsError::UnknownAction(_)));

        engine.rescan().expect("rescan");
        let err = engine
            .start_extension("ghost.sh")
            .expect_err("unknown extension");
        assert!(matches!(err, MiniToolsError::UnknownExtension(_)));

        // Nothing was spawned, nothing was logged beyond zero entries.
        assert!(engine.status().active.is_none());
        assert!(engine.log().is_empty());
    }

    #[tokio::test]
    async fn extension_runs_and_lines_arrive_before_terminal_event() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            td.path().join("hello.sh"),
            "for i in 1 2 3; do echo \"line $i\"; done\n",
        )
        .expect("write");

        let engine = test_engine(td.path());
        engine.rescan().expect("rescan");

        let mut handle = engine.start_extension("hello.sh").expect("start");
        let (lines, snap) = wait_finished(&mut handle).await;

        assert_eq!(lines.len(), 3);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line.text, format!("line {}", i + 1));
            assert_eq!(line.stream, LogStream::Stdout);
            assert_eq!(line.task_id, handle.task_id);
        }
        assert_eq!(snap.state, TaskState::Succeeded);
        assert_eq!(snap.exit_code, Some(0));
        assert_eq!(snap.failure, None);
        assert!(snap.started_at.is_some() && snap.ended_at.is_some());

        // Terminal state released the execution slot.
        assert!(!engine.status().busy);
    }

    #[tokio::test]
    async fn busy_engine_rejects_new_requests_until_idle() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(td.path().join("slow.sh"), "sleep 30\n").expect("write");
        std::fs::write(td.path().join("quick.sh"), "echo done\n").expect("write");

        let engine = test_engine(td.path());
        engine.rescan().expect("rescan");

        let mut slow = engine.start_extension("slow.sh").expect("start slow");
        assert!(engine.status().busy);

        let err = engine
            .start_extension("quick.sh")
            .expect_err("rejected while busy");
        assert!(matches!(err, MiniToolsError::EngineBusy));

        engine.cancel(slow.task_id).expect("cancel");
        let (_, snap) = wait_finished(&mut slow).await;
        assert_eq!(snap.state, TaskState::Cancelled);

        // Back to idle: the next request is accepted.
        let mut quick = engine.start_extension("quick.sh").expect("start quick");
        let (lines, snap) = wait_finished(&mut quick).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(snap.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn cancel_without_active_task_is_refused() {
        let td = tempfile::tempdir().expect("tempdir");
        let engine = test_engine(td.path());
        assert!(matches!(
            engine.cancel(1),
            Err(MiniToolsError::NoActiveTask)
        ));
    }

    #[tokio::test]
    async fn spawn_failure_finishes_failed_with_no_output_lines() {
        let td = tempfile::tempdir().expect("tempdir");
        let engine = test_engine(td.path());

        let mut handle = engine
            .start(
                TaskSource::Action {
                    identifier: "broken".to_owned(),
                },
                vec!["/nonexistent/interpreter-xyz".to_owned()],
            )
            .expect("start accepts the request before spawning");
        let (lines, snap) = wait_finished(&mut handle).await;

        assert_eq!(snap.state, TaskState::Failed);
        assert_eq!(snap.exit_code, None);
        assert!(matches!(
            snap.failure,
            Some(TaskFailure::SpawnFailed { .. })
        ));
        assert!(lines.is_empty());
        assert!(!engine.status().busy);
    }

    #[tokio::test]
    async fn missing_script_surfaces_interpreter_failure() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(td.path().join("gone.sh"), "echo hi\n").expect("write");
        let engine = test_engine(td.path());
        engine.rescan().expect("rescan");
        // The snapshot still lists the script; bash then fails to find it.
        std::fs::remove_file(td.path().join("gone.sh")).expect("rm");

        let mut handle = engine.start_extension("gone.sh").expect("start");
        let (lines, snap) = wait_finished(&mut handle).await;

        assert_eq!(snap.state, TaskState::Failed);
        // bash itself started fine, so this is a non-zero exit, not a
        // spawn failure.
        assert!(matches!(
            snap.failure,
            Some(TaskFailure::NonZeroExit { .. })
        ));
        assert!(lines.iter().all(|l| l.stream != LogStream::Stdout));
        assert!(!engine.status().busy);
    }

    #[tokio::test]
    async fn observe_live_then_only_final_snapshot_after_completion() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(td.path().join("slow.sh"), "sleep 30\n").expect("write");

        let engine = test_engine(td.path());
        engine.rescan().expect("rescan");

        let mut handle = engine.start_extension("slow.sh").expect("start");
        let observation = engine.observe(handle.task_id).expect("observe");
        let Observation::Live(mut second) = observation else {
            panic!("expected live observation");
        };

        engine.cancel(handle.task_id).expect("cancel");
        let (_, snap_a) = wait_finished(&mut handle).await;
        let (_, snap_b) = wait_finished(&mut second).await;
        assert_eq!(snap_a, snap_b);

        // After completion only the retained snapshot is available.
        match engine.observe(handle.task_id).expect("observe finished") {
            Observation::Finished(snap) => assert_eq!(snap, snap_a),
            Observation::Live(_) => panic!("task is finished"),
        }
        assert!(matches!(
            engine.observe(handle.task_id + 100),
            Err(MiniToolsError::NoActiveTask)
        ));
    }

    #[tokio::test]
    async fn shutdown_cancels_the_active_task() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(td.path().join("slow.sh"), "sleep 30\n").expect("write");

        let engine = test_engine(td.path());
        engine.rescan().expect("rescan");
        let _handle = engine.start_extension("slow.sh").expect("start");

        engine.shutdown().await;
        let status = engine.status();
        assert!(!status.busy);
        assert_eq!(
            status.last_finished.map(|s| s.state),
            Some(TaskState::Cancelled)
        );
    }
}
