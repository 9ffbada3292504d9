use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use minitools::catalog::Catalog;
use minitools::engine::{TaskEngine, TaskEvent, TaskFailure, TaskState};
use minitools::error::MiniToolsError;
use minitools::log::LogStream;

fn have(binary: &str) -> bool {
    Command::new(binary).arg("--version").output().is_ok()
}

fn engine_in(dir: &std::path::Path) -> TaskEngine {
    TaskEngine::new(
        Catalog::for_distro(Some("arch")),
        dir.to_path_buf(),
        Duration::from_secs(2),
    )
}

#[tokio::test]
async fn shell_extension_runs_end_to_end() {
    if !have("bash") {
        eprintln!("skipping: bash not found");
        return;
    }

    let td = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        td.path().join("clean_caches.sh"),
        "echo scanning\necho 'removed 2 entries' >&2\nexit 0\n",
    )
    .expect("write script");

    let engine = engine_in(td.path());
    let scan = engine.rescan().expect("rescan");
    assert_eq!(scan.extensions.len(), 1);
    assert_eq!(scan.extensions[0].display_name, "clean caches");

    let mut handle = engine.start_extension("clean_caches.sh").expect("start");

    let mut stdout_lines = Vec::new();
    let mut stderr_lines = Vec::new();
    let mut terminal = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            TaskEvent::Line(line) => match line.stream {
                LogStream::Stdout => stdout_lines.push(line.text),
                LogStream::Stderr => stderr_lines.push(line.text),
                LogStream::System => panic!("system lines stay in the global log"),
            },
            TaskEvent::Finished(snap) => {
                terminal = Some(snap);
                break;
            }
        }
    }

    assert_eq!(stdout_lines, vec!["scanning".to_owned()]);
    assert_eq!(stderr_lines, vec!["removed 2 entries".to_owned()]);
    let snap = terminal.expect("terminal event");
    assert_eq!(snap.state, TaskState::Succeeded);
    assert_eq!(snap.exit_code, Some(0));

    // The global log additionally recorded the system start/finish entries.
    let log = engine.log().snapshot();
    assert!(log.iter().any(|l| l.stream == LogStream::System));
    assert!(log.iter().any(|l| l.text == "scanning"));
}

#[tokio::test]
async fn python_extension_is_discovered_and_run() {
    if !have("python3") {
        eprintln!("skipping: python3 not found");
        return;
    }

    let td = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        td.path().join("report.py"),
        "import sys\nprint('ok')\nsys.exit(4)\n",
    )
    .expect("write script");

    let engine = engine_in(td.path());
    engine.rescan().expect("rescan");

    let mut handle = engine.start_extension("report.py").expect("start");
    let mut saw_ok = false;
    let mut terminal = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            TaskEvent::Line(line) => saw_ok |= line.text == "ok",
            TaskEvent::Finished(snap) => {
                terminal = Some(snap);
                break;
            }
        }
    }

    assert!(saw_ok);
    let snap = terminal.expect("terminal event");
    // Non-zero exit is a completed run that failed, not an engine error.
    assert_eq!(snap.state, TaskState::Failed);
    assert_eq!(snap.exit_code, Some(4));
    assert_eq!(snap.failure, Some(TaskFailure::NonZeroExit { code: 4 }));
}

#[tokio::test]
async fn cancellation_tears_down_the_whole_process_group() {
    if !have("bash") {
        eprintln!("skipping: bash not found");
        return;
    }

    let td = tempfile::tempdir().expect("tempdir");
    // The script spawns a child of its own; cancellation signals the group,
    // so neither survives.
    std::fs::write(
        td.path().join("spin.sh"),
        "sleep 60 &\necho started\nwait\n",
    )
    .expect("write script");

    let engine = engine_in(td.path());
    engine.rescan().expect("rescan");

    let mut handle = engine.start_extension("spin.sh").expect("start");

    // Wait for the first output line so the group is fully up.
    let first = handle.events.recv().await.expect("first event");
    match first {
        TaskEvent::Line(line) => assert_eq!(line.text, "started"),
        TaskEvent::Finished(snap) => panic!("finished too early: {snap:?}"),
    }

    engine.cancel(handle.task_id).expect("cancel");

    let deadline = tokio::time::Duration::from_secs(10);
    let snap = tokio::time::timeout(deadline, async {
        loop {
            match handle.events.recv().await {
                Some(TaskEvent::Finished(snap)) => return snap,
                Some(TaskEvent::Line(_)) => {}
                None => panic!("events closed without terminal snapshot"),
            }
        }
    })
    .await
    .expect("cancellation completed in time");

    assert_eq!(snap.state, TaskState::Cancelled);
    assert!(!engine.status().busy);
}

#[tokio::test]
async fn busy_and_unknown_requests_fail_without_side_effects() {
    if !have("bash") {
        eprintln!("skipping: bash not found");
        return;
    }

    let td = tempfile::tempdir().expect("tempdir");
    std::fs::write(td.path().join("slow.sh"), "sleep 60\n").expect("write script");

    let engine = engine_in(td.path());
    engine.rescan().expect("rescan");

    let handle = engine.start_extension("slow.sh").expect("start");

    let err = engine
        .start_action("flatpak-update", &BTreeMap::new())
        .expect_err("busy");
    assert!(matches!(err, MiniToolsError::EngineBusy));

    let err = engine
        .start_extension("nonexistent.sh")
        .expect_err("unknown");
    assert!(matches!(err, MiniToolsError::UnknownExtension(_)));

    // The rejected requests left no trace in the log.
    let before = engine.log().len();
    engine.cancel(handle.task_id).expect("cancel");
    assert!(engine.log().len() >= before);

    engine.shutdown().await;
    assert!(!engine.status().busy);
}
