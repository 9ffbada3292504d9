#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::io::AsyncBufReadExt as _;
use tokio::sync::{mpsc, watch};

use crate::error::MiniToolsError;
use crate::log::LogStream;

/// How long a cancelled process gets to exit after SIGTERM before it is
/// killed outright.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessResult {
    /// Exit code of the process, if it exited normally. `None` when the
    /// process died from a signal (including our own SIGKILL).
    pub exit_code: Option<i32>,
    pub was_cancelled: bool,
}

impl ProcessResult {
    #[must_use]
    pub fn success(&self) -> bool {
        !self.was_cancelled && self.exit_code == Some(0)
    }
}

/// Spawn `argv` and supervise it to completion.
///
/// Arguments are passed as a discrete list; nothing is re-interpreted by a
/// shell. Each output stream gets its own reader task that forwards complete
/// lines through `lines` in producer order (a trailing partial line is
/// flushed as a final line). No ordering is promised between the two
/// streams beyond arrival time.
///
/// Flipping `cancel` to `true` sends SIGTERM to the child's process group,
/// waits up to `grace`, then SIGKILLs. The returned result then has
/// `was_cancelled = true` regardless of how the process actually exited.
///
/// A failure to spawn is reported as `SpawnFailed` before any line is sent.
pub async fn run(
    argv: &[String],
    lines: mpsc::UnboundedSender<(LogStream, String)>,
    mut cancel: watch::Receiver<bool>,
    grace: Duration,
) -> Result<ProcessResult, MiniToolsError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(MiniToolsError::Other("empty command line".to_owned()));
    };

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| MiniToolsError::SpawnFailed {
        command: argv.join(" "),
        source,
    })?;
    let pid = child.id();

    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(spawn_reader(out, LogStream::Stdout, lines.clone()));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(spawn_reader(err, LogStream::Stderr, lines.clone()));
    }
    drop(lines);

    let mut was_cancelled = false;
    let status = tokio::select! {
        status = child.wait() => status.map_err(|source| MiniToolsError::IoPath {
            path: std::path::PathBuf::from(program),
            source,
        })?,
        () = wait_for_cancel(&mut cancel) => {
            was_cancelled = true;
            terminate(&mut child, pid, grace).await?
        }
    };

    // The readers finish once the pipes close; joining them here guarantees
    // every line has been forwarded before the result is returned.
    for handle in readers {
        let _ = handle.await;
    }

    Ok(ProcessResult {
        exit_code: status.code(),
        was_cancelled,
    })
}

fn spawn_reader<R>(
    pipe: R,
    stream: LogStream,
    tx: mpsc::UnboundedSender<(LogStream, String)>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(pipe).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if tx.send((stream, line)).is_err() {
                break;
            }
        }
    })
}

/// Resolves once the watch value becomes `true`. Pends forever if the
/// sender is dropped without cancelling.
async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Graceful-then-forced termination: SIGTERM the process group, and if the
/// child is still alive after `grace`, SIGKILL the whole group. Killing the
/// group (not just the direct child) is what closes the inherited pipes, so
/// a descendant that ignores SIGTERM cannot keep the stream readers alive
/// past the grace window. Always reaps the child.
async fn terminate(
    child: &mut tokio::process::Child,
    pid: Option<u32>,
    grace: Duration,
) -> Result<std::process::ExitStatus, MiniToolsError> {
    signal_group(pid, GroupSignal::Term);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.map_err(|e| MiniToolsError::Other(format!("wait failed: {e}"))),
        Err(_) => {
            signal_group(pid, GroupSignal::Kill);
            let _ = child.kill().await;
            child
                .wait()
                .await
                .map_err(|e| MiniToolsError::Other(format!("wait failed: {e}")))
        }
    }
}

#[derive(Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    let signal = match signal {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    if let Ok(raw) = i32::try_from(pid) {
        let _ = killpg(Pid::from_raw(raw), signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) {}
