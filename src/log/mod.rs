#![forbid(unsafe_code)]

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Which pipe (or internal source) a log line came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines produced by the engine itself (task start, cancellation, ...).
    System,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
            Self::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    pub task_id: u64,
    pub timestamp: String,
    pub stream: LogStream,
    pub text: String,
}

impl LogLine {
    #[must_use]
    pub fn now(task_id: u64, stream: LogStream, text: impl Into<String>) -> Self {
        Self {
            task_id,
            timestamp: now_rfc3339(),
            stream,
            text: text.into(),
        }
    }
}

/// Append-only, in-memory session log.
///
/// `append` is the only mutator and serializes writers behind one mutex,
/// so lines keep their arrival order even when both stream readers of the
/// active task push concurrently. The log lives for the process lifetime
/// only; nothing is persisted.
#[derive(Debug, Default)]
pub struct OutputLog {
    inner: Mutex<LogInner>,
}

#[derive(Debug, Default)]
struct LogInner {
    lines: Vec<LogLine>,
    subscribers: Vec<mpsc::UnboundedSender<LogLine>>,
}

impl OutputLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, line: LogLine) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .subscribers
            .retain(|tx| tx.send(line.clone()).is_ok());
        inner.lines.push(line);
    }

    /// Point-in-time copy of everything appended so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogLine> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.lines.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Single-pass notification stream of subsequent appends. The receiver
    /// sees nothing appended before the call; dropped receivers are pruned
    /// on the next append.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LogLine> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.subscribers.push(tx);
        rx
    }
}

#[must_use]
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_preserves_order_and_snapshot_is_stable() {
        let log = OutputLog::new();
        for i in 0..5 {
            log.append(LogLine::now(1, LogStream::Stdout, format!("line {i}")));
        }
        let snap = log.snapshot();
        assert_eq!(snap.len(), 5);
        for (i, line) in snap.iter().enumerate() {
            assert_eq!(line.text, format!("line {i}"));
            assert_eq!(line.stream, LogStream::Stdout);
        }

        // Appends after the snapshot do not mutate it.
        log.append(LogLine::now(1, LogStream::Stderr, "later"));
        assert_eq!(snap.len(), 5);
        assert_eq!(log.len(), 6);
    }

    #[tokio::test]
    async fn subscribe_sees_only_subsequent_appends() {
        let log = OutputLog::new();
        log.append(LogLine::now(1, LogStream::System, "before"));

        let mut rx = log.subscribe();
        log.append(LogLine::now(1, LogStream::Stdout, "after"));

        let got = rx.recv().await.expect("line");
        assert_eq!(got.text, "after");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let log = OutputLog::new();
        let rx = log.subscribe();
        drop(rx);
        // Must not error or panic with a dead receiver on the list.
        log.append(LogLine::now(2, LogStream::Stdout, "x"));
        assert_eq!(log.len(), 1);
    }
}
