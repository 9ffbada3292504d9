#![forbid(unsafe_code)]

pub mod table;

pub use table::Table;

use crate::log::{LogLine, LogStream};

/// Render a captured line the way the CLI prints it while a task runs.
#[must_use]
pub fn format_log_line(line: &LogLine, show_timestamps: bool) -> String {
    let tag = match line.stream {
        LogStream::Stdout => "out",
        LogStream::Stderr => "err",
        LogStream::System => "sys",
    };
    if show_timestamps {
        format!("{} [{tag}] {}", line.timestamp, line.text)
    } else {
        format!("[{tag}] {}", line.text)
    }
}
