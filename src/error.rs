#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MiniToolsError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("unknown extension '{0}'")]
    UnknownExtension(String),

    #[error("a task is already running")]
    EngineBusy,

    #[error("no active task")]
    NoActiveTask,

    #[error("failed to start '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("missing parameter '{0}' for action command")]
    MissingParameter(String),

    #[error("unsupported filesystem '{0}' for uuid change")]
    UnsupportedFilesystem(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config key '{0}'")]
    InvalidConfigKey(String),

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}
