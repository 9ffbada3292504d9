#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::MiniToolsError;

/// Script type, keyed on file suffix. Determines the interpreter used to
/// invoke the extension.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionKind {
    ShellScript,
    PythonScript,
}

impl ExtensionKind {
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(".sh") {
            Some(Self::ShellScript)
        } else if name.ends_with(".py") {
            Some(Self::PythonScript)
        } else {
            None
        }
    }

    #[must_use]
    pub fn interpreter(self) -> &'static str {
        match self {
            Self::ShellScript => "bash",
            Self::PythonScript => "python3",
        }
    }
}

/// One discoverable user script. Rebuilt wholesale on every scan.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Extension {
    /// Stable key: the file name, unique within one scan.
    pub identifier: String,
    pub display_name: String,
    pub path: PathBuf,
    pub kind: ExtensionKind,
}

impl Extension {
    /// Full argv for running this extension through its interpreter.
    #[must_use]
    pub fn command(&self) -> Vec<String> {
        vec![
            self.kind.interpreter().to_owned(),
            self.path.to_string_lossy().to_string(),
        ]
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ScanReport {
    pub extensions: Vec<Extension>,
    pub skipped: Vec<SkippedEntry>,
}

impl ScanReport {
    #[must_use]
    pub fn find(&self, identifier: &str) -> Option<&Extension> {
        self.extensions
            .iter()
            .find(|e| e.identifier == identifier)
    }
}

/// Scan `dir` for runnable scripts, sorted ascending by file name.
///
/// A missing directory is a normal case (the user never created it) and
/// yields an empty report. Directories and unrecognized suffixes are
/// skipped silently; entries that exist but cannot be read are recorded in
/// `skipped` so one broken script never hides the rest. Every call returns
/// a fresh snapshot; there is no caching between calls.
pub fn scan(dir: &Path) -> Result<ScanReport, MiniToolsError> {
    if !dir.exists() {
        return Ok(ScanReport::default());
    }

    let entries = std::fs::read_dir(dir).map_err(|source| MiniToolsError::IoPath {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut report = ScanReport::default();
    let mut names: Vec<(String, PathBuf)> = Vec::new();
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        names.push((name.to_owned(), path));
    }
    names.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, path) in names {
        if path.is_dir() {
            continue;
        }
        let Some(kind) = ExtensionKind::from_file_name(&name) else {
            continue;
        };
        if let Err(e) = std::fs::File::open(&path) {
            report.skipped.push(SkippedEntry {
                path,
                reason: e.to_string(),
            });
            continue;
        }
        report.extensions.push(Extension {
            display_name: display_name(&name),
            identifier: name,
            path,
            kind,
        });
    }

    Ok(report)
}

/// Human label: file stem with `_` and `-` turned into spaces.
#[must_use]
pub fn display_name(file_name: &str) -> String {
    let stem = file_name
        .rsplit_once('.')
        .map_or(file_name, |(stem, _)| stem);
    stem.replace(['_', '-'], " ")
}
