use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Label used in statistics for files without an extension.
pub const NO_EXTENSION: &str = "(no extension)";

/// A file discovered under the repository root.
///
/// Entries are created once per run and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    /// Slash-separated path relative to the repository root
    pub relative_path: String,

    /// Size in bytes at scan time
    pub size_bytes: u64,

    /// Modification time in nanoseconds since the Unix epoch
    pub modified_time: i64,

    /// The entry is itself a symbolic link that is not followed
    pub is_symlink: bool,
}

impl FileEntry {
    /// Creates a regular file entry.
    #[must_use]
    pub fn new(relative_path: impl Into<String>, size_bytes: u64, modified_time: i64) -> Self {
        Self {
            relative_path: relative_path.into(),
            size_bytes,
            modified_time,
            is_symlink: false,
        }
    }

    /// Creates an entry for a symbolic link that will not be followed.
    #[must_use]
    pub fn symlink(relative_path: impl Into<String>, size_bytes: u64, modified_time: i64) -> Self {
        Self {
            is_symlink: true,
            ..Self::new(relative_path, size_bytes, modified_time)
        }
    }

    /// Builds an entry from filesystem metadata.
    pub(crate) fn from_metadata(relative_path: String, metadata: &Metadata, is_symlink: bool) -> Self {
        let modified_time = metadata.modified().map_or(0, epoch_nanos);
        Self {
            relative_path,
            size_bytes: metadata.len(),
            modified_time,
            is_symlink,
        }
    }

    /// Returns the final extension including the leading dot, if any.
    ///
    /// Dotfiles such as `.gitignore` have no extension.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.relative_path)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
    }

    /// Returns the extension label used for statistics.
    #[must_use]
    pub fn extension_label(&self) -> String {
        self.extension().unwrap_or_else(|| NO_EXTENSION.to_string())
    }
}

/// Converts a timestamp into signed nanoseconds since the Unix epoch.
pub(crate) fn epoch_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos()).map_or(i64::MIN, |n| -n),
    }
}

/// What happened to a single file during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// Flattened copy written to the given path
    Written(PathBuf),
    /// Larger than the configured maximum file size
    SkippedTooLarge,
    /// Symbolic link while links are not followed
    SkippedSymlink,
    /// Refused by a path containment check
    SkippedSecurity(String),
    /// Content could not be read as text
    SkippedUnreadable(String),
    /// Any other filesystem failure
    SkippedIoError(String),
}

impl ProcessOutcome {
    /// Returns the category of this outcome.
    #[must_use]
    pub const fn category(&self) -> OutcomeCategory {
        match self {
            Self::Written(_) => OutcomeCategory::Written,
            Self::SkippedTooLarge => OutcomeCategory::TooLarge,
            Self::SkippedSymlink => OutcomeCategory::Symlink,
            Self::SkippedSecurity(_) => OutcomeCategory::Security,
            Self::SkippedUnreadable(_) => OutcomeCategory::Unreadable,
            Self::SkippedIoError(_) => OutcomeCategory::IoError,
        }
    }

    /// Returns true if a flattened file was written.
    #[must_use]
    pub const fn is_written(&self) -> bool {
        matches!(self, Self::Written(_))
    }

    /// Returns the written output path, if any.
    #[must_use]
    pub fn output_path(&self) -> Option<&Path> {
        match self {
            Self::Written(path) => Some(path),
            _ => None,
        }
    }

    /// Returns the captured reason for skips that carry one.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::SkippedSecurity(reason)
            | Self::SkippedUnreadable(reason)
            | Self::SkippedIoError(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Outcome categories used for counting and manifest annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeCategory {
    /// Flattened copy written
    Written,
    /// Over the size limit
    TooLarge,
    /// Unfollowed symbolic link
    Symlink,
    /// Refused by a containment check
    Security,
    /// Not readable as text
    Unreadable,
    /// Other filesystem failure
    IoError,
}

impl OutcomeCategory {
    /// Short label used in the manifest.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Written => "written",
            Self::TooLarge => "too large",
            Self::Symlink => "symlink",
            Self::Security => "security",
            Self::Unreadable => "unreadable",
            Self::IoError => "io error",
        }
    }
}

/// A scanned entry paired with its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEntry {
    /// The scanned file
    pub entry: FileEntry,
    /// What happened to it
    pub outcome: ProcessOutcome,
}

impl ProcessedEntry {
    /// Pairs an entry with its outcome.
    #[must_use]
    pub const fn new(entry: FileEntry, outcome: ProcessOutcome) -> Self {
        Self { entry, outcome }
    }
}
