use crate::security::SecurityViolation;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Run-level errors of the repo-flattener library.
///
/// Per-file problems never show up here: they are recorded as
/// [`ProcessOutcome`](crate::ProcessOutcome) values and the run continues.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Repository root is missing, not a directory or unreadable.
    #[error("Invalid repository '{path}': {reason}")]
    InvalidRepository {
        /// Path given as the repository root
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// Output directory cannot be created or written.
    #[error("Cannot use output directory '{path}': {message}")]
    OutputDirectory {
        /// Output directory path
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// More candidate files than the configured limit.
    #[error("Found {found} files, which exceeds the limit of {limit} files")]
    ResourceLimitExceeded {
        /// Number of candidate files found
        found: usize,
        /// Configured maximum
        limit: usize,
    },

    /// IO error with context about the file path.
    #[error("IO error accessing '{path}': {message}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration: {message}")]
    Config {
        /// Detailed error message
        message: String,
    },

    /// A selector returned a path that was not offered to it.
    #[error("Selected path '{path}' is not part of the scanned file list")]
    InvalidSelection {
        /// The unexpected path
        path: String,
    },

    /// A selector returned no paths at all.
    #[error("No files selected")]
    NoFilesSelected,

    /// Path containment check failed outside of per-file processing.
    #[error(transparent)]
    Security(#[from] SecurityViolation),

    /// JSON serialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
    },
}

impl Error {
    /// Creates an IO error with path context.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: source.to_string(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid repository error.
    #[must_use]
    pub fn invalid_repository(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidRepository {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an output directory error from the underlying IO failure.
    #[must_use]
    pub fn output_directory(path: impl Into<PathBuf>, source: &std::io::Error) -> Self {
        Self::OutputDirectory {
            path: path.into(),
            message: source.to_string(),
        }
    }

    /// Creates a resource limit error.
    #[must_use]
    pub const fn resource_limit(found: usize, limit: usize) -> Self {
        Self::ResourceLimitExceeded { found, limit }
    }

    /// Creates an invalid selection error.
    #[must_use]
    pub fn invalid_selection(path: impl Into<String>) -> Self {
        Self::InvalidSelection { path: path.into() }
    }

    /// Returns true if this is an IO error.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Returns true if the repository root was rejected.
    #[must_use]
    pub const fn is_invalid_repository(&self) -> bool {
        matches!(self, Self::InvalidRepository { .. })
    }

    /// Returns true if the candidate file limit was exceeded.
    #[must_use]
    pub const fn is_resource_limit(&self) -> bool {
        matches!(self, Self::ResourceLimitExceeded { .. })
    }

    /// Returns true if the output directory could not be used.
    #[must_use]
    pub const fn is_output_directory(&self) -> bool {
        matches!(self, Self::OutputDirectory { .. })
    }

    /// A short hint for the user on how to fix the error, if there is one.
    #[must_use]
    pub fn tip(&self) -> Option<&'static str> {
        match self {
            Self::InvalidRepository { reason, .. } => Some(if reason.contains("does not exist") {
                "Make sure the path exists and is spelled correctly"
            } else if reason.contains("not a directory") {
                "The path should point to a directory, not a file"
            } else {
                "Verify the repository path and your access permissions"
            }),
            Self::OutputDirectory { .. } => {
                Some("Ensure you have write permissions for the parent directory")
            }
            Self::ResourceLimitExceeded { .. } => Some(
                "Use --max-files to increase the limit or filter files with --ignore-dirs",
            ),
            Self::Security(violation) if violation.is_symlink() => {
                Some("Use --follow-symlinks to process symbolic links")
            }
            Self::Security(_) => Some("File paths must remain within the output directory"),
            Self::InvalidSelection { .. } | Self::NoFilesSelected => {
                Some("Select at least one file from the scanned list")
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}
