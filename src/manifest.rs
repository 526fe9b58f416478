use crate::file::{OutcomeCategory, ProcessOutcome, ProcessedEntry};
use crate::security;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const MANIFEST_HEADER: &str = "Repository structure:\n\n";
const INDENT: &str = "    ";
const BYTES_PER_TOKEN: u64 = 4;

/// Rough token count for `bytes` of text.
///
/// A size heuristic, not a tokenizer.
#[must_use]
pub const fn estimate_tokens(bytes: u64) -> u64 {
    bytes / BYTES_PER_TOKEN
}

/// Ordered listing of a run's candidates and their outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Repository the listing describes
    pub repository_root: PathBuf,
    /// When the outcomes were produced
    pub generated_at: DateTime<Utc>,
    /// Entries in scan order
    pub entries: Vec<ProcessedEntry>,
}

impl Manifest {
    /// Renders the manifest as an indented tree.
    ///
    /// The text carries no timestamp, so identical outcomes render to
    /// identical bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use repo_flattener::{FileEntry, Manifest, ProcessOutcome, ProcessedEntry};
    ///
    /// let manifest = Manifest {
    ///     repository_root: "/repo".into(),
    ///     generated_at: chrono::Utc::now(),
    ///     entries: vec![
    ///         ProcessedEntry::new(
    ///             FileEntry::new("a/b.py", 10, 0),
    ///             ProcessOutcome::Written("/out/a_b.py".into()),
    ///         ),
    ///         ProcessedEntry::new(FileEntry::symlink("d", 0, 0), ProcessOutcome::SkippedSymlink),
    ///     ],
    /// };
    ///
    /// assert_eq!(
    ///     manifest.render(),
    ///     "Repository structure:\n\na\n    b.py\nd  [skipped: symlink]\n\n2 files: 1 written, 1 skipped\n"
    /// );
    /// ```
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from(MANIFEST_HEADER);
        let mut open: Vec<&str> = Vec::new();
        let mut written = 0;

        for processed in &self.entries {
            let path = processed.entry.relative_path.as_str();
            let parts: Vec<&str> = if security::normalize_relative(path).is_ok() {
                path.split('/').collect()
            } else {
                vec![path]
            };
            let (name, dirs) = parts.split_last().map_or((path, &[][..]), |(n, d)| (*n, d));

            let shared = open
                .iter()
                .zip(dirs)
                .take_while(|(a, b)| a == b)
                .count();
            open.truncate(shared);
            for dir in &dirs[shared..] {
                let _ = writeln!(out, "{}{}", INDENT.repeat(open.len()), dir);
                open.push(*dir);
            }

            let _ = write!(out, "{}{}", INDENT.repeat(dirs.len()), name);
            match processed.outcome.category() {
                OutcomeCategory::Written => written += 1,
                category => {
                    let _ = write!(out, "  [skipped: {}]", category.label());
                }
            }
            out.push('\n');
        }

        let total = self.entries.len();
        let _ = write!(
            out,
            "\n{} files: {} written, {} skipped\n",
            total,
            written,
            total - written
        );
        out
    }
}

/// Count and bytes of written files sharing an extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtensionStats {
    /// Number of files
    pub count: usize,
    /// Total size in bytes
    pub bytes: u64,
}

/// Totals for a run.
///
/// `written + skipped()` always equals `total_files`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Number of candidate files
    pub total_files: usize,
    /// Files flattened
    pub written: usize,
    /// Files over the size limit
    pub skipped_too_large: usize,
    /// Unfollowed symbolic links
    pub skipped_symlink: usize,
    /// Files refused by a containment check
    pub skipped_security: usize,
    /// Files not readable as text
    pub skipped_unreadable: usize,
    /// Files hit by other filesystem errors
    pub skipped_io_error: usize,
    /// Bytes of written files
    pub total_size: u64,
    /// Written files per extension
    pub by_extension: BTreeMap<String, ExtensionStats>,
    /// Token estimate for `total_size`
    pub estimated_tokens: u64,
}

impl RunSummary {
    /// Aggregates outcomes into totals.
    #[must_use]
    pub fn from_entries(entries: &[ProcessedEntry]) -> Self {
        let mut summary = Self {
            total_files: entries.len(),
            ..Self::default()
        };

        for processed in entries {
            match &processed.outcome {
                ProcessOutcome::Written(_) => {
                    summary.written += 1;
                    summary.total_size += processed.entry.size_bytes;
                    let stats = summary
                        .by_extension
                        .entry(processed.entry.extension_label())
                        .or_default();
                    stats.count += 1;
                    stats.bytes += processed.entry.size_bytes;
                }
                ProcessOutcome::SkippedTooLarge => summary.skipped_too_large += 1,
                ProcessOutcome::SkippedSymlink => summary.skipped_symlink += 1,
                ProcessOutcome::SkippedSecurity(_) => summary.skipped_security += 1,
                ProcessOutcome::SkippedUnreadable(_) => summary.skipped_unreadable += 1,
                ProcessOutcome::SkippedIoError(_) => summary.skipped_io_error += 1,
            }
        }

        summary.estimated_tokens = estimate_tokens(summary.total_size);
        summary
    }

    /// Sum of all skip counters.
    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.skipped_too_large
            + self.skipped_symlink
            + self.skipped_security
            + self.skipped_unreadable
            + self.skipped_io_error
    }
}

/// Pure aggregation of outcomes into a [`Manifest`] and [`RunSummary`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestBuilder;

impl ManifestBuilder {
    /// Builds the manifest and summary, stamped with the current time.
    #[must_use]
    pub fn build(root: &Path, entries: Vec<ProcessedEntry>) -> (Manifest, RunSummary) {
        Self::build_at(root, entries, Utc::now())
    }

    /// Builds the manifest and summary with an explicit timestamp.
    #[must_use]
    pub fn build_at(
        root: &Path,
        entries: Vec<ProcessedEntry>,
        generated_at: DateTime<Utc>,
    ) -> (Manifest, RunSummary) {
        let summary = RunSummary::from_entries(&entries);
        let manifest = Manifest {
            repository_root: root.to_path_buf(),
            generated_at,
            entries,
        };
        (manifest, summary)
    }
}
