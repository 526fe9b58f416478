use crate::{
    config::Config,
    error::{Error, Result},
    file::{FileEntry, ProcessOutcome},
    security::{self, SecurityViolation},
};
use std::{
    collections::HashSet,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Name of the manifest written next to the flattened files.
pub const MANIFEST_FILE_NAME: &str = "file_manifest.txt";

/// Characters replaced in flattened names.
const SUBSTITUTED: &[char] = &['/', '\\', '*', '?', ':', '"', '<', '>', '|'];
const SUBSTITUTE: char = '_';

/// Returns the flattened file name for a relative path, before collision
/// handling.
///
/// # Examples
///
/// ```
/// use repo_flattener::flatten_name;
///
/// assert_eq!(flatten_name("src/utils/mod.rs"), "src_utils_mod.rs");
/// ```
#[must_use]
pub fn flatten_name(relative_path: &str) -> String {
    relative_path
        .chars()
        .map(|c| if SUBSTITUTED.contains(&c) { SUBSTITUTE } else { c })
        .collect()
}

/// Assigns unique output names in scan order.
///
/// The first entry keeps its flattened name. A later entry whose name is
/// already taken (compared case-insensitively) gets `__N` inserted before
/// its final extension, with `N` counting up from 2 until the name is free.
#[derive(Debug)]
pub(crate) struct OutputNamer {
    taken: HashSet<String>,
}

impl OutputNamer {
    pub(crate) fn new() -> Self {
        let mut taken = HashSet::new();
        taken.insert(MANIFEST_FILE_NAME.to_lowercase());
        Self { taken }
    }

    /// Returns the output name for the next entry in scan order.
    pub(crate) fn assign(&mut self, relative_path: &str) -> String {
        let base = flatten_name(relative_path);
        if self.taken.insert(base.to_lowercase()) {
            return base;
        }

        let (stem, ext) = match base.rfind('.') {
            Some(dot) if dot > 0 => base.split_at(dot),
            _ => (base.as_str(), ""),
        };
        let mut n = 2;
        loop {
            let candidate = format!("{stem}__{n}{ext}");
            if self.taken.insert(candidate.to_lowercase()) {
                debug!("Output name {} taken, using {} for {}", base, candidate, relative_path);
                return candidate;
            }
            n += 1;
        }
    }
}

/// Performs the per-file transform.
#[derive(Debug, Clone)]
pub(crate) struct Writer {
    root_dir: PathBuf,
    output_dir: PathBuf,
    max_file_size: u64,
    follow_symlinks: bool,
}

impl Writer {
    /// Creates a writer for a canonical `root_dir`.
    pub(crate) fn new(config: &Config, root_dir: PathBuf) -> Self {
        Self {
            root_dir,
            output_dir: config.output_dir.clone(),
            max_file_size: config.max_file_size,
            follow_symlinks: config.follow_symlinks,
        }
    }

    /// Points the writer at a prepared output directory.
    pub(crate) fn with_output_dir(mut self, output_dir: PathBuf) -> Self {
        self.output_dir = output_dir;
        self
    }

    fn exceeds_limit(&self, entry: &FileEntry) -> bool {
        self.max_file_size > 0 && entry.size_bytes > self.max_file_size
    }

    /// Reads, transforms and writes one file. Never fails: every problem
    /// becomes a skip outcome.
    pub(crate) fn process(&self, entry: &FileEntry, output_name: &str) -> ProcessOutcome {
        let outcome = self.try_process(entry, output_name);
        match &outcome {
            ProcessOutcome::Written(path) => {
                debug!("Wrote {} -> {}", entry.relative_path, path.display());
            }
            ProcessOutcome::SkippedTooLarge => debug!(
                "Skipping {} ({} bytes exceeds {})",
                entry.relative_path, entry.size_bytes, self.max_file_size
            ),
            ProcessOutcome::SkippedSymlink => {
                debug!("Skipping symbolic link {}", entry.relative_path);
            }
            other => warn!(
                "Skipping {}: {}",
                entry.relative_path,
                other.reason().unwrap_or_default()
            ),
        }
        outcome
    }

    fn try_process(&self, entry: &FileEntry, output_name: &str) -> ProcessOutcome {
        if entry.is_symlink {
            return ProcessOutcome::SkippedSymlink;
        }

        let relative = match security::normalize_relative(&entry.relative_path) {
            Ok(relative) => relative,
            Err(violation) => return ProcessOutcome::SkippedSecurity(violation.to_string()),
        };
        let source = self.root_dir.join(&relative);
        match security::validate_input_entry(&self.root_dir, &source, self.follow_symlinks) {
            Ok(()) => {}
            Err(SecurityViolation::SymlinkNotAllowed { .. }) => {
                return ProcessOutcome::SkippedSymlink;
            }
            Err(violation) => return ProcessOutcome::SkippedSecurity(violation.to_string()),
        }

        if self.exceeds_limit(entry) {
            return ProcessOutcome::SkippedTooLarge;
        }

        let target = match security::validate_output_path(&self.output_dir, output_name) {
            Ok(target) => target,
            Err(violation) => return ProcessOutcome::SkippedSecurity(violation.to_string()),
        };

        let content = match read_text(&source) {
            Ok(content) => content,
            Err(outcome) => return outcome,
        };

        let header = format!("// FILE: {relative}\n\n");
        match write_atomic(&self.output_dir, &target, &[header.as_bytes(), content.as_bytes()]) {
            Ok(()) => ProcessOutcome::Written(target),
            Err(e) => ProcessOutcome::SkippedIoError(format!("write failed: {e}")),
        }
    }

    /// Predicts the outcome of [`Writer::process`] without reading content
    /// or writing anything. Link metadata is consulted, so containment
    /// decisions match a real run.
    pub(crate) fn plan(&self, entry: &FileEntry, output_name: &str) -> ProcessOutcome {
        if entry.is_symlink {
            return ProcessOutcome::SkippedSymlink;
        }
        let relative = match security::normalize_relative(&entry.relative_path) {
            Ok(relative) => relative,
            Err(violation) => return ProcessOutcome::SkippedSecurity(violation.to_string()),
        };
        let source = self.root_dir.join(&relative);
        match security::validate_input_entry(&self.root_dir, &source, self.follow_symlinks) {
            Ok(()) => {}
            Err(SecurityViolation::SymlinkNotAllowed { .. }) => {
                return ProcessOutcome::SkippedSymlink;
            }
            Err(violation) => return ProcessOutcome::SkippedSecurity(violation.to_string()),
        }
        if self.exceeds_limit(entry) {
            return ProcessOutcome::SkippedTooLarge;
        }
        ProcessOutcome::Written(self.output_dir.join(output_name))
    }
}

/// Reads a file as UTF-8 text, mapping failures to skip outcomes.
fn read_text(path: &Path) -> std::result::Result<String, ProcessOutcome> {
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::PermissionDenied => ProcessOutcome::SkippedUnreadable(e.to_string()),
        _ => ProcessOutcome::SkippedIoError(format!("read failed: {e}")),
    })?;
    String::from_utf8(bytes).map_err(|e| {
        ProcessOutcome::SkippedUnreadable(format!("invalid UTF-8: {}", e.utf8_error()))
    })
}

/// Writes `parts` to `target` through a temporary file in `dir`, so readers
/// never see a partial file.
fn write_atomic(dir: &Path, target: &Path, parts: &[&[u8]]) -> io::Result<()> {
    let mut temp = NamedTempFile::new_in(dir)?;
    for part in parts {
        temp.write_all(part)?;
    }
    temp.flush()?;
    temp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Creates the output directory and checks it is writable.
///
/// Returns the canonical path of the directory.
///
/// # Errors
///
/// Returns [`Error::OutputDirectory`] if it cannot be created or written.
pub(crate) fn prepare_output_dir(output_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(output_dir).map_err(|e| Error::output_directory(output_dir, &e))?;
    NamedTempFile::new_in(output_dir).map_err(|e| Error::output_directory(output_dir, &e))?;
    fs::canonicalize(output_dir).map_err(|e| Error::output_directory(output_dir, &e))
}

/// Deletes regular files directly inside `output_dir` that are neither in
/// `keep` nor the manifest, so the directory holds exactly one run's output.
///
/// Subdirectories are left alone; flattened outputs never create them.
/// Returns the number of files removed.
pub(crate) fn remove_stale_outputs(output_dir: &Path, keep: &HashSet<PathBuf>) -> usize {
    let listing = match fs::read_dir(output_dir) {
        Ok(listing) => listing,
        Err(e) => {
            warn!("Cannot list output directory {}: {}", output_dir.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in listing.flatten() {
        let is_file = entry.file_type().is_ok_and(|ft| ft.is_file());
        if !is_file || entry.file_name() == MANIFEST_FILE_NAME {
            continue;
        }
        let path = entry.path();
        if keep.contains(&path) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed stale output {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove stale output {}: {}", path.display(), e),
        }
    }
    removed
}

/// Writes the manifest text into `output_dir`, unless the file already holds
/// exactly that text.
///
/// # Errors
///
/// Returns an IO error if the manifest cannot be written.
pub(crate) fn write_manifest(output_dir: &Path, text: &str) -> Result<PathBuf> {
    let path = security::validate_output_path(output_dir, MANIFEST_FILE_NAME)?;
    if fs::read_to_string(&path).is_ok_and(|existing| existing == text) {
        debug!("Manifest {} is up to date", path.display());
        return Ok(path);
    }
    write_atomic(output_dir, &path, &[text.as_bytes()]).map_err(|e| Error::io(&path, e))?;
    Ok(path)
}
