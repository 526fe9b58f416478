use crate::{
    config::{resolve_path, Config},
    error::{Error, Result},
    file::FileEntry,
    security,
};
use crossbeam_channel::unbounded;
use ignore::{DirEntry, WalkBuilder, WalkState};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Walks the repository and produces the ordered candidate list.
pub(crate) struct Scanner {
    root_dir: PathBuf,
    output_dir: PathBuf,
    ignore_dirs: Arc<HashSet<String>>,
    ignore_exts: Arc<Vec<String>>,
    follow_symlinks: bool,
    max_files: usize,
}

impl Scanner {
    /// Creates a new scanner from configuration.
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            root_dir: config.root_dir.clone(),
            output_dir: resolve_path(&config.output_dir),
            ignore_dirs: Arc::new(config.ignore_dirs.iter().cloned().collect()),
            ignore_exts: Arc::new(config.ignore_exts.clone()),
            follow_symlinks: config.follow_symlinks,
            max_files: config.max_files,
        }
    }

    /// Scans the root directory and returns all candidate files in scan order.
    ///
    /// Scan order is the lexicographic order of `relative_path`, which keeps
    /// the entries of one directory contiguous.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The root is missing, not a directory or unreadable
    /// - More candidates than `max_files` were found
    pub(crate) fn scan(&self) -> Result<Vec<FileEntry>> {
        let root = validate_root(&self.root_dir)?;
        debug!("Starting parallel scan of {}", root.display());

        let mut builder = WalkBuilder::new(&root);
        builder
            .standard_filters(false)
            .follow_links(self.follow_symlinks)
            .skip_stdout(true)
            .threads(num_cpus::get());

        let ignore_dirs = Arc::clone(&self.ignore_dirs);
        let output_dir = self.output_dir.clone();
        builder.filter_entry(move |entry| !is_pruned(entry, &ignore_dirs, &output_dir));

        let (tx, rx) = unbounded();
        builder.build_parallel().run(|| {
            let tx = tx.clone();
            let root = root.clone();
            let ignore_exts = Arc::clone(&self.ignore_exts);
            let follow_symlinks = self.follow_symlinks;

            Box::new(move |result| {
                let entry = match result {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Walk error: {}", e);
                        return WalkState::Continue;
                    }
                };
                if entry.depth() == 0 {
                    return WalkState::Continue;
                }

                let (candidate, state) = visit(&entry, &root, &ignore_exts, follow_symlinks);
                if let Some(candidate) = candidate {
                    if tx.send(candidate).is_err() {
                        return WalkState::Quit;
                    }
                }
                state
            })
        });
        drop(tx);

        let mut entries: Vec<FileEntry> = rx.into_iter().collect();
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        if self.max_files > 0 && entries.len() > self.max_files {
            return Err(Error::resource_limit(entries.len(), self.max_files));
        }

        debug!("Scan complete: {} candidate files", entries.len());
        Ok(entries)
    }

    /// Builds entries for a caller-supplied list of relative paths.
    ///
    /// Paths are normalized, deduplicated and sorted. Ignore rules and the
    /// file limit do not apply. A path that fails normalization is kept in
    /// its raw form so processing can report it, and a path whose metadata
    /// cannot be read gets size and mtime 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the root is invalid.
    pub(crate) fn entries_for(&self, paths: &[String]) -> Result<Vec<FileEntry>> {
        let root = validate_root(&self.root_dir)?;

        let unique: BTreeMap<String, ()> = paths
            .iter()
            .map(|raw| (security::normalize_relative(raw).unwrap_or_else(|_| raw.clone()), ()))
            .collect();

        let entries = unique
            .into_keys()
            .map(|relative_path| self.listed_entry(&root, relative_path))
            .collect::<Vec<_>>();

        debug!("Prepared {} explicitly listed files", entries.len());
        Ok(entries)
    }

    fn listed_entry(&self, root: &Path, relative_path: String) -> FileEntry {
        if security::normalize_relative(&relative_path).is_err() {
            return FileEntry::new(relative_path, 0, 0);
        }
        let path = root.join(&relative_path);
        let Ok(link_meta) = fs::symlink_metadata(&path) else {
            debug!("No metadata for listed file {}", relative_path);
            return FileEntry::new(relative_path, 0, 0);
        };

        let is_link = link_meta.file_type().is_symlink();
        if is_link && !self.follow_symlinks {
            return FileEntry::from_metadata(relative_path, &link_meta, true);
        }
        match fs::metadata(&path) {
            Ok(meta) => FileEntry::from_metadata(relative_path, &meta, false),
            Err(_) => FileEntry::from_metadata(relative_path, &link_meta, false),
        }
    }
}

/// Checks that `root` is an existing, readable directory and returns its
/// canonical form.
///
/// # Errors
///
/// Returns [`Error::InvalidRepository`] describing what is wrong.
pub(crate) fn validate_root(root: &Path) -> Result<PathBuf> {
    let metadata = fs::metadata(root)
        .map_err(|_| Error::invalid_repository(root, "path does not exist"))?;
    if !metadata.is_dir() {
        return Err(Error::invalid_repository(root, "path is not a directory"));
    }
    fs::read_dir(root).map_err(|e| {
        Error::invalid_repository(root, format!("directory is not readable: {e}"))
    })?;
    fs::canonicalize(root).map_err(|e| Error::invalid_repository(root, e.to_string()))
}

/// Returns true if a directory should not be descended into.
fn is_pruned(entry: &DirEntry, ignore_dirs: &HashSet<String>, output_dir: &Path) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_some_and(|ft| ft.is_dir()) {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    if ignore_dirs.contains(name.as_ref()) {
        trace!("Pruning ignored directory {}", entry.path().display());
        return true;
    }
    if entry.path() == output_dir {
        trace!("Pruning output directory {}", entry.path().display());
        return true;
    }
    false
}

/// Turns one walk entry into a candidate, if it is one.
fn visit(
    entry: &DirEntry,
    root: &Path,
    ignore_exts: &[String],
    follow_symlinks: bool,
) -> (Option<FileEntry>, WalkState) {
    let path = entry.path();
    let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());

    if entry.path_is_symlink() {
        if !follow_symlinks {
            return (link_candidate(entry, root, ignore_exts), WalkState::Continue);
        }
        if let Err(violation) = security::validate_input_entry(root, path, true) {
            // Surfaced so processing can report it; never descended into.
            debug!("{}", violation);
            let state = if is_dir { WalkState::Skip } else { WalkState::Continue };
            let candidate = link_candidate(entry, root, ignore_exts).map(|e| FileEntry {
                is_symlink: false,
                ..e
            });
            return (candidate, state);
        }
    }

    if is_dir || !entry.file_type().is_some_and(|ft| ft.is_file()) {
        return (None, WalkState::Continue);
    }

    let name = entry.file_name().to_string_lossy();
    if has_ignored_extension(&name, ignore_exts) {
        trace!("Skipping ignored extension: {}", path.display());
        return (None, WalkState::Continue);
    }

    let Some(relative_path) = relative_slash_path(path, root) else {
        warn!("Cannot compute relative path for {}", path.display());
        return (None, WalkState::Continue);
    };

    match entry.metadata() {
        Ok(metadata) => (
            Some(FileEntry::from_metadata(relative_path, &metadata, false)),
            WalkState::Continue,
        ),
        Err(e) => {
            warn!("Failed to read metadata for {}: {}", path.display(), e);
            (Some(FileEntry::new(relative_path, 0, 0)), WalkState::Continue)
        }
    }
}

/// Builds an entry for the link itself from `lstat` data.
fn link_candidate(entry: &DirEntry, root: &Path, ignore_exts: &[String]) -> Option<FileEntry> {
    let path = entry.path();
    let name = entry.file_name().to_string_lossy();
    if has_ignored_extension(&name, ignore_exts) {
        return None;
    }
    let relative_path = relative_slash_path(path, root)?;
    match fs::symlink_metadata(path) {
        Ok(metadata) => Some(FileEntry::from_metadata(relative_path, &metadata, true)),
        Err(e) => {
            warn!("Failed to read link metadata for {}: {}", path.display(), e);
            Some(FileEntry::symlink(relative_path, 0, 0))
        }
    }
}

fn has_ignored_extension(file_name: &str, ignore_exts: &[String]) -> bool {
    ignore_exts
        .iter()
        .any(|ext| file_name.len() > ext.len() && file_name.ends_with(ext.as_str()))
}

/// Computes the slash-separated path of `path` relative to `root`.
pub(crate) fn relative_slash_path(path: &Path, root: &Path) -> Option<String> {
    let relative = pathdiff::diff_paths(path, root)?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    fn create_test_config(temp: &assert_fs::TempDir) -> Config {
        Config::builder()
            .root_dir(temp.path())
            .output_dir(temp.path().join("out"))
            .use_cache(false)
            .build()
            .unwrap()
    }

    fn paths(entries: &[FileEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.relative_path.as_str()).collect()
    }

    #[test]
    fn test_scanner_finds_files() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("file1.rs").write_str("fn main() {}").unwrap();
        temp.child("file2.rs").write_str("pub fn test() {}").unwrap();

        let scanner = Scanner::new(&create_test_config(&temp));
        let files = scanner.scan().unwrap();

        assert_eq!(paths(&files), vec!["file1.rs", "file2.rs"]);
        assert_eq!(files[0].size_bytes, 12);
    }

    #[test]
    fn test_scanner_nested_directories_sorted() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("src/main.rs").write_str("fn main() {}").unwrap();
        temp.child("src/lib.rs").write_str("pub fn test() {}").unwrap();
        temp.child("tests/test.rs").write_str("#[test]\nfn test() {}").unwrap();
        temp.child("src.txt").write_str("x").unwrap();

        let scanner = Scanner::new(&create_test_config(&temp));
        let files = scanner.scan().unwrap();

        assert_eq!(
            paths(&files),
            vec!["src.txt", "src/lib.rs", "src/main.rs", "tests/test.rs"]
        );
    }

    #[test]
    fn test_scanner_empty_directory() {
        let temp = assert_fs::TempDir::new().unwrap();

        let scanner = Scanner::new(&create_test_config(&temp));
        assert!(scanner.scan().unwrap().is_empty());
    }

    #[test]
    fn test_scanner_prunes_ignored_dirs_at_any_depth() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child(".git/config").write_str("[core]").unwrap();
        temp.child("a/node_modules/x.js").write_str("x").unwrap();
        temp.child("a/b/__pycache__/m.cpython.pyc").write_str("x").unwrap();
        temp.child("a/keep.js").write_str("x").unwrap();
        temp.child("a/.gitkeep").write_str("").unwrap();

        let scanner = Scanner::new(&create_test_config(&temp));
        let files = scanner.scan().unwrap();

        assert_eq!(paths(&files), vec!["a/.gitkeep", "a/keep.js"]);
    }

    #[test]
    fn test_scanner_ignores_gitignore_files() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child(".gitignore").write_str("ignored.rs\n").unwrap();
        temp.child("included.rs").write_str("fn main() {}").unwrap();
        temp.child("ignored.rs").write_str("fn test() {}").unwrap();

        let scanner = Scanner::new(&create_test_config(&temp));
        let files = scanner.scan().unwrap();

        assert_eq!(files.len(), 3);
    }

    #[test]
    fn test_scanner_excludes_extensions() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("c.log").write_str("log").unwrap();
        temp.child("app.jar").write_str("jar").unwrap();
        temp.child("main.py").write_str("print()").unwrap();
        temp.child("archive.tar.gz").write_str("gz").unwrap();

        let config = Config::builder()
            .root_dir(temp.path())
            .output_dir(temp.path().join("out"))
            .ignore_exts([".log", ".tar.gz"])
            .use_cache(false)
            .build()
            .unwrap();
        let files = Scanner::new(&config).scan().unwrap();

        assert_eq!(paths(&files), vec!["main.py"]);
    }

    #[test]
    fn test_scanner_skips_output_dir_inside_root() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("main.rs").write_str("fn main() {}").unwrap();
        temp.child("out/main.rs").write_str("// FILE: main.rs").unwrap();

        let files = Scanner::new(&create_test_config(&temp)).scan().unwrap();
        assert_eq!(paths(&files), vec!["main.rs"]);
    }

    #[test]
    fn test_scanner_max_files_limit() {
        let temp = assert_fs::TempDir::new().unwrap();
        for i in 0..5 {
            temp.child(format!("f{i}.txt")).write_str("x").unwrap();
        }

        let config = Config::builder()
            .root_dir(temp.path())
            .output_dir(temp.path().join("out"))
            .max_files(4)
            .use_cache(false)
            .build()
            .unwrap();
        let err = Scanner::new(&config).scan().unwrap_err();
        assert!(matches!(
            err,
            Error::ResourceLimitExceeded { found: 5, limit: 4 }
        ));

        let exact = Config::builder()
            .root_dir(temp.path())
            .output_dir(temp.path().join("out"))
            .max_files(5)
            .use_cache(false)
            .build()
            .unwrap();
        assert_eq!(Scanner::new(&exact).scan().unwrap().len(), 5);
    }

    #[test]
    fn test_validate_root_errors() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("file.txt").write_str("x").unwrap();

        let missing = validate_root(&temp.path().join("nope")).unwrap_err();
        assert!(missing.to_string().contains("does not exist"));

        let file = validate_root(&temp.path().join("file.txt")).unwrap_err();
        assert!(file.to_string().contains("not a directory"));
    }

    #[cfg(unix)]
    #[test]
    fn test_scanner_surfaces_symlinks_when_not_following() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("real/data.txt").write_str("data").unwrap();
        std::os::unix::fs::symlink("/etc/passwd", temp.path().join("d")).unwrap();
        std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("alias")).unwrap();

        let files = Scanner::new(&create_test_config(&temp)).scan().unwrap();

        assert_eq!(paths(&files), vec!["alias", "d", "real/data.txt"]);
        assert!(files[0].is_symlink);
        assert!(files[1].is_symlink);
        assert!(!files[2].is_symlink);
    }

    #[cfg(unix)]
    #[test]
    fn test_scanner_follows_internal_links_and_surfaces_escapes() {
        let temp = assert_fs::TempDir::new().unwrap();
        let outside = assert_fs::TempDir::new().unwrap();
        outside.child("secret/key.txt").write_str("secret").unwrap();
        temp.child("real.txt").write_str("data").unwrap();
        std::os::unix::fs::symlink(temp.path().join("real.txt"), temp.path().join("inner.txt"))
            .unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), temp.path().join("leak"))
            .unwrap();

        let config = Config::builder()
            .root_dir(temp.path())
            .output_dir(temp.path().join("out"))
            .follow_symlinks(true)
            .use_cache(false)
            .build()
            .unwrap();
        let files = Scanner::new(&config).scan().unwrap();

        assert_eq!(paths(&files), vec!["inner.txt", "leak", "real.txt"]);
        assert!(files.iter().all(|f| !f.is_symlink));
        assert_eq!(files[0].size_bytes, 4);
    }

    #[test]
    fn test_entries_for_normalizes_and_dedupes() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("src/lib.rs").write_str("pub fn a() {}").unwrap();

        let scanner = Scanner::new(&create_test_config(&temp));
        let entries = scanner
            .entries_for(&[
                "src/lib.rs".to_string(),
                "./src\\lib.rs".to_string(),
                "missing.rs".to_string(),
                "../etc/passwd".to_string(),
            ])
            .unwrap();

        assert_eq!(paths(&entries), vec!["../etc/passwd", "missing.rs", "src/lib.rs"]);
        assert_eq!(entries[1].size_bytes, 0);
        assert_eq!(entries[2].size_bytes, 13);
    }

    #[test]
    fn test_relative_slash_path() {
        let root = Path::new("/repo");
        assert_eq!(
            relative_slash_path(Path::new("/repo/a/b.py"), root).as_deref(),
            Some("a/b.py")
        );
        assert_eq!(relative_slash_path(Path::new("/repo"), root), None);
    }
}
