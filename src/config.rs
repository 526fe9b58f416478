use crate::error::{Error, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

const DEFAULT_OUTPUT_DIR: &str = "flattened_repo";
const FALLBACK_CACHE_DIR: &str = ".repo-flattener-cache";
const MAX_AUTO_WORKERS: usize = 32;
const AUTO_WORKER_HEADROOM: usize = 4;

/// Directory names that are never descended into.
pub const DEFAULT_IGNORE_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".idea",
    ".vscode",
    "venv",
    "env",
    ".env",
];

/// File extensions that are never flattened.
pub const DEFAULT_IGNORE_EXTS: &[&str] = &[
    ".pyc", ".class", ".o", ".so", ".dll", ".exe", ".jar", ".war",
];

/// How many workers process files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// `min(32, cpus + 4)` workers
    #[default]
    Auto,
    /// Everything on the calling thread
    Sequential,
    /// A fixed number of workers
    Fixed(usize),
}

impl Concurrency {
    /// Returns the number of workers this setting resolves to.
    #[must_use]
    pub fn effective_workers(self) -> usize {
        match self {
            Self::Auto => (num_cpus::get() + AUTO_WORKER_HEADROOM).min(MAX_AUTO_WORKERS),
            Self::Sequential => 1,
            Self::Fixed(n) => n.max(1),
        }
    }
}

impl From<usize> for Concurrency {
    fn from(n: usize) -> Self {
        match n {
            0 => Self::Auto,
            1 => Self::Sequential,
            n => Self::Fixed(n),
        }
    }
}

/// Configuration for a flattening run.
///
/// Use [`Config::builder()`] to construct a new configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Repository root to flatten
    pub root_dir: PathBuf,

    /// Directory receiving the flattened files and the manifest
    pub output_dir: PathBuf,

    /// Directory names pruned at any depth
    pub ignore_dirs: Vec<String>,

    /// File name suffixes that are excluded, each starting with `.`
    pub ignore_exts: Vec<String>,

    /// Follow symbolic links that stay inside the repository
    pub follow_symlinks: bool,

    /// Maximum number of candidate files, 0 for unlimited
    pub max_files: usize,

    /// Maximum size of a single file in bytes, 0 for unlimited
    pub max_file_size: u64,

    /// Worker count policy
    pub concurrency: Concurrency,

    /// Reuse the previous manifest when the tree is unchanged
    pub use_cache: bool,

    /// Where cache records live
    pub cache_dir: PathBuf,

    /// Plan the run without writing anything
    pub dry_run: bool,
}

impl Config {
    /// Creates a new configuration builder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use repo_flattener::Config;
    ///
    /// let config = Config::builder()
    ///     .root_dir("./my-project")
    ///     .output_dir("./flat")
    ///     .max_file_size(1024 * 1024)
    ///     .build()
    ///     .expect("valid configuration");
    /// ```
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Root directory doesn't exist or is not a directory
    /// - Output directory is the root or one of its ancestors
    /// - Cache directory lies inside the output directory
    /// - An ignore entry is empty or a directory name contains a separator
    pub fn validate(&self) -> Result<()> {
        crate::scanner::validate_root(&self.root_dir)?;

        let root = resolve_path(&self.root_dir);
        let output = resolve_path(&self.output_dir);
        if root.starts_with(&output) {
            return Err(Error::config(format!(
                "Output directory {} must not be the repository root or one of its parents",
                self.output_dir.display()
            )));
        }

        if self.use_cache && resolve_path(&self.cache_dir).starts_with(&output) {
            return Err(Error::config(format!(
                "Cache directory {} must not be inside the output directory",
                self.cache_dir.display()
            )));
        }

        for dir in &self.ignore_dirs {
            if dir.is_empty() || dir.contains(['/', '\\']) {
                return Err(Error::config(format!(
                    "Ignored directory '{dir}' must be a plain directory name"
                )));
            }
        }

        if self.ignore_exts.iter().any(|ext| ext.trim_start_matches('.').is_empty()) {
            return Err(Error::config("Ignored extensions must not be empty"));
        }

        Ok(())
    }

    /// Returns the number of workers that will process files.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.concurrency.effective_workers()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            ignore_dirs: merge_defaults(DEFAULT_IGNORE_DIRS, Vec::new()),
            ignore_exts: merge_defaults(DEFAULT_IGNORE_EXTS, Vec::new()),
            follow_symlinks: false,
            max_files: 0,
            max_file_size: 0,
            concurrency: Concurrency::Auto,
            use_cache: true,
            cache_dir: default_cache_dir(),
            dry_run: false,
        }
    }
}

/// Builder for creating a [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    root_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    ignore_dirs: Vec<String>,
    ignore_exts: Vec<String>,
    follow_symlinks: bool,
    max_files: usize,
    max_file_size: u64,
    concurrency: Option<Concurrency>,
    use_cache: Option<bool>,
    cache_dir: Option<PathBuf>,
    dry_run: bool,
}

impl ConfigBuilder {
    /// Sets the repository root.
    #[must_use]
    pub fn root_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(path.into());
        self
    }

    /// Sets the output directory.
    #[must_use]
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    /// Adds directory names to prune, on top of the built-in list.
    #[must_use]
    pub fn ignore_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_dirs.extend(dirs.into_iter().map(Into::into));
        self
    }

    /// Adds file extensions to exclude, on top of the built-in list.
    ///
    /// A missing leading dot is added.
    #[must_use]
    pub fn ignore_exts<I, S>(mut self, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_exts.extend(exts.into_iter().map(|ext| {
            let ext = ext.into();
            if ext.starts_with('.') || ext.is_empty() {
                ext
            } else {
                format!(".{ext}")
            }
        }));
        self
    }

    /// Enables or disables following symbolic links.
    #[must_use]
    pub fn follow_symlinks(mut self, enabled: bool) -> Self {
        self.follow_symlinks = enabled;
        self
    }

    /// Sets the maximum number of candidate files (0 = unlimited).
    #[must_use]
    pub fn max_files(mut self, limit: usize) -> Self {
        self.max_files = limit;
        self
    }

    /// Sets the maximum file size in bytes (0 = unlimited).
    #[must_use]
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Sets the worker count policy. Accepts a [`Concurrency`] or a plain
    /// count where 0 means auto.
    #[must_use]
    pub fn concurrency(mut self, concurrency: impl Into<Concurrency>) -> Self {
        self.concurrency = Some(concurrency.into());
        self
    }

    /// Enables or disables the change-detection cache.
    #[must_use]
    pub fn use_cache(mut self, enabled: bool) -> Self {
        self.use_cache = Some(enabled);
        self
    }

    /// Sets the cache directory.
    #[must_use]
    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Enables dry run mode (no file writes).
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<Config> {
        let config = Config {
            root_dir: self.root_dir.unwrap_or_else(|| PathBuf::from(".")),
            output_dir: self
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            ignore_dirs: merge_defaults(DEFAULT_IGNORE_DIRS, self.ignore_dirs),
            ignore_exts: merge_defaults(DEFAULT_IGNORE_EXTS, self.ignore_exts),
            follow_symlinks: self.follow_symlinks,
            max_files: self.max_files,
            max_file_size: self.max_file_size,
            concurrency: self.concurrency.unwrap_or_default(),
            use_cache: self.use_cache.unwrap_or(true),
            cache_dir: self.cache_dir.unwrap_or_else(default_cache_dir),
            dry_run: self.dry_run,
        };

        config.validate()?;
        Ok(config)
    }
}

fn merge_defaults(defaults: &[&str], extra: Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = defaults.iter().map(ToString::to_string).collect();
    for item in extra {
        if !merged.contains(&item) {
            merged.push(item);
        }
    }
    merged
}

/// Returns the platform cache directory for this tool.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "repo-flattener").map_or_else(
        || PathBuf::from(FALLBACK_CACHE_DIR),
        |dirs| dirs.cache_dir().to_path_buf(),
    )
}

/// Resolves a path that may not exist yet into an absolute, normalized form.
///
/// The longest existing ancestor is canonicalized and the remaining
/// components are appended lexically.
pub(crate) fn resolve_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other),
        }
    }

    let mut existing = lexical.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(existing) {
            return rest.iter().rev().fold(canonical, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return lexical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    fn builder_in(temp: &assert_fs::TempDir) -> ConfigBuilder {
        Config::builder()
            .root_dir(temp.child("repo").path())
            .output_dir(temp.child("out").path())
            .cache_dir(temp.child("cache").path())
    }

    #[test]
    fn test_default_config() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("repo").create_dir_all().unwrap();
        let config = builder_in(&temp).build().unwrap();

        assert_eq!(config.concurrency, Concurrency::Auto);
        assert!(config.use_cache);
        assert!(!config.follow_symlinks);
        assert_eq!(config.max_files, 0);
        assert!(config.ignore_dirs.iter().any(|d| d == "__pycache__"));
        assert!(config.ignore_exts.iter().any(|e| e == ".pyc"));
    }

    #[test]
    fn test_invalid_root_dir() {
        let result = Config::builder()
            .root_dir("/nonexistent/path/that/should/not/exist")
            .build();

        assert!(result.unwrap_err().is_invalid_repository());
    }

    #[test]
    fn test_root_must_be_directory() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("file.txt").write_str("x").unwrap();

        let result = Config::builder().root_dir(temp.child("file.txt").path()).build();
        assert!(result.unwrap_err().is_invalid_repository());
    }

    #[test]
    fn test_user_ignores_merge_with_defaults() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("repo").create_dir_all().unwrap();
        let config = builder_in(&temp)
            .ignore_dirs(["target", ".git"])
            .ignore_exts(["log"])
            .build()
            .unwrap();

        assert!(config.ignore_dirs.contains(&"target".to_string()));
        assert_eq!(config.ignore_dirs.iter().filter(|d| *d == ".git").count(), 1);
        assert!(config.ignore_exts.contains(&".log".to_string()));
        assert!(config.ignore_exts.contains(&".jar".to_string()));
    }

    #[test]
    fn test_output_cannot_contain_root() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("repo").create_dir_all().unwrap();

        let same = builder_in(&temp).output_dir(temp.child("repo").path()).build();
        assert!(same.unwrap_err().is_config());

        let parent = builder_in(&temp).output_dir(temp.path()).build();
        assert!(parent.unwrap_err().is_config());

        let inside = builder_in(&temp)
            .output_dir(temp.child("repo/flat").path())
            .build();
        assert!(inside.is_ok());
    }

    #[test]
    fn test_cache_dir_inside_output_rejected() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("repo").create_dir_all().unwrap();

        let result = builder_in(&temp).cache_dir(temp.child("out/.cache").path()).build();
        assert!(result.unwrap_err().is_config());

        let disabled = builder_in(&temp)
            .cache_dir(temp.child("out/.cache").path())
            .use_cache(false)
            .build();
        assert!(disabled.is_ok());
    }

    #[test]
    fn test_ignore_dir_with_separator_rejected() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("repo").create_dir_all().unwrap();

        let result = builder_in(&temp).ignore_dirs(["src/gen"]).build();
        assert!(result.unwrap_err().is_config());

        let empty = builder_in(&temp).ignore_exts(["."]).build();
        assert!(empty.unwrap_err().is_config());
    }

    #[test]
    fn test_concurrency_from_count() {
        assert_eq!(Concurrency::from(0), Concurrency::Auto);
        assert_eq!(Concurrency::from(1), Concurrency::Sequential);
        assert_eq!(Concurrency::from(4), Concurrency::Fixed(4));

        assert_eq!(Concurrency::Sequential.effective_workers(), 1);
        assert_eq!(Concurrency::Fixed(6).effective_workers(), 6);
        let auto = Concurrency::Auto.effective_workers();
        assert!((1..=32).contains(&auto));
        assert_eq!(auto, (num_cpus::get() + 4).min(32));
    }

    #[test]
    fn test_resolve_path_handles_missing_tail() {
        let temp = assert_fs::TempDir::new().unwrap();
        let resolved = resolve_path(&temp.path().join("a/./b/../c"));
        let canonical_temp = fs::canonicalize(temp.path()).unwrap();
        assert_eq!(resolved, canonical_temp.join("a").join("c"));
    }
}
