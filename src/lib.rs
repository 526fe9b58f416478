//! # repo-flattener
//!
//! Flattens a source repository into a single directory: one output file per
//! source file plus a `file_manifest.txt` describing the original tree.
//!
//! ## Features
//!
//! - Parallel scanning with ignored directories and extensions pruned early
//! - Bounded worker pool with deterministic, scan-ordered results
//! - Path containment checks on every read and write
//! - Change detection that skips the work entirely for an unchanged tree
//!
//! ## Quick Start
//!
//! ```no_run
//! use repo_flattener::{Config, Pipeline};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::builder()
//!     .root_dir("./my-project")
//!     .output_dir("./flattened")
//!     .max_file_size(1024 * 1024)
//!     .build()?;
//!
//! let report = Pipeline::new(config)?.run()?;
//! println!("{} files written", report.summary.written);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! 1. **Scanner**: Walks the tree and collects candidate files
//! 2. **Cache**: Compares a signature of the scan with the previous run
//! 3. **Worker pool**: Copies each file to its flattened name
//! 4. **Manifest**: Renders the tree with per-file outcomes

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

mod cache;
mod config;
mod error;
mod file;
mod manifest;
mod pipeline;
mod pool;
mod scanner;
mod security;
mod signature;
mod writer;

pub use cache::{
    open_store, CacheKey, CacheRecord, CacheStore, DirectoryCache, DisabledCache, MemoryCache,
    OutputStamp, CACHE_FORMAT_VERSION,
};
pub use config::{
    default_cache_dir, Concurrency, Config, ConfigBuilder, DEFAULT_IGNORE_DIRS,
    DEFAULT_IGNORE_EXTS,
};
pub use error::{Error, Result};
pub use file::{FileEntry, OutcomeCategory, ProcessOutcome, ProcessedEntry, NO_EXTENSION};
pub use manifest::{estimate_tokens, ExtensionStats, Manifest, ManifestBuilder, RunSummary};
pub use pipeline::{Pipeline, RunReport};
pub use pool::{NoProgress, ProgressObserver};
pub use security::{
    normalize_relative, validate_input_entry, validate_output_path, SecurityViolation,
};
pub use signature::ScanSignature;
pub use writer::{flatten_name, MANIFEST_FILE_NAME};

/// Runs a full flatten with the given configuration.
///
/// This is the main entry point for the library.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is invalid
/// - Root directory doesn't exist or is not a directory
/// - More files were found than `max_files` allows
/// - Output directory cannot be created or written
///
/// # Examples
///
/// ```no_run
/// use repo_flattener::{Config, run};
///
/// # fn main() -> anyhow::Result<()> {
/// let config = Config::builder()
///     .root_dir(".")
///     .build()?;
///
/// run(config)?;
/// # Ok(())
/// # }
/// ```
pub fn run(config: Config) -> Result<RunReport> {
    Pipeline::new(config)?.run()
}
