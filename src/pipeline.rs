use crate::{
    cache::{self, CacheKey, CacheRecord, CacheStore},
    config::Config,
    error::{Error, Result},
    file::{FileEntry, ProcessedEntry},
    manifest::{Manifest, ManifestBuilder, RunSummary},
    pool::{NoProgress, ProgressObserver, WorkerPool},
    scanner::{validate_root, Scanner},
    security,
    signature::ScanSignature,
    writer::{self, OutputNamer, Writer, MANIFEST_FILE_NAME},
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Entries and outcomes in scan order
    pub manifest: Manifest,

    /// Totals
    pub summary: RunSummary,

    /// Where the manifest was (or, in a dry run, would be) written
    pub manifest_path: PathBuf,

    /// The previous run's results were reused
    pub cache_hit: bool,

    /// Nothing was written
    pub dry_run: bool,

    /// Wall-clock time of the run
    pub duration: Duration,
}

impl RunReport {
    /// Renders the report as JSON.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the report cannot be encoded.
    pub fn to_json(&self) -> Result<String> {
        let entries: Vec<serde_json::Value> = self
            .manifest
            .entries
            .iter()
            .map(|processed| {
                serde_json::json!({
                    "path": processed.entry.relative_path,
                    "size_bytes": processed.entry.size_bytes,
                    "outcome": processed.outcome,
                })
            })
            .collect();

        let value = serde_json::json!({
            "repository_root": self.manifest.repository_root,
            "generated_at": self.manifest.generated_at.to_rfc3339(),
            "manifest_path": self.manifest_path,
            "cache_hit": self.cache_hit,
            "dry_run": self.dry_run,
            "duration_secs": self.duration.as_secs_f64(),
            "summary": self.summary,
            "entries": entries,
        });
        Ok(serde_json::to_string_pretty(&value)?)
    }

    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        let s = &self.summary;
        let mode = match (self.dry_run, self.cache_hit) {
            (true, _) => "dry run",
            (false, true) => "cached",
            (false, false) => "full",
        };

        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║              Repository Flatten Summary               ║");
        println!("╠═══════════════════════════════════════════════════════╣");
        println!("║ Mode:                 {mode:>8}                        ║");
        println!("║ Candidate Files:      {:>8}                        ║", s.total_files);
        println!("║   - Written:          {:>8}                        ║", s.written);
        println!("║   - Too large:        {:>8}                        ║", s.skipped_too_large);
        println!("║   - Symlinks:         {:>8}                        ║", s.skipped_symlink);
        println!("║   - Security:         {:>8}                        ║", s.skipped_security);
        println!("║   - Unreadable:       {:>8}                        ║", s.skipped_unreadable);
        println!("║   - I/O errors:       {:>8}                        ║", s.skipped_io_error);
        println!("║                                                       ║");
        println!("║ Total Size:           {:>8} bytes                  ║", s.total_size);
        println!("║ Estimated Tokens:     {:>8}                        ║", s.estimated_tokens);
        if !s.by_extension.is_empty() {
            println!("║                                                       ║");
            println!("║ By Extension:                                         ║");
            for (ext, stats) in &s.by_extension {
                println!(
                    "║   {:<18} {:>6} files {:>10} bytes     ║",
                    ext, stats.count, stats.bytes
                );
            }
        }
        println!("║                                                       ║");
        println!("║ Manifest:                                             ║");
        println!("║   {}", self.manifest_path.display());
        println!(
            "║ Total Time:           {:>8.2}s                     ║",
            self.duration.as_secs_f64()
        );
        println!("╚═══════════════════════════════════════════════════════╝\n");
    }
}

/// Sequences scan, cache check, processing and manifest generation.
pub struct Pipeline {
    config: Config,
    scanner: Scanner,
    cache: Arc<dyn CacheStore>,
    progress: Arc<dyn ProgressObserver>,
}

impl Pipeline {
    /// Creates a new pipeline with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let scanner = Scanner::new(&config);
        let cache = cache::open_store(&config);

        Ok(Self {
            config,
            scanner,
            cache,
            progress: Arc::new(NoProgress),
        })
    }

    /// Replaces the cache store selected by the configuration.
    #[must_use]
    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = store;
        self
    }

    /// Sets the observer notified after every processed file.
    #[must_use]
    pub fn with_progress(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.progress = observer;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Scans the repository and flattens it, reusing the previous run's
    /// results when nothing changed.
    ///
    /// # Process
    ///
    /// 1. **Scan**: Walks the repository and collects file metadata
    /// 2. **Cache check**: Compares the scan signature with the stored one
    /// 3. **Process**: Flattens every file and writes the manifest
    ///
    /// In dry run mode only the scan runs and outcomes are predicted.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository is invalid, the file limit is
    /// exceeded or the output directory cannot be used.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use repo_flattener::{Config, Pipeline};
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::builder()
    ///     .root_dir("./my-project")
    ///     .build()?;
    ///
    /// let report = Pipeline::new(config)?.run()?;
    /// report.print_summary();
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip(self), fields(root_dir = %self.config.root_dir.display()))]
    pub fn run(&self) -> Result<RunReport> {
        let start = Instant::now();
        info!("Starting repository flatten");

        info!("Stage 1/3: Scanning repository...");
        let root = validate_root(&self.config.root_dir)?;
        let entries = self.scanner.scan()?;
        info!(
            "✓ Found {} candidate files in {:.2}s",
            entries.len(),
            start.elapsed().as_secs_f64()
        );

        if self.config.dry_run {
            return Ok(self.dry_run(&root, entries, start));
        }

        info!("Stage 2/3: Checking cache...");
        let signature = ScanSignature::compute(&entries, &self.config);
        let key = CacheKey::new(&root, &self.config.output_dir);
        if let Some(report) = self.try_cache_hit(&root, &key, &signature, start)? {
            return Ok(report);
        }

        self.execute(&root, entries, start, Some(signature))
    }

    /// Flattens an explicit list of repository-relative paths.
    ///
    /// The scan and the cache are bypassed. Listed paths that are missing
    /// or unsafe are reported as skipped, not as errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoFilesSelected`] for an empty list, or an error if
    /// the repository or output directory is invalid.
    #[instrument(skip(self, paths), fields(files = paths.len()))]
    pub fn run_with_files(&self, paths: &[String]) -> Result<RunReport> {
        let start = Instant::now();
        if paths.is_empty() {
            return Err(Error::NoFilesSelected);
        }

        let root = validate_root(&self.config.root_dir)?;
        let entries = self.scanner.entries_for(paths)?;
        info!("Processing {} listed files", entries.len());

        if self.config.dry_run {
            return Ok(self.dry_run(&root, entries, start));
        }
        self.execute(&root, entries, start, None)
    }

    /// Scans the repository, lets `selector` choose from the scanned paths
    /// and flattens the chosen ones.
    ///
    /// The selector receives the paths in scan order. Its answer may be in
    /// any order and is processed in scan order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoFilesSelected`] if nothing was chosen and
    /// [`Error::InvalidSelection`] if a chosen path was not offered, besides
    /// the errors of [`Pipeline::run`].
    #[instrument(skip_all, fields(root_dir = %self.config.root_dir.display()))]
    pub fn run_with_selection<F>(&self, selector: F) -> Result<RunReport>
    where
        F: FnOnce(&[String]) -> Vec<String>,
    {
        let start = Instant::now();
        let root = validate_root(&self.config.root_dir)?;
        let entries = self.scanner.scan()?;

        let offered: Vec<String> = entries.iter().map(|e| e.relative_path.clone()).collect();
        let selected = selector(&offered);
        if selected.is_empty() {
            return Err(Error::NoFilesSelected);
        }

        let offered: HashSet<&str> = offered.iter().map(String::as_str).collect();
        let mut chosen = HashSet::new();
        for raw in selected {
            let path = security::normalize_relative(&raw).unwrap_or(raw);
            if !offered.contains(path.as_str()) {
                return Err(Error::invalid_selection(path));
            }
            chosen.insert(path);
        }

        let entries: Vec<FileEntry> = entries
            .into_iter()
            .filter(|entry| chosen.contains(&entry.relative_path))
            .collect();
        info!("Selected {} of {} files", entries.len(), offered.len());

        if self.config.dry_run {
            return Ok(self.dry_run(&root, entries, start));
        }
        self.execute(&root, entries, start, None)
    }

    /// Returns a report built from the stored record if it is still valid.
    fn try_cache_hit(
        &self,
        root: &Path,
        key: &CacheKey,
        signature: &ScanSignature,
        start: Instant,
    ) -> Result<Option<RunReport>> {
        let Some(record) = self.cache.lookup(key) else {
            debug!("No cache record");
            return Ok(None);
        };
        if record.signature != *signature {
            info!("Repository changed since the last run, recomputing");
            return Ok(None);
        }
        if !record.outputs_intact() || !key.output_dir.join(MANIFEST_FILE_NAME).is_file() {
            info!("Cached outputs are missing or were modified, recomputing");
            return Ok(None);
        }

        let output_dir = writer::prepare_output_dir(&self.config.output_dir)?;
        let keep = written_outputs(&record.entries);
        writer::remove_stale_outputs(&output_dir, &keep);
        let manifest_path = writer::write_manifest(&output_dir, &record.manifest_text)?;
        let (manifest, summary) = ManifestBuilder::build_at(root, record.entries, record.created_at);

        info!(
            "✓ Repository unchanged, reused {} results in {:.2}s",
            summary.total_files,
            start.elapsed().as_secs_f64()
        );
        Ok(Some(RunReport {
            manifest,
            summary,
            manifest_path,
            cache_hit: true,
            dry_run: false,
            duration: start.elapsed(),
        }))
    }

    /// Processes `entries`, replaces the output directory's contents and
    /// writes the manifest.
    ///
    /// Any record for this output directory is dropped before the first
    /// write. A new one is stored only for a full scan, given its
    /// `signature`.
    fn execute(
        &self,
        root: &Path,
        entries: Vec<FileEntry>,
        start: Instant,
        signature: Option<ScanSignature>,
    ) -> Result<RunReport> {
        info!("Stage 3/3: Processing files...");
        let output_dir = writer::prepare_output_dir(&self.config.output_dir)?;
        let key = CacheKey::new(root, &self.config.output_dir);
        cache::remove_quietly(self.cache.as_ref(), &key);
        let writer = Writer::new(&self.config, root.to_path_buf()).with_output_dir(output_dir.clone());

        let process_start = Instant::now();
        let processed = WorkerPool::new(&writer, self.config.effective_workers(), &*self.progress)
            .run(entries);
        let (manifest, summary) = ManifestBuilder::build(root, processed);
        info!(
            "✓ Wrote {} files, skipped {} in {:.2}s",
            summary.written,
            summary.skipped(),
            process_start.elapsed().as_secs_f64()
        );
        if summary.skipped() > 0 {
            warn!("{} files were skipped, see the manifest for details", summary.skipped());
        }

        let removed = writer::remove_stale_outputs(&output_dir, &written_outputs(&manifest.entries));
        if removed > 0 {
            debug!("Removed {} outputs left by an earlier run", removed);
        }

        let text = manifest.render();
        let manifest_path = writer::write_manifest(&output_dir, &text)?;

        if let Some(signature) = signature {
            let mut record = CacheRecord::new(key.clone(), signature, text, manifest.entries.clone());
            record.created_at = manifest.generated_at;
            cache::store_quietly(self.cache.as_ref(), &key, record);
        }

        info!(
            "✓ Flatten completed in {:.2}s",
            start.elapsed().as_secs_f64()
        );
        Ok(RunReport {
            manifest,
            summary,
            manifest_path,
            cache_hit: false,
            dry_run: false,
            duration: start.elapsed(),
        })
    }

    /// Predicts outcomes without creating or writing anything.
    fn dry_run(&self, root: &Path, entries: Vec<FileEntry>, start: Instant) -> RunReport {
        warn!("Dry run mode enabled - skipping file writes");
        let writer = Writer::new(&self.config, root.to_path_buf());
        let mut namer = OutputNamer::new();

        let planned: Vec<ProcessedEntry> = entries
            .into_iter()
            .map(|entry| {
                let name = namer.assign(&entry.relative_path);
                let outcome = writer.plan(&entry, &name);
                ProcessedEntry::new(entry, outcome)
            })
            .collect();
        let (manifest, summary) = ManifestBuilder::build(root, planned);

        RunReport {
            manifest,
            summary,
            manifest_path: self.config.output_dir.join(MANIFEST_FILE_NAME),
            cache_hit: false,
            dry_run: true,
            duration: start.elapsed(),
        }
    }
}

fn written_outputs(entries: &[ProcessedEntry]) -> HashSet<PathBuf> {
    entries
        .iter()
        .filter_map(|processed| processed.outcome.output_path())
        .map(Path::to_path_buf)
        .collect()
}
