use anyhow::Context;
use clap::Parser;
use repo_flattener::{Config, Error, Pipeline, ProgressObserver};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const PROGRESS_EVERY: usize = 50;

#[derive(Parser, Debug)]
#[command(
    name = "repo-flattener",
    version,
    author,
    about = "Flatten a repository into one file per source file plus a manifest",
    long_about = "Flatten a repository into a single directory for bulk upload to LLMs.\n\n\
    Every source file is copied to the output directory under a name derived from its \
    path, and file_manifest.txt records the original tree together with the outcome \
    for each file. Unchanged repositories are detected and not processed again.\n\n\
    USAGE EXAMPLES:\n  \
      # Flatten a project into ./flattened_repo\n  \
      repo-flattener ./my-project\n\n  \
      # Skip build output and large files\n  \
      repo-flattener ./my-project --ignore-dirs target,dist --max-file-size 1000000\n\n  \
      # Flatten only the listed files\n  \
      repo-flattener ./my-project --files-from selection.txt\n\n  \
      # Preview without writing anything\n  \
      repo-flattener ./my-project --dry-run --json"
)]
struct Cli {
    /// Repository root to flatten
    #[arg(value_name = "REPO")]
    repo: PathBuf,

    /// Output directory for flattened files and the manifest
    #[arg(short, long, default_value = "flattened_repo", value_name = "PATH")]
    output: PathBuf,

    /// Extra directory names to skip, comma separated
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    ignore_dirs: Vec<String>,

    /// Extra file extensions to skip, comma separated
    #[arg(long, value_delimiter = ',', value_name = "EXTS")]
    ignore_exts: Vec<String>,

    /// Process symbolic links that resolve inside the repository
    #[arg(long)]
    follow_symlinks: bool,

    /// Abort if more candidate files are found (0 = unlimited)
    #[arg(long, default_value_t = 0, value_name = "N")]
    max_files: usize,

    /// Skip files larger than this many bytes (0 = unlimited)
    #[arg(long, default_value_t = 0, value_name = "BYTES")]
    max_file_size: u64,

    /// Number of worker threads (0 = auto)
    #[arg(short = 'j', long, default_value_t = 0, value_name = "N")]
    workers: usize,

    /// Always process every file, ignoring previous runs
    #[arg(long)]
    no_cache: bool,

    /// Directory holding change-detection records
    #[arg(long, env = "REPO_FLATTENER_CACHE_DIR", value_name = "PATH")]
    cache_dir: Option<PathBuf>,

    /// Dry run (don't write files)
    #[arg(long)]
    dry_run: bool,

    /// Flatten only the paths listed in FILE, one per line
    #[arg(long, value_name = "FILE")]
    files_from: Option<PathBuf>,

    /// Print the report as JSON instead of a summary table
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Logs a progress line every few files.
struct LogProgress;

impl ProgressObserver for LogProgress {
    fn on_unit_complete(&self, completed: usize, total: usize) {
        if completed % PROGRESS_EVERY == 0 || completed == total {
            info!("Processed {}/{} files", completed, total);
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(cli.verbose) {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let cause = e.downcast_ref::<Error>();
            if let Some(tip) = cause.and_then(Error::tip) {
                eprintln!("Tip: {tip}");
            }
            ExitCode::from(exit_code(cause))
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut builder = Config::builder()
        .root_dir(cli.repo)
        .output_dir(cli.output)
        .ignore_dirs(cli.ignore_dirs)
        .ignore_exts(cli.ignore_exts)
        .follow_symlinks(cli.follow_symlinks)
        .max_files(cli.max_files)
        .max_file_size(cli.max_file_size)
        .concurrency(cli.workers)
        .use_cache(!cli.no_cache)
        .dry_run(cli.dry_run);

    if let Some(cache_dir) = cli.cache_dir {
        builder = builder.cache_dir(cache_dir);
    }

    let config = builder.build().context("Failed to build configuration")?;

    let pipeline = Pipeline::new(config)
        .context("Failed to create pipeline")?
        .with_progress(Arc::new(LogProgress));

    let report = match cli.files_from {
        Some(list) => {
            let paths = read_file_list(&list)?;
            pipeline.run_with_files(&paths)
        }
        None => pipeline.run(),
    }
    .context("Flatten failed")?;

    if cli.json {
        println!("{}", report.to_json().context("Failed to encode report")?);
    } else {
        report.print_summary();
    }

    Ok(())
}

fn read_file_list(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file list {}", path.display()))?;

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect())
}

const fn exit_code(error: Option<&Error>) -> u8 {
    match error {
        Some(Error::InvalidRepository { .. }) => 2,
        Some(Error::ResourceLimitExceeded { .. }) => 3,
        Some(Error::OutputDirectory { .. }) => 4,
        _ => 1,
    }
}

fn setup_tracing(verbosity: u8) -> anyhow::Result<()> {
    let filter = match verbosity {
        0 => EnvFilter::new("repo_flattener=info"),
        1 => EnvFilter::new("repo_flattener=debug"),
        _ => EnvFilter::new("repo_flattener=trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}
