//! Dry run example
//!
//! This example shows how to preview which files would be flattened
//! without writing anything.

use repo_flattener::Config;

fn main() -> anyhow::Result<()> {
    let config = Config::builder()
        .root_dir(".")
        .output_dir("./flattened_repo")
        .ignore_dirs(["target"])
        .max_file_size(64 * 1024)
        .dry_run(true)
        .build()?;

    println!("Running in DRY RUN mode - no files will be written\n");

    let report = repo_flattener::run(config)?;

    for processed in &report.manifest.entries {
        let label = processed.outcome.category().label();
        println!("  {:<60} {}", processed.entry.relative_path, label);
    }

    let summary = &report.summary;
    println!();
    println!("Would write {} of {} files", summary.written, summary.total_files);
    println!("  Total size: {} bytes", summary.total_size);
    println!("  Estimated tokens: {}", summary.estimated_tokens);
    for (ext, stats) in &summary.by_extension {
        println!("  {ext:<16} {:>5} files {:>10} bytes", stats.count, stats.bytes);
    }

    Ok(())
}
