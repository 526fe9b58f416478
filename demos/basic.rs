//! Basic example of using repo-flattener as a library
//!
//! This example flattens the crate's own sources and prints the summary.

use repo_flattener::{Config, Pipeline};

fn main() -> anyhow::Result<()> {
    let config = Config::builder()
        .root_dir("./src")
        .output_dir("./flattened_src")
        .max_file_size(512 * 1024)
        .build()?;

    let report = Pipeline::new(config)?.run()?;

    report.print_summary();

    if report.cache_hit {
        println!("✓ Nothing changed since the last run");
    } else {
        println!(
            "✓ Flattened {} of {} files",
            report.summary.written, report.summary.total_files
        );
    }
    println!("✓ Manifest written to: {}", report.manifest_path.display());

    Ok(())
}
