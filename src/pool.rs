//! Bounded worker pool for the per-file transform.
//!
//! Output names are assigned before any worker starts, so each unit writes
//! to a path no other unit touches and the workers share nothing but the
//! progress counter.

use crate::file::{FileEntry, ProcessOutcome, ProcessedEntry};
use crate::writer::{OutputNamer, Writer};
use crossbeam_channel::unbounded;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, trace, warn};

/// Receives a callback for every finished unit.
pub trait ProgressObserver: Send + Sync {
    /// Called once per finished unit with the number completed so far.
    fn on_unit_complete(&self, completed: usize, total: usize);
}

/// Observer that ignores all progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_unit_complete(&self, _completed: usize, _total: usize) {}
}

/// Runs [`Writer::process`] over a list of entries.
pub(crate) struct WorkerPool<'a> {
    writer: &'a Writer,
    workers: usize,
    observer: &'a dyn ProgressObserver,
}

impl fmt::Debug for WorkerPool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

struct Unit<'e> {
    index: usize,
    entry: &'e FileEntry,
    output_name: String,
}

impl<'a> WorkerPool<'a> {
    pub(crate) fn new(
        writer: &'a Writer,
        workers: usize,
        observer: &'a dyn ProgressObserver,
    ) -> Self {
        Self {
            writer,
            workers: workers.max(1),
            observer,
        }
    }

    /// Processes every entry and returns the outcomes in the order of
    /// `entries`, whatever order the workers finished in.
    pub(crate) fn run(&self, entries: Vec<FileEntry>) -> Vec<ProcessedEntry> {
        let mut namer = OutputNamer::new();
        let names: Vec<String> = entries
            .iter()
            .map(|entry| namer.assign(&entry.relative_path))
            .collect();

        let total = entries.len();
        let workers = self.workers.min(total);
        debug!("Processing {} files with {} workers", total, workers.max(1));

        let outcomes = if workers <= 1 {
            self.run_sequential(&entries, names)
        } else {
            self.run_parallel(&entries, names, workers)
        };

        entries
            .into_iter()
            .zip(outcomes)
            .map(|(entry, outcome)| ProcessedEntry::new(entry, outcome))
            .collect()
    }

    fn run_sequential(&self, entries: &[FileEntry], names: Vec<String>) -> Vec<ProcessOutcome> {
        let total = entries.len();
        entries
            .iter()
            .zip(names)
            .enumerate()
            .map(|(i, (entry, name))| {
                let outcome = self.writer.process(entry, &name);
                self.observer.on_unit_complete(i + 1, total);
                outcome
            })
            .collect()
    }

    fn run_parallel(
        &self,
        entries: &[FileEntry],
        names: Vec<String>,
        workers: usize,
    ) -> Vec<ProcessOutcome> {
        let total = entries.len();
        let completed = AtomicUsize::new(0);
        let (job_tx, job_rx) = unbounded::<Unit<'_>>();
        let (result_tx, result_rx) = unbounded::<(usize, ProcessOutcome)>();

        for (index, (entry, output_name)) in entries.iter().zip(names).enumerate() {
            // The receiver is alive until the scope below ends.
            let _ = job_tx.send(Unit {
                index,
                entry,
                output_name,
            });
        }
        drop(job_tx);

        thread::scope(|scope| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let completed = &completed;
                scope.spawn(move || {
                    for unit in job_rx {
                        trace!("Worker {} processing {}", worker, unit.entry.relative_path);
                        let outcome = self.writer.process(unit.entry, &unit.output_name);
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        self.observer.on_unit_complete(done, total);
                        if result_tx.send((unit.index, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut slots: Vec<Option<ProcessOutcome>> = vec![None; total];
        for (index, outcome) in result_rx {
            slots[index] = Some(outcome);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    warn!("No result for {}", entries[index].relative_path);
                    ProcessOutcome::SkippedIoError("worker did not report".to_string())
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::writer::prepare_output_dir;
    use assert_fs::prelude::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(usize, usize)>>,
    }

    impl ProgressObserver for Recorder {
        fn on_unit_complete(&self, completed: usize, total: usize) {
            self.calls.lock().unwrap().push((completed, total));
        }
    }

    fn setup(temp: &assert_fs::TempDir, files: usize) -> (Writer, Vec<FileEntry>) {
        temp.child("repo").create_dir_all().unwrap();
        let mut entries = Vec::new();
        for i in 0..files {
            let name = format!("dir{}/file{i:02}.txt", i % 3);
            temp.child("repo").child(&name).write_str(&"x".repeat(i)).unwrap();
            entries.push(FileEntry::new(name, i as u64, 0));
        }
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let config = Config::builder()
            .root_dir(temp.child("repo").path())
            .output_dir(temp.child("out").path())
            .max_file_size(10)
            .use_cache(false)
            .build()
            .unwrap();
        let root = std::fs::canonicalize(temp.child("repo").path()).unwrap();
        let out = prepare_output_dir(temp.child("out").path()).unwrap();
        (Writer::new(&config, root).with_output_dir(out), entries)
    }

    #[test]
    fn test_results_follow_input_order() {
        let temp = assert_fs::TempDir::new().unwrap();
        let (writer, entries) = setup(&temp, 24);
        let expected: Vec<String> = entries.iter().map(|e| e.relative_path.clone()).collect();

        let processed = WorkerPool::new(&writer, 4, &NoProgress).run(entries);

        let got: Vec<String> = processed.iter().map(|p| p.entry.relative_path.clone()).collect();
        assert_eq!(got, expected);
        for p in &processed {
            assert_eq!(p.outcome.is_written(), p.entry.size_bytes <= 10, "{}", p.entry.relative_path);
        }
    }

    #[test]
    fn test_sequential_and_parallel_agree() {
        let temp_a = assert_fs::TempDir::new().unwrap();
        let (writer_a, entries_a) = setup(&temp_a, 15);
        let temp_b = assert_fs::TempDir::new().unwrap();
        let (writer_b, entries_b) = setup(&temp_b, 15);

        let strip = |processed: Vec<ProcessedEntry>| {
            processed
                .into_iter()
                .map(|p| {
                    let name = p
                        .outcome
                        .output_path()
                        .and_then(|path| path.file_name())
                        .map(|n| n.to_string_lossy().into_owned());
                    (p.entry.relative_path, p.outcome.category(), name)
                })
                .collect::<Vec<_>>()
        };

        let sequential = strip(WorkerPool::new(&writer_a, 1, &NoProgress).run(entries_a));
        let parallel = strip(WorkerPool::new(&writer_b, 8, &NoProgress).run(entries_b));
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_progress_called_once_per_unit() {
        let temp = assert_fs::TempDir::new().unwrap();
        let (writer, entries) = setup(&temp, 12);
        let recorder = Recorder::default();

        WorkerPool::new(&writer, 3, &recorder).run(entries);

        let mut calls = recorder.calls.into_inner().unwrap();
        calls.sort_unstable();
        assert_eq!(calls, (1..=12).map(|i| (i, 12)).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_input() {
        let temp = assert_fs::TempDir::new().unwrap();
        let (writer, _) = setup(&temp, 0);
        let recorder = Recorder::default();

        assert!(WorkerPool::new(&writer, 4, &recorder).run(Vec::new()).is_empty());
        assert!(recorder.calls.into_inner().unwrap().is_empty());
    }

    #[test]
    fn test_colliding_names_get_distinct_outputs() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("repo/a/b.txt").write_str("nested").unwrap();
        temp.child("repo/a_b.txt").write_str("flat").unwrap();
        let (writer, _) = setup(&temp, 0);

        let entries = vec![FileEntry::new("a/b.txt", 6, 0), FileEntry::new("a_b.txt", 4, 0)];
        let processed = WorkerPool::new(&writer, 2, &NoProgress).run(entries);

        let first = processed[0].outcome.output_path().unwrap();
        let second = processed[1].outcome.output_path().unwrap();
        assert!(first.ends_with("a_b.txt"));
        assert!(second.ends_with("a_b__2.txt"));
        assert!(std::fs::read_to_string(second).unwrap().ends_with("flat"));
    }
}
