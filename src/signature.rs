//! Change detection over scan metadata.

use crate::config::Config;
use crate::file::FileEntry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const SIGNATURE_TAG: &str = concat!("repo-flattener/", env!("CARGO_PKG_VERSION"), "/sig1");

/// Digest over a scan's `(path, size, mtime)` tuples and the rules that
/// produced it.
///
/// Any added, removed, resized or touched file changes the signature, and
/// so does any change to the ignore rules, the symlink policy or the size
/// limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanSignature(String);

impl ScanSignature {
    /// Computes the signature of `entries` under `config`.
    ///
    /// The entry order does not matter.
    #[must_use]
    pub fn compute(entries: &[FileEntry], config: &Config) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SIGNATURE_TAG.as_bytes());

        hash_rules(&mut hasher, "dirs", &config.ignore_dirs);
        hash_rules(&mut hasher, "exts", &config.ignore_exts);
        hasher.update([u8::from(config.follow_symlinks)]);
        hasher.update(config.max_file_size.to_le_bytes());

        let mut sorted: Vec<&FileEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        hasher.update((sorted.len() as u64).to_le_bytes());
        for entry in sorted {
            hash_str(&mut hasher, &entry.relative_path);
            hasher.update(entry.size_bytes.to_le_bytes());
            hasher.update(entry.modified_time.to_le_bytes());
            hasher.update([u8::from(entry.is_symlink)]);
        }

        Self(hex::encode(hasher.finalize()))
    }

    /// Returns the hex-encoded digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hash_rules(hasher: &mut Sha256, label: &str, rules: &[String]) {
    let mut rules: Vec<&str> = rules.iter().map(String::as_str).collect();
    rules.sort_unstable();
    rules.dedup();

    hash_str(hasher, label);
    hasher.update((rules.len() as u64).to_le_bytes());
    for rule in rules {
        hash_str(hasher, rule);
    }
}

// Length prefix keeps ("ab", "c") and ("a", "bc") apart.
fn hash_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    fn config_for(temp: &assert_fs::TempDir) -> crate::config::ConfigBuilder {
        temp.child("repo").create_dir_all().unwrap();
        Config::builder()
            .root_dir(temp.child("repo").path())
            .output_dir(temp.child("out").path())
            .use_cache(false)
    }

    fn sample() -> Vec<FileEntry> {
        vec![
            FileEntry::new("a/b.py", 10, 1_000),
            FileEntry::new("c.txt", 3, 2_000),
        ]
    }

    #[test]
    fn test_signature_is_stable_and_order_independent() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = config_for(&temp).build().unwrap();

        let mut reversed = sample();
        reversed.reverse();

        let first = ScanSignature::compute(&sample(), &config);
        assert_eq!(first, ScanSignature::compute(&sample(), &config));
        assert_eq!(first, ScanSignature::compute(&reversed, &config));
        assert_eq!(first.as_str().len(), 64);
    }

    #[test]
    fn test_signature_tracks_entry_changes() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = config_for(&temp).build().unwrap();
        let base = ScanSignature::compute(&sample(), &config);

        let mut touched = sample();
        touched[0].modified_time += 1;
        assert_ne!(base, ScanSignature::compute(&touched, &config));

        let mut resized = sample();
        resized[1].size_bytes += 1;
        assert_ne!(base, ScanSignature::compute(&resized, &config));

        let mut added = sample();
        added.push(FileEntry::new("d.rs", 0, 0));
        assert_ne!(base, ScanSignature::compute(&added, &config));

        let removed = &sample()[..1];
        assert_ne!(base, ScanSignature::compute(removed, &config));

        let mut linked = sample();
        linked[1].is_symlink = true;
        assert_ne!(base, ScanSignature::compute(&linked, &config));
    }

    #[test]
    fn test_signature_tracks_rule_changes() {
        let temp = assert_fs::TempDir::new().unwrap();
        let base = ScanSignature::compute(&sample(), &config_for(&temp).build().unwrap());

        let dirs = config_for(&temp).ignore_dirs(["target"]).build().unwrap();
        assert_ne!(base, ScanSignature::compute(&sample(), &dirs));

        let exts = config_for(&temp).ignore_exts([".log"]).build().unwrap();
        assert_ne!(base, ScanSignature::compute(&sample(), &exts));

        let follow = config_for(&temp).follow_symlinks(true).build().unwrap();
        assert_ne!(base, ScanSignature::compute(&sample(), &follow));

        let sized = config_for(&temp).max_file_size(5).build().unwrap();
        assert_ne!(base, ScanSignature::compute(&sample(), &sized));

        let workers = config_for(&temp).concurrency(4).build().unwrap();
        assert_eq!(base, ScanSignature::compute(&sample(), &workers));
    }

    #[test]
    fn test_signature_serializes_as_string() {
        let temp = assert_fs::TempDir::new().unwrap();
        let signature = ScanSignature::compute(&[], &config_for(&temp).build().unwrap());
        let json = serde_json::to_string(&signature).unwrap();
        assert_eq!(json, format!("\"{signature}\""));
    }
}
