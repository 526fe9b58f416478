//! Change-detection cache.
//!
//! A record maps a `(repository_root, output_dir)` pair to the signature and
//! manifest of the last completed run. Caching only decides whether work is
//! redone, never what the work produces, so every failure to read a record
//! is a miss.

use crate::config::{resolve_path, Config};
use crate::error::{Error, Result};
use crate::file::{epoch_nanos, ProcessedEntry};
use crate::security;
use crate::signature::ScanSignature;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

/// Bumped whenever the record layout changes.
pub const CACHE_FORMAT_VERSION: u32 = 2;

/// Normalized absolute `(repository_root, output_dir)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Canonical repository root
    pub repository_root: PathBuf,
    /// Absolute output directory
    pub output_dir: PathBuf,
}

impl CacheKey {
    /// Creates a key, resolving both paths to absolute form.
    #[must_use]
    pub fn new(repository_root: &Path, output_dir: &Path) -> Self {
        Self {
            repository_root: resolve_path(repository_root),
            output_dir: resolve_path(output_dir),
        }
    }

    /// Hex SHA-256 of the key, used as the record file name.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.repository_root.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(self.output_dir.to_string_lossy().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Size and modification time of a written output when the run finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputStamp {
    /// Output file
    pub path: PathBuf,
    /// Size in bytes
    pub size_bytes: u64,
    /// Modification time in nanoseconds since the Unix epoch
    pub modified_time: i64,
}

impl OutputStamp {
    /// Stats `path`, returning `None` if it is not a readable regular file.
    #[must_use]
    pub fn capture(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok().filter(fs::Metadata::is_file)?;
        Some(Self {
            path: path.to_path_buf(),
            size_bytes: metadata.len(),
            modified_time: metadata.modified().map_or(0, epoch_nanos),
        })
    }

    /// Returns true if the file on disk still matches this stamp.
    #[must_use]
    pub fn matches_disk(&self) -> bool {
        Self::capture(&self.path).is_some_and(|now| now == *self)
    }
}

/// What a completed run leaves behind for the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Layout version of this record
    pub format_version: u32,
    /// Key this record was stored under
    pub key: CacheKey,
    /// Signature of the scan that produced it
    pub signature: ScanSignature,
    /// Rendered manifest text
    pub manifest_text: String,
    /// When the run completed
    pub created_at: DateTime<Utc>,
    /// Per-file outcomes, in scan order
    pub entries: Vec<ProcessedEntry>,
    /// Stamps of the written outputs
    pub outputs: Vec<OutputStamp>,
}

impl CacheRecord {
    /// Creates a record stamped with the current time.
    ///
    /// Every written output in `entries` is stat'ed, so call this after the
    /// outputs are on disk. An output that cannot be stat'ed is left out of
    /// the stamps and makes [`CacheRecord::outputs_intact`] fail.
    #[must_use]
    pub fn new(
        key: CacheKey,
        signature: ScanSignature,
        manifest_text: String,
        entries: Vec<ProcessedEntry>,
    ) -> Self {
        let outputs = entries
            .iter()
            .filter_map(|processed| processed.outcome.output_path())
            .filter_map(OutputStamp::capture)
            .collect();
        Self {
            format_version: CACHE_FORMAT_VERSION,
            key,
            signature,
            manifest_text,
            created_at: Utc::now(),
            entries,
            outputs,
        }
    }

    /// Returns true if every written output of the cached run is still on
    /// disk, unchanged in size and modification time.
    #[must_use]
    pub fn outputs_intact(&self) -> bool {
        let written = self
            .entries
            .iter()
            .filter(|processed| processed.outcome.is_written())
            .count();
        written == self.outputs.len() && self.outputs.iter().all(OutputStamp::matches_disk)
    }
}

/// Key-value storage for [`CacheRecord`]s.
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Returns the stored record for `key`. Absence and unreadable records
    /// are both `None`.
    fn lookup(&self, key: &CacheKey) -> Option<CacheRecord>;

    /// Stores `record` under `key`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    fn store(&self, key: &CacheKey, record: CacheRecord) -> Result<()>;

    /// Drops the record for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing record cannot be removed.
    fn remove(&self, key: &CacheKey) -> Result<()>;
}

/// One JSON file per key inside a cache directory.
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    dir: PathBuf,
}

impl DirectoryCache {
    /// Creates a cache rooted at `dir`. The directory is created on the
    /// first store.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &CacheKey) -> Result<PathBuf> {
        let name = format!("{}.json", key.digest());
        Ok(security::validate_output_path(&self.dir, &name)?)
    }
}

impl CacheStore for DirectoryCache {
    fn lookup(&self, key: &CacheKey) -> Option<CacheRecord> {
        let path = self.record_path(key).ok()?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                trace!("No cache record at {}: {}", path.display(), e);
                return None;
            }
        };

        let record: CacheRecord = match serde_json::from_str(&text) {
            Ok(record) => record,
            Err(e) => {
                debug!("Ignoring unreadable cache record {}: {}", path.display(), e);
                return None;
            }
        };

        if record.format_version != CACHE_FORMAT_VERSION {
            debug!(
                "Ignoring cache record with format version {}",
                record.format_version
            );
            return None;
        }
        if record.key != *key {
            debug!("Ignoring cache record stored under a different key");
            return None;
        }
        Some(record)
    }

    fn store(&self, key: &CacheKey, record: CacheRecord) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let path = self.record_path(key)?;
        let json = serde_json::to_string(&record)?;

        let mut temp = NamedTempFile::new_in(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        temp.write_all(json.as_bytes())
            .map_err(|e| Error::io(temp.path(), e))?;
        temp.persist(&path).map_err(|e| Error::io(&path, e.error))?;

        debug!("Stored cache record {}", path.display());
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        let path = self.record_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed cache record {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&path, e)),
        }
    }
}

/// In-memory store, for tests and embedders that manage their own lifetime.
#[derive(Debug, Default)]
pub struct MemoryCache {
    records: Mutex<HashMap<CacheKey, CacheRecord>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCache {
    fn lookup(&self, key: &CacheKey) -> Option<CacheRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn store(&self, key: &CacheKey, record: CacheRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), record);
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Always misses; storing does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCache;

impl CacheStore for DisabledCache {
    fn lookup(&self, _key: &CacheKey) -> Option<CacheRecord> {
        None
    }

    fn store(&self, _key: &CacheKey, _record: CacheRecord) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _key: &CacheKey) -> Result<()> {
        Ok(())
    }
}

/// Opens the store selected by `config`.
#[must_use]
pub fn open_store(config: &Config) -> Arc<dyn CacheStore> {
    if config.use_cache {
        Arc::new(DirectoryCache::new(&config.cache_dir))
    } else {
        debug!("Cache disabled, every run recomputes");
        Arc::new(DisabledCache)
    }
}

/// Stores a record, logging instead of failing.
pub(crate) fn store_quietly(store: &dyn CacheStore, key: &CacheKey, record: CacheRecord) {
    if let Err(e) = store.store(key, record) {
        warn!("Failed to store cache record: {}", e);
    }
}

/// Drops a record, logging instead of failing.
pub(crate) fn remove_quietly(store: &dyn CacheStore, key: &CacheKey) {
    if let Err(e) = store.remove(key) {
        warn!("Failed to remove cache record: {}", e);
    }
}
