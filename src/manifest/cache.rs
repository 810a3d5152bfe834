//! Per-directory manifest cache.
//!
//! Each shard directory carries a `manifest.json` mapping shard file name to
//! its record count:
//!
//! ```text
//! {"slide-1.tfrecords": {"total": 412}, "slide-2.tfrecords": {"total": 97}}
//! ```
//!
//! The first access to a directory without a manifest scans every shard once
//! and writes the file. Later accesses reuse it. Parsed manifests are kept in
//! an LRU keyed by directory so repeated dataset queries don't re-read JSON.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Span};

use crate::error::ManifestError;
use crate::shard::{list_shards, unfinished_marker, FramedCodec, ShardCodec};
use crate::source::path_to_name;

/// Name of the manifest file inside a shard directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Default number of directory manifests kept in memory.
pub const DEFAULT_MANIFEST_CACHE_CAPACITY: usize = 64;

/// On-disk manifest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct ManifestRecord {
    total: usize,
}

/// Tile counts for one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Records in the shard
    pub total: usize,

    /// Records considered active after clipping (`<= total`)
    pub clipped: usize,
}

impl ManifestEntry {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            clipped: total,
        }
    }

    pub fn with_clip(total: usize, clip: Option<usize>) -> Self {
        Self {
            total,
            clipped: clip.map_or(total, |c| c.min(total)),
        }
    }
}

/// Shard file name → total records, for one directory.
pub type DirManifest = BTreeMap<String, usize>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// ManifestCache
// =============================================================================

/// Lazily built, disk-backed shard manifests.
pub struct ManifestCache {
    /// Codec used to count shard records
    codec: Arc<dyn ShardCodec>,

    /// Parsed manifests by directory
    loaded: Mutex<LruCache<PathBuf, Arc<DirManifest>>>,

    /// Directories that referenced a missing shard and must be rescanned
    stale: Mutex<HashSet<PathBuf>>,

    span: Span,
}

impl Default for ManifestCache {
    fn default() -> Self {
        Self::new(Arc::new(FramedCodec))
    }
}

impl ManifestCache {
    pub fn new(codec: Arc<dyn ShardCodec>) -> Self {
        Self::with_capacity(codec, DEFAULT_MANIFEST_CACHE_CAPACITY)
    }

    pub fn with_capacity(codec: Arc<dyn ShardCodec>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            codec,
            loaded: Mutex::new(LruCache::new(capacity)),
            stale: Mutex::new(HashSet::new()),
            span: info_span!("manifest"),
        }
    }

    /// Use `span` as the parent for this cache's log events.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn codec(&self) -> &Arc<dyn ShardCodec> {
        &self.codec
    }

    /// Manifest for one directory, building it on first access.
    pub fn load_dir(&self, dir: &Path) -> Result<Arc<DirManifest>, ManifestError> {
        let is_stale = lock(&self.stale).contains(dir);
        if !is_stale {
            if let Some(manifest) = lock(&self.loaded).get(dir) {
                return Ok(Arc::clone(manifest));
            }
        }

        let manifest_path = dir.join(MANIFEST_FILE);
        if is_stale || !manifest_path.exists() {
            if !is_stale {
                let _enter = self.span.enter();
                info!(
                    "No manifest file detected in {}; will create now",
                    dir.display()
                );
            }
            return self.update_dir(dir, false);
        }

        let manifest = Arc::new(read_manifest(&manifest_path)?);
        lock(&self.loaded).put(dir.to_path_buf(), Arc::clone(&manifest));
        Ok(manifest)
    }

    /// Rescan a directory and rewrite its manifest.
    ///
    /// Without `force`, shards already in the manifest keep their counts and
    /// only new shards are scanned. Vanished shards are always dropped.
    pub fn update_dir(&self, dir: &Path, force: bool) -> Result<Arc<DirManifest>, ManifestError> {
        self.refresh(dir, force, &HashSet::new())
    }

    /// Incremental update that also recounts the shards of `slides`.
    ///
    /// Used after rewriting shards in place, when a cached count would be stale.
    pub fn rescan_slides(
        &self,
        dir: &Path,
        slides: &[String],
    ) -> Result<Arc<DirManifest>, ManifestError> {
        let slides: HashSet<&str> = slides.iter().map(String::as_str).collect();
        self.refresh(dir, false, &slides)
    }

    fn refresh(
        &self,
        dir: &Path,
        force: bool,
        rescan: &HashSet<&str>,
    ) -> Result<Arc<DirManifest>, ManifestError> {
        let _enter = self.span.enter();
        lock(&self.stale).remove(dir);

        if !dir.is_dir() {
            debug!("Shard directory {} does not exist", dir.display());
            let manifest = Arc::new(DirManifest::new());
            lock(&self.loaded).put(dir.to_path_buf(), Arc::clone(&manifest));
            return Ok(manifest);
        }

        let manifest_path = dir.join(MANIFEST_FILE);
        let previous = if !force && manifest_path.exists() {
            read_manifest(&manifest_path)?
        } else {
            DirManifest::new()
        };

        let mut manifest = DirManifest::new();
        let mut scanned = 0;
        for shard in list_shards(dir) {
            let Some(name) = shard.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let slide = path_to_name(&shard);
            if unfinished_marker(dir, &slide).exists() {
                debug!("Skipping unfinished shard {}", shard.display());
                continue;
            }
            if !rescan.contains(slide.as_str()) {
                if let Some(total) = previous.get(&name) {
                    manifest.insert(name, *total);
                    continue;
                }
            }
            match self.codec.count_records(&shard) {
                Ok(total) => {
                    debug!("Counted {} records in {}", total, name);
                    manifest.insert(name, total);
                    scanned += 1;
                }
                Err(e) => warn!("Unable to count records in {}: {}", shard.display(), e),
            }
        }

        if scanned > 0 || force || manifest.len() != previous.len() || !manifest_path.exists() {
            write_manifest(&manifest_path, &manifest)?;
            debug!(
                "Wrote manifest for {} ({} shards, {} scanned)",
                dir.display(),
                manifest.len(),
                scanned
            );
        }

        let manifest = Arc::new(manifest);
        lock(&self.loaded).put(dir.to_path_buf(), Arc::clone(&manifest));
        Ok(manifest)
    }

    /// Merge the manifests of several directories, keyed by absolute shard path.
    pub fn merged(&self, dirs: &[PathBuf]) -> Result<BTreeMap<PathBuf, usize>, ManifestError> {
        let mut combined = BTreeMap::new();
        for dir in dirs {
            let manifest = self.load_dir(dir)?;
            for (name, total) in manifest.iter() {
                combined.insert(dir.join(name), *total);
            }
        }
        Ok(combined)
    }

    /// Flag a directory so its next access rescans missing shards.
    pub fn mark_stale(&self, dir: &Path) {
        lock(&self.stale).insert(dir.to_path_buf());
    }

    /// Drop the in-memory copy of a directory's manifest.
    pub fn invalidate(&self, dir: &Path) {
        lock(&self.loaded).pop(dir);
    }
}

/// Apply a clip map to raw totals.
pub fn apply_clip(
    totals: &BTreeMap<PathBuf, usize>,
    clip: &HashMap<PathBuf, usize>,
) -> BTreeMap<PathBuf, ManifestEntry> {
    totals
        .iter()
        .map(|(path, total)| {
            (
                path.clone(),
                ManifestEntry::with_clip(*total, clip.get(path).copied()),
            )
        })
        .collect()
}

fn read_manifest(path: &Path) -> Result<DirManifest, ManifestError> {
    let text = fs::read_to_string(path).map_err(|e| ManifestError::io(path, e))?;
    let records: BTreeMap<String, ManifestRecord> =
        serde_json::from_str(&text).map_err(|e| ManifestError::Json {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    Ok(records.into_iter().map(|(k, v)| (k, v.total)).collect())
}

fn write_manifest(path: &Path, manifest: &DirManifest) -> Result<(), ManifestError> {
    let records: BTreeMap<&str, ManifestRecord> = manifest
        .iter()
        .map(|(k, v)| (k.as_str(), ManifestRecord { total: *v }))
        .collect();
    let json = serde_json::to_string_pretty(&records).map_err(|e| ManifestError::Json {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, json).map_err(|e| ManifestError::io(&staging, e))?;
    fs::rename(&staging, path).map_err(|e| ManifestError::io(path, e))
}

// =============================================================================
// Tests
// =============================================================================
