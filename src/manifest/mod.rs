//! Shard manifests.
//!
//! A manifest maps each shard in a directory to its record count. The
//! [`ManifestCache`] builds manifests lazily, persists them next to the
//! shards, and merges them across sources.

mod cache;

pub use cache::{
    apply_clip, DirManifest, ManifestCache, ManifestEntry, DEFAULT_MANIFEST_CACHE_CAPACITY,
    MANIFEST_FILE,
};
