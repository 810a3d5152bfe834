//! Shard files: one file of tile records per slide.
//!
//! A shard for slide `s` lives at `<shard_dir>/s.tfrecords`. While a slide is
//! being extracted, a sibling `s.unfinished` marker exists; shards with a
//! marker are treated as incomplete everywhere.

mod codec;

pub use codec::{FramedCodec, RecordSchema, ShardCodec, TileRecord};

use std::fs;
use std::path::{Path, PathBuf};

use crate::source::path_to_name;

/// Extension of shard files.
pub const SHARD_EXTENSION: &str = "tfrecords";

/// Extension of interrupted-extraction markers.
pub const UNFINISHED_EXTENSION: &str = "unfinished";

/// Shard path for a slide within a shard directory.
pub fn shard_path(dir: &Path, slide: &str) -> PathBuf {
    dir.join(format!("{slide}.{SHARD_EXTENSION}"))
}

/// Unfinished-marker path for a slide within a shard directory.
pub fn unfinished_marker(dir: &Path, slide: &str) -> PathBuf {
    dir.join(format!("{slide}.{UNFINISHED_EXTENSION}"))
}

fn list_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == extension))
        .collect();
    paths.sort();
    paths
}

/// Shard files directly inside `dir`, sorted. A missing directory is empty.
pub fn list_shards(dir: &Path) -> Vec<PathBuf> {
    list_with_extension(dir, SHARD_EXTENSION)
}

/// Slide names with an unfinished marker in `dir`.
pub fn unfinished_slides(dir: &Path) -> Vec<String> {
    list_with_extension(dir, UNFINISHED_EXTENSION)
        .iter()
        .map(|p| path_to_name(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(shard_path(dir.path(), "a"), b"").unwrap();
        fs::write(shard_path(dir.path(), "b"), b"").unwrap();
        fs::write(unfinished_marker(dir.path(), "b"), b"").unwrap();
        fs::write(dir.path().join("manifest.json"), b"{}").unwrap();

        let shards = list_shards(dir.path());
        assert_eq!(shards.len(), 2);
        assert_eq!(unfinished_slides(dir.path()), vec!["b".to_string()]);
    }
}
