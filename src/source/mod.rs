//! Data source configuration.
//!
//! A dataset draws slides from one or more named sources. Each source has a
//! slide root, a loose-tile root, a shard root and a region-of-interest root.
//! Slide discovery walks the slide root for known whole-slide extensions.

mod registry;

pub use registry::{Source, SourceConfig, SourceRegistry, TileGeometry};

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// File extensions recognized as whole-slide images.
pub const SLIDE_EXTENSIONS: &[&str] = &[
    "svs", "tif", "tiff", "ndpi", "vms", "vmu", "scn", "mrxs", "svslide", "bif", "jpg", "jpeg",
    "png",
];

/// Derive a slide name from its path (file name without extension).
pub fn path_to_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Recursively list slide files under `root`, sorted.
///
/// A missing root yields an empty list.
pub fn find_slide_paths(root: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| has_slide_extension(path))
        .collect();
    paths.sort();
    paths
}

fn has_slide_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            SLIDE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}
