//! Source registry: maps source names to their slide, tile, shard and ROI roots.
//!
//! The registry is loaded once from a JSON config file and never mutated
//! afterwards. The geometry label (`"{px}px_{um}um"`) selects the shard and
//! tile subdirectory used for a given extraction geometry.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DatasetError;

// =============================================================================
// Tile Geometry
// =============================================================================

/// Tile size in pixels and microns.
///
/// Two datasets with the same geometry share shard directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileGeometry {
    /// Tile width/height in pixels
    pub tile_px: u32,

    /// Tile width/height in microns
    pub tile_um: u32,
}

impl TileGeometry {
    pub fn new(tile_px: u32, tile_um: u32) -> Self {
        Self { tile_px, tile_um }
    }

    /// Directory label for this geometry, e.g. `299px_302um`.
    pub fn label(&self) -> String {
        format!("{}px_{}um", self.tile_px, self.tile_um)
    }
}

// =============================================================================
// Source
// =============================================================================

/// Raw entry of the source config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory containing the slide images
    pub slides: PathBuf,

    /// Directory for loose tile images
    pub tiles: PathBuf,

    /// Directory for shard files
    pub tfrecords: PathBuf,

    /// Directory containing region-of-interest CSVs
    pub roi: PathBuf,
}

/// A configured data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub slides: PathBuf,
    pub tiles: PathBuf,
    pub tfrecords: PathBuf,
    pub roi: PathBuf,

    /// Geometry label; `None` until a geometry is set
    pub label: Option<String>,
}

impl Source {
    fn from_config(name: &str, config: SourceConfig, label: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            slides: config.slides,
            tiles: config.tiles,
            tfrecords: config.tfrecords,
            roi: config.roi,
            label,
        }
    }

    /// Shard directory for this source's geometry.
    pub fn shard_dir(&self) -> Option<PathBuf> {
        self.label.as_ref().map(|label| self.tfrecords.join(label))
    }

    /// Loose tile directory for this source's geometry.
    pub fn tile_dir(&self) -> Option<PathBuf> {
        self.label.as_ref().map(|label| self.tiles.join(label))
    }
}

// =============================================================================
// SourceRegistry
// =============================================================================

/// Immutable lookup of the sources selected for a dataset.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Source>,
}

impl SourceRegistry {
    /// Load the named sources from a JSON config file, or every source when
    /// `names` is empty.
    ///
    /// Fails if any requested name is not present in the file.
    pub fn load(
        config_path: &Path,
        names: &[String],
        geometry: Option<TileGeometry>,
    ) -> Result<Self, DatasetError> {
        let text = fs::read_to_string(config_path).map_err(|e| DatasetError::io(config_path, e))?;
        let mut config: BTreeMap<String, SourceConfig> =
            serde_json::from_str(&text).map_err(|e| DatasetError::InvalidConfig {
                path: config_path.to_path_buf(),
                message: e.to_string(),
            })?;

        let label = geometry.map(|g| g.label());
        let mut sources = BTreeMap::new();
        if names.is_empty() {
            for (name, entry) in config {
                let source = Source::from_config(&name, entry, label.clone());
                sources.insert(name, source);
            }
            return Ok(Self { sources });
        }
        for name in names {
            let entry = config
                .remove(name)
                .ok_or_else(|| DatasetError::UnknownSource {
                    name: name.clone(),
                    path: config_path.to_path_buf(),
                })?;
            sources.insert(name.clone(), Source::from_config(name, entry, label.clone()));
        }

        Ok(Self { sources })
    }

    /// Build a registry directly from configs (used by tests and embedding callers).
    pub fn from_configs(
        configs: impl IntoIterator<Item = (String, SourceConfig)>,
        geometry: Option<TileGeometry>,
    ) -> Self {
        let label = geometry.map(|g| g.label());
        let sources = configs
            .into_iter()
            .map(|(name, config)| {
                let source = Source::from_config(&name, config, label.clone());
                (name, source)
            })
            .collect();
        Self { sources }
    }

    /// Look up a source by name.
    pub fn get(&self, name: &str) -> Result<&Source, DatasetError> {
        self.sources
            .get(name)
            .ok_or_else(|| DatasetError::UnknownSource {
                name: name.to_string(),
                path: PathBuf::new(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Shard directories of every source with a geometry label.
    pub fn shard_dirs(&self) -> Vec<PathBuf> {
        self.sources.values().filter_map(Source::shard_dir).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
