//! Command-line configuration.
//!
//! Every subcommand shares the [`DatasetArgs`] that locate the sources and
//! annotations and narrow them down with filters. Options can also be set
//! through environment variables with the `WSI_` prefix:
//!
//! - `WSI_CONFIG` - Source configuration file
//! - `WSI_ANNOTATIONS` - Annotation CSV
//! - `WSI_TILE_PX` / `WSI_TILE_UM` - Tile geometry
//! - `WSI_WORKER_PROGRAM` - Extraction worker executable
//! - `WSI_WORKERS` - Number of concurrent extractions (default: 4)
//! - `WSI_BUFFER` - Slide buffering directory
//! - `WSI_PLAN_LOG` - Validation plan log

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::annotations::LabelMode;
use crate::dataset::{Dataset, Filters};
use crate::error::DatasetError;
use crate::extract::{ExtractionParams, RoiMethod, SchedulerConfig, DEFAULT_WORKER_COUNT};
use crate::source::TileGeometry;
use crate::split::{SplitOptions, SplitStrategy, DEFAULT_VAL_FRACTION};

// =============================================================================
// CLI Structure
// =============================================================================

/// WSI Dataset - manifests, tile extraction and validation splits for
/// whole-slide image datasets.
#[derive(Parser, Debug, Clone)]
#[command(name = "wsi-dataset")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Refresh shard manifests and print per-shard tile counts.
    Manifest(ManifestConfig),

    /// Extract tiles from slides into shards.
    Extract(ExtractConfig),

    /// Resolve a training/validation split and print the group sizes.
    Split(SplitConfig),
}

// =============================================================================
// Shared Dataset Arguments
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct DatasetArgs {
    /// Source configuration file (JSON).
    #[arg(long, env = "WSI_CONFIG")]
    pub config: PathBuf,

    /// Source to load; repeat for several. Defaults to every source.
    #[arg(long = "source")]
    pub sources: Vec<String>,

    /// Annotation CSV with `patient` and optional `slide` columns.
    #[arg(long, env = "WSI_ANNOTATIONS")]
    pub annotations: Option<PathBuf>,

    /// Tile size in pixels.
    #[arg(long, env = "WSI_TILE_PX")]
    pub tile_px: Option<u32>,

    /// Tile size in microns.
    #[arg(long, env = "WSI_TILE_UM")]
    pub tile_um: Option<u32>,

    /// Keep slides whose column matches one of the values (`col=v1,v2`).
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    /// Drop slides with a blank value in this column.
    #[arg(long = "filter-blank")]
    pub filter_blank: Vec<String>,

    /// Drop shards with fewer tiles.
    #[arg(long)]
    pub min_tiles: Option<usize>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl DatasetArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.tile_px.is_some() != self.tile_um.is_some() {
            return Err("--tile-px and --tile-um must be given together".to_string());
        }
        if self.tile_px == Some(0) || self.tile_um == Some(0) {
            return Err("Tile size must be greater than 0".to_string());
        }
        self.parse_filters().map(|_| ())
    }

    pub fn geometry(&self) -> Option<TileGeometry> {
        match (self.tile_px, self.tile_um) {
            (Some(px), Some(um)) => Some(TileGeometry::new(px, um)),
            _ => None,
        }
    }

    /// Build the filter set from `--filter`, `--filter-blank` and `--min-tiles`.
    pub fn parse_filters(&self) -> Result<Filters, String> {
        let mut filters = Filters::new();
        for spec in &self.filters {
            let (column, values) = spec
                .split_once('=')
                .ok_or_else(|| format!("Invalid filter '{spec}'; expected column=value[,value]"))?;
            let column = column.trim();
            if column.is_empty() {
                return Err(format!("Invalid filter '{spec}'; column name is empty"));
            }
            let values: Vec<String> = values.split(',').map(|v| v.trim().to_string()).collect();
            filters = filters.with_column(column, values);
        }
        for column in &self.filter_blank {
            filters = filters.with_blank(column.as_str());
        }
        if let Some(min) = self.min_tiles {
            filters = filters.with_min_tiles(min);
        }
        Ok(filters)
    }

    /// Load the dataset and apply the command-line filters.
    pub fn open(&self) -> Result<Dataset, DatasetError> {
        let dataset = Dataset::open(
            &self.config,
            &self.sources,
            self.geometry(),
            self.annotations.as_deref(),
        )?;
        let filters = self.parse_filters().map_err(DatasetError::InvalidArgument)?;
        Ok(dataset.filter(&filters))
    }
}

// =============================================================================
// Manifest Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct ManifestConfig {
    #[command(flatten)]
    pub dataset: DatasetArgs,

    /// Recount every shard instead of only new ones.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

impl ManifestConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.dataset.validate()?;
        if self.dataset.geometry().is_none() {
            return Err("Manifests need a tile geometry; set --tile-px and --tile-um".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Extract Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct ExtractConfig {
    #[command(flatten)]
    pub dataset: DatasetArgs,

    /// Worker executable run once per slide.
    #[arg(long, env = "WSI_WORKER_PROGRAM")]
    pub worker_program: PathBuf,

    /// Extra argument passed to the worker before the action; repeatable.
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    pub worker_args: Vec<String>,

    /// Number of slides extracted at once.
    #[arg(long, default_value_t = DEFAULT_WORKER_COUNT, env = "WSI_WORKERS")]
    pub workers: usize,

    /// Stride divisor (2 gives 50% overlap).
    #[arg(long, default_value_t = 1)]
    pub stride_div: u32,

    /// Read tiles from downsampled pyramid levels.
    #[arg(long, default_value_t = false)]
    pub enable_downsample: bool,

    /// How ROIs restrict tile locations.
    #[arg(long, default_value_t = RoiMethod::Inside)]
    pub roi_method: RoiMethod,

    /// Extract slides that have no ROI file.
    #[arg(long, default_value_t = false)]
    pub allow_missing_roi: bool,

    /// Randomize the origin of the tile grid.
    #[arg(long, default_value_t = false)]
    pub randomize_origin: bool,

    /// Copy slides to this directory before extraction.
    #[arg(long, env = "WSI_BUFFER")]
    pub buffer: Option<PathBuf>,

    /// Also write loose tile images.
    #[arg(long, default_value_t = false)]
    pub save_tiles: bool,

    /// Do not write shards.
    #[arg(long, default_value_t = false)]
    pub no_shards: bool,

    /// Re-extract slides that already have a shard.
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,
}

impl ExtractConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.dataset.validate()?;
        if self.dataset.geometry().is_none() {
            return Err("Extraction needs a tile geometry; set --tile-px and --tile-um".to_string());
        }
        if self.workers == 0 {
            return Err("workers must be greater than 0".to_string());
        }
        if self.stride_div == 0 {
            return Err("stride_div must be greater than 0".to_string());
        }
        if self.no_shards && !self.save_tiles {
            return Err("Nothing to write; drop --no-shards or add --save-tiles".to_string());
        }
        Ok(())
    }

    /// Scheduler settings. Call [`validate`](Self::validate) first.
    pub fn scheduler_config(&self) -> Option<SchedulerConfig> {
        let geometry = self.dataset.geometry()?;
        let mut params = ExtractionParams::new(geometry.tile_px, geometry.tile_um);
        params.stride_div = self.stride_div;
        params.enable_downsample = self.enable_downsample;
        params.roi_method = self.roi_method;
        params.skip_missing_roi = !self.allow_missing_roi;
        params.randomize_origin = self.randomize_origin;

        let mut config = SchedulerConfig::new(params);
        config.worker_count = self.workers;
        config.buffer_dir = self.buffer.clone();
        config.save_shards = !self.no_shards;
        config.save_tiles = self.save_tiles;
        config.skip_extracted = !self.overwrite;
        Some(config)
    }
}

// =============================================================================
// Split Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct SplitConfig {
    #[command(flatten)]
    pub dataset: DatasetArgs,

    /// Annotation column holding the outcome.
    #[arg(long)]
    pub outcome: String,

    /// none, fixed, bootstrap, k-fold or k-fold-preserved-site.
    #[arg(long, default_value = "fixed")]
    pub strategy: SplitStrategy,

    /// categorical, continuous or auto.
    #[arg(long, default_value = "auto")]
    pub label_mode: LabelMode,

    /// Fraction of patients held out by fixed and bootstrap splits.
    #[arg(long, default_value_t = DEFAULT_VAL_FRACTION)]
    pub val_fraction: f64,

    /// Number of folds.
    #[arg(long)]
    pub k_fold: Option<usize>,

    /// Fold used for validation (1-based).
    #[arg(long)]
    pub k_fold_iter: Option<usize>,

    /// Validation plan log.
    #[arg(long, env = "WSI_PLAN_LOG")]
    pub plan_log: Option<PathBuf>,

    /// Never write the plan log.
    #[arg(long, default_value_t = false)]
    pub read_only: bool,

    /// Shuffle seed.
    #[arg(long)]
    pub seed: Option<u64>,
}

impl SplitConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.dataset.validate()?;
        if self.dataset.geometry().is_none() {
            return Err("Splits need a tile geometry; set --tile-px and --tile-um".to_string());
        }
        if self.outcome.trim().is_empty() {
            return Err("--outcome must name an annotation column".to_string());
        }
        self.split_options().validate().map_err(|e| e.to_string())
    }

    pub fn split_options(&self) -> SplitOptions {
        let mut options = SplitOptions::new(self.strategy, self.outcome.clone())
            .with_fraction(self.val_fraction)
            .with_label_mode(self.label_mode)
            .read_only(self.read_only);
        options.k_fold = self.k_fold;
        options.k_fold_iter = self.k_fold_iter;
        options.plan_log = self.plan_log.clone();
        options.seed = self.seed;
        options
    }
}

// =============================================================================
// Tests
// =============================================================================
