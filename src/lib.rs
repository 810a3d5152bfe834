//! # WSI Dataset
//!
//! Dataset management for whole-slide image (WSI) pipelines.
//!
//! A dataset is a set of named sources (slide, tile, shard and ROI roots) plus
//! an annotation table linking slides to patients and outcomes. On top of
//! that, this crate provides:
//!
//! - **Filtered views**: immutable [`Dataset`] views narrowed by column
//!   filters, blank filters and minimum tile counts
//! - **Manifests**: lazily computed, incrementally refreshed per-shard tile
//!   counts, persisted as `manifest.json` next to the shards
//! - **Clipping and balancing**: per-slide tile caps and sampling weights by
//!   tile, slide, patient or category
//! - **Extraction**: a concurrent scheduler that runs each slide through an
//!   isolated worker, retries corrupt slides without downsampling and
//!   reports per-slide outcomes
//! - **Splits**: reproducible patient-level training/validation splits with a
//!   persisted plan log
//!
//! ## Architecture
//!
//! - [`source`] - Source configuration and slide discovery
//! - [`annotations`] - Annotation table, labels and slide association
//! - [`shard`] - Shard files and the record codec
//! - [`manifest`] - Manifest cache
//! - [`dataset`] - Dataset views, filters, clipping and balancing
//! - [`extract`] - Extraction scheduler and worker contract
//! - [`split`] - Validation plans and the split planner
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use wsi_dataset::{Dataset, Filters, SplitOptions, SplitStrategy, TileGeometry};
//!
//! let dataset = Dataset::open(
//!     Path::new("sources.json"),
//!     &[],
//!     Some(TileGeometry::new(299, 302)),
//!     Some(Path::new("annotations.csv")),
//! )
//! .unwrap();
//!
//! let view = dataset.filter(&Filters::new().with_column("site", ["A", "B"]).with_min_tiles(10));
//! let options = SplitOptions::new(SplitStrategy::KFold, "category").with_k_fold(3, 1);
//! let (training, validation) = view.training_validation_split(&options).unwrap();
//! ```

pub mod annotations;
pub mod config;
pub mod dataset;
pub mod error;
pub mod extract;
pub mod manifest;
pub mod shard;
pub mod source;
pub mod split;

// Re-export commonly used types
pub use annotations::{
    associate_slides, AnnotationRow, AnnotationTable, LabelMode, OutcomeLabel, SlideLabels,
};
pub use config::{Cli, Command, DatasetArgs, ExtractConfig, ManifestConfig, SplitConfig};
pub use dataset::{BalanceStrategy, ClipOptions, ClipStrategy, Dataset, Filters};
pub use error::{DatasetError, ExtractError, ManifestError, ShardError, SplitError};
pub use extract::{
    export_tiles, CancelHandle, ExtractionParams, ExtractionScheduler, ExtractionSummary,
    ProcessWorker, ProgressCounter, RoiMethod, SchedulerConfig, SlideJob, SlideOutcome,
    SlideReport, SlideWorker, WorkerReport,
};
pub use manifest::{ManifestCache, ManifestEntry};
pub use shard::{FramedCodec, ShardCodec, TileRecord};
pub use source::{Source, SourceConfig, SourceRegistry, TileGeometry};
pub use split::{
    DatasetSplit, GreedySiteSolver, PlanLog, SiteSolver, SplitOptions, SplitPlanner,
    SplitStrategy, ValidationPlan,
};
