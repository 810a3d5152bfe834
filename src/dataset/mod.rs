//! Dataset views over sources, annotations and shard manifests.
//!
//! A [`Dataset`] is cheap to clone: the loaded sources, annotation table and
//! manifest cache sit behind an `Arc`, while filters, clip map and balancing
//! weights belong to the view. Every operation that changes a view returns a
//! new one and leaves the receiver untouched.

mod balance;
mod filter;

pub use balance::{BalanceStrategy, ClipOptions, ClipStrategy};
pub use filter::{patient_alias_match, select_slides, Filters};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Span};

use crate::annotations::{
    associate_slides, is_blank, AnnotationTable, LabelMode, SlideLabels,
};
use crate::error::DatasetError;
use crate::manifest::{apply_clip, ManifestCache, ManifestEntry};
use crate::shard::{list_shards, unfinished_marker};
use crate::source::{find_slide_paths, path_to_name, SourceRegistry, TileGeometry};

/// Number of missing-slide warnings logged before summarizing.
const SLIDE_WARN_THRESHOLD: usize = 3;

/// State shared by every view derived from one dataset.
struct DatasetContext {
    sources: SourceRegistry,
    annotations: AnnotationTable,
    manifests: ManifestCache,
    span: Span,
}

/// A filtered, optionally clipped and balanced view of a dataset.
#[derive(Clone)]
pub struct Dataset {
    context: Arc<DatasetContext>,
    filters: Filters,
    clip: Arc<HashMap<PathBuf, usize>>,
    weights: Option<Arc<BTreeMap<PathBuf, f64>>>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("sources", &self.context.sources.names().collect::<Vec<_>>())
            .field("filters", &self.filters)
            .field("clipped", &self.clip.len())
            .field("balanced", &self.weights.is_some())
            .finish()
    }
}

impl Dataset {
    /// Build a dataset from already loaded parts.
    pub fn new(sources: SourceRegistry, annotations: AnnotationTable) -> Self {
        Self::with_parts(
            sources,
            annotations,
            ManifestCache::default(),
            info_span!("dataset"),
        )
    }

    /// Build a dataset with an explicit manifest cache and log span.
    pub fn with_parts(
        sources: SourceRegistry,
        annotations: AnnotationTable,
        manifests: ManifestCache,
        span: Span,
    ) -> Self {
        let manifests = manifests.with_span(span.clone());
        Self {
            context: Arc::new(DatasetContext {
                sources,
                annotations,
                manifests,
                span,
            }),
            filters: Filters::default(),
            clip: Arc::new(HashMap::new()),
            weights: None,
        }
    }

    /// Load sources from `config_path` and annotations from `annotations`.
    ///
    /// When the annotation file has no slide column, slides found under the
    /// sources are associated with patients and the file is rewritten (the
    /// original is kept as a backup). A missing annotation file is logged and
    /// yields an empty table.
    pub fn open(
        config_path: &Path,
        source_names: &[String],
        geometry: Option<TileGeometry>,
        annotations: Option<&Path>,
    ) -> Result<Self, DatasetError> {
        let span = info_span!("dataset");
        let _enter = span.enter();

        let sources = SourceRegistry::load(config_path, source_names, geometry)?;
        let table = match annotations {
            Some(path) if path.exists() => {
                let mut table = AnnotationTable::load(path)?;
                if !table.has_slide_column() {
                    info!("Slide column not found; associating patients with slides");
                    let slide_paths: Vec<PathBuf> = sources
                        .iter()
                        .flat_map(|source| find_slide_paths(&source.slides))
                        .collect();
                    let summary = associate_slides(path, &slide_paths)?;
                    info!(
                        "Associated {} slides ({} rows without slide, {} ambiguous)",
                        summary.updated, summary.missing, summary.ambiguous
                    );
                    table = AnnotationTable::load(path)?;
                }
                table
            }
            Some(path) => {
                warn!(
                    "Unable to load annotations from {}; file does not exist",
                    path.display()
                );
                AnnotationTable::default()
            }
            None => AnnotationTable::default(),
        };

        drop(_enter);
        Ok(Self::with_parts(
            sources,
            table,
            ManifestCache::default(),
            span,
        ))
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.context.sources
    }

    pub fn annotations(&self) -> &AnnotationTable {
        &self.context.annotations
    }

    pub fn manifest_cache(&self) -> &ManifestCache {
        &self.context.manifests
    }

    pub fn span(&self) -> &Span {
        &self.context.span
    }

    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    /// Active clip map (shard path → maximum tiles).
    pub fn clip_map(&self) -> &HashMap<PathBuf, usize> {
        &self.clip
    }

    /// Sampling weights from the last [`balance`](Self::balance), if any.
    pub fn prob_weights(&self) -> Option<&BTreeMap<PathBuf, f64>> {
        self.weights.as_deref()
    }

    // -------------------------------------------------------------------------
    // Filtering
    // -------------------------------------------------------------------------

    fn with_filters(&self, filters: Filters) -> Dataset {
        Dataset {
            context: Arc::clone(&self.context),
            filters,
            clip: Arc::new(HashMap::new()),
            weights: None,
        }
    }

    /// New view with `filters` merged into the active filters.
    ///
    /// Clip maps and weights are derived from the old slide set and are dropped.
    pub fn filter(&self, filters: &Filters) -> Dataset {
        self.with_filters(self.filters.merge(filters))
    }

    /// New view without the named column and blank filters.
    pub fn remove_filter(&self, columns: &[&str], blank: &[&str]) -> Result<Dataset, DatasetError> {
        Ok(self.with_filters(self.filters.without(columns, blank)?))
    }

    /// New view with no filters.
    pub fn clear_filters(&self) -> Dataset {
        self.with_filters(Filters::default())
    }

    /// Names of the slides passing every filter, in annotation order.
    pub fn slides(&self) -> Result<Vec<String>, DatasetError> {
        let _enter = self.span().enter();
        if self.annotations().is_empty() {
            error!("No annotations loaded; is the annotations file empty?");
        }
        let mut seen = HashSet::new();
        let slides = select_slides(self.annotations(), &self.filters)?
            .into_iter()
            .filter(|slide| seen.insert(slide.clone()))
            .collect();
        Ok(slides)
    }

    fn slide_set(&self) -> Result<BTreeSet<String>, DatasetError> {
        Ok(self.slides()?.into_iter().collect())
    }

    /// Slide → patient for every annotated slide.
    pub fn patients(&self) -> Result<BTreeMap<String, String>, DatasetError> {
        let mut patients: BTreeMap<String, String> = BTreeMap::new();
        for row in self.annotations().rows() {
            let slide = row.slide();
            if is_blank(slide) {
                continue;
            }
            match patients.get(slide) {
                Some(existing) if existing != row.patient() => {
                    return Err(DatasetError::ConflictingPatient {
                        slide: slide.to_string(),
                        first: existing.clone(),
                        second: row.patient().to_string(),
                    })
                }
                Some(_) => {}
                None => {
                    patients.insert(slide.to_string(), row.patient().to_string());
                }
            }
        }
        Ok(patients)
    }

    /// Slide files under one source (or all sources), deduplicated.
    ///
    /// With `apply_filters`, only slides in [`slides`](Self::slides) are kept.
    pub fn slide_paths(
        &self,
        source: Option<&str>,
        apply_filters: bool,
    ) -> Result<Vec<PathBuf>, DatasetError> {
        let roots: Vec<&Path> = match source {
            Some(name) => vec![self.sources().get(name)?.slides.as_path()],
            None => self.sources().iter().map(|s| s.slides.as_path()).collect(),
        };
        let paths: BTreeSet<PathBuf> = roots
            .into_iter()
            .flat_map(find_slide_paths)
            .collect();

        if !apply_filters {
            return Ok(paths.into_iter().collect());
        }
        let slides = self.slide_set()?;
        Ok(paths
            .into_iter()
            .filter(|path| slides.contains(&path_to_name(path)))
            .collect())
    }

    /// Region-of-interest CSV files across all sources.
    pub fn rois(&self) -> Vec<PathBuf> {
        let mut rois: BTreeSet<PathBuf> = BTreeSet::new();
        for source in self.sources().iter() {
            let Ok(entries) = fs::read_dir(&source.roi) else {
                continue;
            };
            rois.extend(
                entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.path())
                    .filter(|path| path.extension().is_some_and(|ext| ext == "csv")),
            );
        }
        rois.into_iter().collect()
    }

    /// Check that no slide is annotated twice, and warn about patients with no slide.
    pub fn verify_annotations_slides(&self) -> Result<(), DatasetError> {
        let _enter = self.span().enter();
        let slides = select_slides(self.annotations(), &self.filters)?;
        let mut seen = HashSet::new();
        for slide in &slides {
            if !seen.insert(slide.as_str()) {
                error!("Duplicate slide names detected in the annotation file");
                return Err(DatasetError::DuplicateSlide(slide.clone()));
            }
        }

        let mut num_warned = 0;
        for row in self.annotations().rows() {
            if is_blank(row.slide()) {
                if num_warned < SLIDE_WARN_THRESHOLD {
                    warn!("Patient {} has no slide assigned", row.patient());
                }
                num_warned += 1;
            }
        }
        if num_warned >= SLIDE_WARN_THRESHOLD {
            warn!("...{} total patients without a slide", num_warned);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Shards and manifests
    // -------------------------------------------------------------------------

    /// Shard directories of every source with a geometry.
    pub fn shard_folders(&self) -> Vec<PathBuf> {
        self.sources().shard_dirs()
    }

    /// Completed shard files in the shard folders, before any filtering.
    fn all_shards(&self) -> Vec<PathBuf> {
        let mut shards = Vec::new();
        for dir in self.shard_folders() {
            if !dir.is_dir() {
                warn!("Shard directory not found: {}", dir.display());
                continue;
            }
            shards.extend(
                list_shards(&dir)
                    .into_iter()
                    .filter(|shard| !unfinished_marker(&dir, &path_to_name(shard)).exists()),
            );
        }
        shards
    }

    /// Shards of the slides passing every filter, minus those below `min_tiles`.
    pub fn shards(&self) -> Result<Vec<PathBuf>, DatasetError> {
        let _enter = self.span().enter();
        let mut shards = self.all_shards();

        if self.annotations().is_empty() {
            warn!("No annotations loaded; unable to filter shard list");
        } else {
            let slides = self.slide_set()?;
            shards.retain(|shard| slides.contains(&path_to_name(shard)));
        }

        let min_tiles = self.filters.min_tiles();
        if min_tiles > 0 {
            let totals = self.manifest_totals()?;
            shards.retain(|shard| totals.get(shard).copied().unwrap_or(0) >= min_tiles);
        }
        Ok(shards)
    }

    /// Shards in `subfolder` of every shard directory, ignoring filters.
    pub fn shards_in_subfolder(&self, subfolder: &str) -> Result<Vec<PathBuf>, DatasetError> {
        let mut shards = Vec::new();
        for source in self.sources().iter() {
            let Some(base) = source.shard_dir() else {
                continue;
            };
            let dir = base.join(subfolder);
            if !dir.is_dir() {
                error!(
                    "Unable to find subfolder {} in source {}",
                    subfolder, source.name
                );
                return Err(DatasetError::MissingSubfolder {
                    subfolder: subfolder.to_string(),
                    source_name: source.name.clone(),
                    path: base,
                });
            }
            shards.extend(list_shards(&dir));
        }
        Ok(shards)
    }

    /// Unfiltered shard totals merged across sources.
    fn manifest_totals(&self) -> Result<BTreeMap<PathBuf, usize>, DatasetError> {
        Ok(self.manifest_cache().merged(&self.shard_folders())?)
    }

    /// Tile counts of the active shards, with the clip map applied.
    ///
    /// An active shard missing from its directory's manifest counts as zero
    /// tiles and marks the directory for rescanning.
    pub fn manifest(&self) -> Result<BTreeMap<PathBuf, ManifestEntry>, DatasetError> {
        let totals = self.manifest_totals()?;
        let shards = self.shards()?;

        let _enter = self.span().enter();
        let mut active = BTreeMap::new();
        for shard in shards {
            let total = match totals.get(&shard) {
                Some(total) => *total,
                None => {
                    warn!("Shard {} missing from manifest; counting 0 tiles", shard.display());
                    if let Some(dir) = shard.parent() {
                        self.manifest_cache().mark_stale(dir);
                    }
                    0
                }
            };
            active.insert(shard, total);
        }
        Ok(apply_clip(&active, &self.clip))
    }

    /// Rescan every shard directory. `force` recounts shards already cached.
    pub fn update_manifest(&self, force: bool) -> Result<(), DatasetError> {
        for dir in self.shard_folders() {
            self.manifest_cache().update_dir(&dir, force)?;
        }
        Ok(())
    }

    /// Total active tiles after clipping.
    pub fn num_tiles(&self) -> Result<usize, DatasetError> {
        Ok(self.manifest()?.values().map(|entry| entry.clipped).sum())
    }

    // -------------------------------------------------------------------------
    // Labels
    // -------------------------------------------------------------------------

    /// Outcome labels of the active slides in `column`.
    pub fn labels(&self, column: &str, mode: LabelMode) -> Result<SlideLabels, DatasetError> {
        let _enter = self.span().enter();
        let slides = self.slide_set()?;
        self.annotations().labels(column, mode, &slides)
    }

    /// Whether every active slide's value in `column` parses as a float.
    pub fn is_float(&self, column: &str) -> Result<bool, DatasetError> {
        let slides = self.slide_set()?;
        self.annotations().is_float(column, &slides)
    }

    /// New view without a clip map.
    pub fn unclip(&self) -> Dataset {
        Dataset {
            clip: Arc::new(HashMap::new()),
            ..self.clone()
        }
    }

    fn with_clip(&self, clip: HashMap<PathBuf, usize>) -> Dataset {
        debug!("Clipping {} shards", clip.len());
        Dataset {
            clip: Arc::new(clip),
            ..self.clone()
        }
    }

    fn with_weights(&self, weights: BTreeMap<PathBuf, f64>) -> Dataset {
        Dataset {
            weights: Some(Arc::new(weights)),
            ..self.clone()
        }
    }
}
