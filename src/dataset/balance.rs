//! Sampling weights and per-shard tile caps.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::{debug, info};

use super::Dataset;
use crate::annotations::AnnotationTable;
use crate::error::DatasetError;
use crate::source::path_to_name;

/// How [`Dataset::balance`] assigns sampling weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceStrategy {
    /// Leave the view unchanged
    None,
    /// Proportional to each shard's tile count
    Tile,
    /// Uniform across shards
    Slide,
    /// Uniform across patients, then across each patient's shards
    Patient,
    /// Uniform across outcome categories
    #[default]
    Category,
}

/// How [`Dataset::clip`] derives per-shard caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipStrategy {
    /// Every shard capped at the smallest shard
    Slide,
    /// Every shard capped at the smallest patient total
    Patient,
    /// Each category shrunk to the smallest category's volume
    Category,
}

impl FromStr for BalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "tile" => Ok(Self::Tile),
            "slide" => Ok(Self::Slide),
            "patient" => Ok(Self::Patient),
            "category" => Ok(Self::Category),
            other => Err(format!("unknown balance strategy '{other}'")),
        }
    }
}

impl FromStr for ClipStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slide" => Ok(Self::Slide),
            "patient" => Ok(Self::Patient),
            "category" => Ok(Self::Category),
            other => Err(format!("unknown clip strategy '{other}'")),
        }
    }
}

impl fmt::Display for BalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Tile => "tile",
            Self::Slide => "slide",
            Self::Patient => "patient",
            Self::Category => "category",
        };
        f.write_str(name)
    }
}

/// Arguments to [`Dataset::clip`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipOptions {
    pub strategy: Option<ClipStrategy>,

    /// Hard cap per shard; `None` or 0 means no cap
    pub max_tiles: Option<usize>,

    /// Annotation columns defining categories
    pub columns: Vec<String>,
}

impl ClipOptions {
    pub fn max_tiles(max_tiles: usize) -> Self {
        Self {
            max_tiles: Some(max_tiles),
            ..Self::default()
        }
    }

    pub fn strategy(strategy: ClipStrategy) -> Self {
        Self {
            strategy: Some(strategy),
            ..Self::default()
        }
    }

    pub fn with_max_tiles(mut self, max_tiles: usize) -> Self {
        self.max_tiles = Some(max_tiles);
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }
}

impl Dataset {
    /// Category key of every active shard.
    fn shard_categories(
        &self,
        shards: &[PathBuf],
        columns: &[String],
    ) -> Result<HashMap<PathBuf, String>, DatasetError> {
        shards
            .iter()
            .map(|shard| {
                let slide = path_to_name(shard);
                let row = self
                    .annotations()
                    .row_for_slide(&slide)
                    .ok_or_else(|| DatasetError::UnannotatedSlide(slide.clone()))?;
                Ok((shard.clone(), AnnotationTable::category_of(row, columns)?))
            })
            .collect()
    }

    /// Patient → active shards.
    fn shards_by_patient(
        &self,
        shards: &[PathBuf],
    ) -> Result<BTreeMap<String, Vec<PathBuf>>, DatasetError> {
        let patients = self.patients()?;
        let mut grouped: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for shard in shards {
            let slide = path_to_name(shard);
            let patient = patients
                .get(&slide)
                .ok_or_else(|| DatasetError::UnannotatedSlide(slide.clone()))?;
            grouped.entry(patient.clone()).or_default().push(shard.clone());
        }
        Ok(grouped)
    }

    /// New view with sampling weights that sum to 1 across shards.
    ///
    /// Category balancing needs categorical columns unless `force` is set.
    pub fn balance(
        &self,
        strategy: BalanceStrategy,
        columns: &[String],
        force: bool,
    ) -> Result<Dataset, DatasetError> {
        if strategy == BalanceStrategy::None {
            return Ok(self.clone());
        }

        let manifest = self.manifest()?;
        let _enter = self.span().enter();
        let shards: Vec<PathBuf> = manifest.keys().cloned().collect();
        if shards.is_empty() {
            return Ok(self.with_weights(BTreeMap::new()));
        }
        let totals: BTreeMap<&PathBuf, usize> =
            manifest.iter().map(|(path, entry)| (path, entry.clipped)).collect();

        let weights: BTreeMap<PathBuf, f64> = match strategy {
            BalanceStrategy::None => unreachable!("handled above"),
            BalanceStrategy::Tile => {
                let sum: usize = totals.values().sum();
                if sum == 0 {
                    return Err(DatasetError::InvalidArgument(
                        "Unable to balance by tile: dataset has no tiles".to_string(),
                    ));
                }
                totals
                    .iter()
                    .map(|(path, total)| ((*path).clone(), *total as f64 / sum as f64))
                    .collect()
            }
            BalanceStrategy::Slide => {
                let weight = 1.0 / shards.len() as f64;
                shards.iter().map(|path| (path.clone(), weight)).collect()
            }
            BalanceStrategy::Patient => {
                let grouped = self.shards_by_patient(&shards)?;
                let num_patients = grouped.len() as f64;
                grouped
                    .values()
                    .flat_map(|members| {
                        let weight = 1.0 / (num_patients * members.len() as f64);
                        members.iter().map(move |path| (path.clone(), weight))
                    })
                    .collect()
            }
            BalanceStrategy::Category => {
                if columns.is_empty() {
                    return Err(DatasetError::InvalidArgument(
                        "columns must be provided to balance by category".to_string(),
                    ));
                }
                if !force {
                    let numeric: Vec<&str> = columns
                        .iter()
                        .map(|c| self.is_float(c).map(|f| (c.as_str(), f)))
                        .collect::<Result<Vec<_>, _>>()?
                        .into_iter()
                        .filter_map(|(c, f)| f.then_some(c))
                        .collect();
                    if !numeric.is_empty() {
                        return Err(DatasetError::NonCategorical(numeric.join(",")));
                    }
                }

                let categories = self.shard_categories(&shards, columns)?;
                let mut slide_counts: BTreeMap<&str, usize> = BTreeMap::new();
                for category in categories.values() {
                    *slide_counts.entry(category.as_str()).or_default() += 1;
                }
                let lowest = slide_counts.values().copied().min().unwrap_or(1);
                let mass: BTreeMap<&str, f64> = slide_counts
                    .iter()
                    .map(|(category, count)| (*category, lowest as f64 / *count as f64))
                    .collect();
                let total_mass: f64 = categories.values().map(|c| mass[c.as_str()]).sum();
                let mut category_tiles: BTreeMap<&str, usize> = BTreeMap::new();
                for (path, category) in &categories {
                    *category_tiles.entry(category.as_str()).or_default() += totals[path];
                }

                // Within a category, weight follows the shard's share of its tiles.
                let raw: BTreeMap<PathBuf, f64> = categories
                    .iter()
                    .map(|(path, category)| {
                        let category = category.as_str();
                        let share = mass[category] * slide_counts[category] as f64 / total_mass;
                        let weight = match category_tiles[category] {
                            0 => share / slide_counts[category] as f64,
                            tiles => share * totals[path] as f64 / tiles as f64,
                        };
                        (path.clone(), weight)
                    })
                    .collect();
                let sum: f64 = raw.values().sum();
                raw.into_iter().map(|(path, w)| (path, w / sum)).collect()
            }
        };

        info!("Balanced {} shards by {}", weights.len(), strategy);
        Ok(self.with_weights(weights))
    }

    /// New view with a per-shard tile cap.
    ///
    /// Category clipping needs columns; columns without a strategy imply
    /// category clipping. With no strategy, columns or cap the view is
    /// returned unchanged.
    pub fn clip(&self, options: &ClipOptions) -> Result<Dataset, DatasetError> {
        let max_tiles = options.max_tiles.filter(|m| *m > 0);
        let strategy = match (options.strategy, options.columns.is_empty()) {
            (Some(ClipStrategy::Category), true) => {
                return Err(DatasetError::InvalidArgument(
                    "columns must be provided if clip strategy is 'category'".to_string(),
                ))
            }
            (None, false) => Some(ClipStrategy::Category),
            (strategy, _) => strategy,
        };
        if strategy.is_none() && max_tiles.is_none() {
            return Ok(self.clone());
        }

        let manifest = self.manifest()?;
        let _enter = self.span().enter();
        let totals: BTreeMap<PathBuf, usize> = manifest
            .into_iter()
            .map(|(path, entry)| (path, entry.total))
            .collect();
        if totals.is_empty() {
            return Ok(self.with_clip(HashMap::new()));
        }
        let cap = |value: usize| max_tiles.map_or(value, |m| value.min(m));

        let clip: HashMap<PathBuf, usize> = match strategy {
            Some(ClipStrategy::Slide) => {
                let value = cap(totals.values().copied().min().unwrap_or(0));
                debug!("Clipping every shard to {} tiles", value);
                totals
                    .iter()
                    .map(|(path, total)| (path.clone(), (*total).min(value)))
                    .collect()
            }
            Some(ClipStrategy::Patient) => {
                let shards: Vec<PathBuf> = totals.keys().cloned().collect();
                let grouped = self.shards_by_patient(&shards)?;
                let per_patient = grouped
                    .values()
                    .map(|members| members.iter().map(|p| totals[p]).sum::<usize>());
                let value = cap(per_patient.min().unwrap_or(0));
                debug!("Clipping every shard to {} tiles (smallest patient)", value);
                totals
                    .iter()
                    .map(|(path, total)| (path.clone(), (*total).min(value)))
                    .collect()
            }
            Some(ClipStrategy::Category) => {
                let shards: Vec<PathBuf> = totals.keys().cloned().collect();
                let categories = self.shard_categories(&shards, &options.columns)?;
                let mut volume: BTreeMap<&str, usize> = BTreeMap::new();
                for (path, category) in &categories {
                    *volume.entry(category.as_str()).or_default() += totals[path];
                }
                let lowest = volume.values().copied().min().unwrap_or(0);
                totals
                    .iter()
                    .map(|(path, total)| {
                        let category_total = volume[categories[path].as_str()];
                        let clipped = if category_total == 0 {
                            0
                        } else {
                            (*total as u128 * lowest as u128 / category_total as u128) as usize
                        };
                        (path.clone(), clipped)
                    })
                    .collect()
            }
            None => {
                let value = max_tiles.unwrap_or(usize::MAX);
                totals
                    .iter()
                    .map(|(path, total)| (path.clone(), (*total).min(value)))
                    .collect()
            }
        };

        Ok(self.with_clip(clip))
    }
}
